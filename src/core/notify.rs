/// Best-effort event notification
///
/// Every step of a run is logged locally and forwarded to a sink. The webhook sink
/// posts `{"info": ..}` / `{"error": ..}` documents on a background task; a failed
/// delivery is logged and otherwise ignored.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    pub fn payload(&self) -> serde_json::Value {
        match self.level {
            NotificationLevel::Info => json!({ "info": self.message }),
            NotificationLevel::Error => json!({ "error": self.message }),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Hand an event to the sink. Must not block and must not fail.
    fn deliver(&self, notification: Notification);

    /// Wait (bounded) for deliveries still in flight
    async fn flush(&self) {}
}

/// Sink used when no webhook is configured
pub struct NullNotifier;

#[async_trait]
impl NotificationSink for NullNotifier {
    fn deliver(&self, _notification: Notification) {}
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    pending: Mutex<JoinSet<()>>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("dockvault/{}", env!("CARGO_PKG_VERSION")))
            .timeout(WEBHOOK_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            pending: Mutex::new(JoinSet::new()),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    fn deliver(&self, notification: Notification) {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!("No async runtime available, dropping webhook notification");
            return;
        }

        let client = self.client.clone();
        let url = self.url.clone();
        let task = async move {
            let result = client
                .post(&url)
                .json(&notification.payload())
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match (result, notification.level) {
                (Ok(_), NotificationLevel::Error) => {
                    tracing::info!("Error sent to webhook successfully")
                }
                (Ok(_), NotificationLevel::Info) => {}
                (Err(e), _) => tracing::warn!("Failed to send notification to webhook: {}", e),
            }
        };

        match self.pending.lock() {
            Ok(mut pending) => {
                while pending.try_join_next().is_some() {}
                pending.spawn(task);
            }
            Err(_) => tracing::warn!("Webhook dispatcher poisoned, dropping notification"),
        }
    }

    async fn flush(&self) {
        let mut pending = match self.pending.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };

        let drained = tokio::time::timeout(WEBHOOK_TIMEOUT, async {
            while pending.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!("Gave up waiting for {} webhook deliveries", pending.len());
        }
    }
}

/// Builds the sink for an optional webhook URL
pub fn sink_for(webhook_url: Option<&str>) -> Arc<dyn NotificationSink> {
    match webhook_url.filter(|url| !url.trim().is_empty()) {
        Some(url) => match WebhookNotifier::new(url) {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                tracing::warn!("Webhook disabled, failed to build HTTP client: {}", e);
                Arc::new(NullNotifier)
            }
        },
        None => Arc::new(NullNotifier),
    }
}

/// Logs every event locally and forwards it to the sink
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn NotificationSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub fn silent() -> Self {
        Self::new(Arc::new(NullNotifier))
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("INFO: {}", message);
        self.sink.deliver(Notification {
            level: NotificationLevel::Info,
            message,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("ERROR: {}", message);
        self.sink.deliver(Notification {
            level: NotificationLevel::Error,
            message,
        });
    }

    pub async fn flush(&self) {
        self.sink.flush().await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Captures notifications for assertions
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<Notification>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<Notification> {
            self.events.lock().unwrap().clone()
        }

        pub fn errors(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter(|n| n.level == NotificationLevel::Error)
                .map(|n| n.message)
                .collect()
        }

        pub fn infos(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter(|n| n.level == NotificationLevel::Info)
                .map(|n| n.message)
                .collect()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn deliver(&self, notification: Notification) {
            self.events.lock().unwrap().push(notification);
        }
    }

    pub fn recording_reporter() -> (Reporter, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (Reporter::new(sink.clone()), sink)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::recording_reporter;
    use super::*;

    #[test]
    fn test_payload_shape() {
        let info = Notification {
            level: NotificationLevel::Info,
            message: "done".to_string(),
        };
        assert_eq!(info.payload(), json!({ "info": "done" }));

        let error = Notification {
            level: NotificationLevel::Error,
            message: "failed".to_string(),
        };
        assert_eq!(error.payload(), json!({ "error": "failed" }));
    }

    #[test]
    fn test_reporter_forwards_to_sink() {
        let (reporter, sink) = recording_reporter();
        reporter.info("Starting backup");
        reporter.error("Volume data not found");

        assert_eq!(sink.infos(), vec!["Starting backup".to_string()]);
        assert_eq!(sink.errors(), vec!["Volume data not found".to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_never_fails_caller() {
        // Port 9 (discard) on loopback is expected to refuse connections
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook").unwrap();
        let reporter = Reporter::new(Arc::new(notifier));
        reporter.error("something broke");
        reporter.flush().await;
    }

    #[tokio::test]
    async fn test_finished_deliveries_are_reaped() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook").unwrap();
        let event = |message: &str| Notification {
            level: NotificationLevel::Info,
            message: message.to_string(),
        };

        for i in 0..3 {
            notifier.deliver(event(&format!("step {}", i)));
        }
        // refused connections fail right away
        tokio::time::sleep(Duration::from_millis(500)).await;

        notifier.deliver(event("next"));
        assert_eq!(notifier.pending.lock().unwrap().len(), 1);
        notifier.flush().await;
    }

    #[test]
    fn test_blank_webhook_url_uses_null_sink() {
        let sink = sink_for(Some("   "));
        sink.deliver(Notification {
            level: NotificationLevel::Info,
            message: "ignored".to_string(),
        });
    }
}
