/// Container stop state machine
///
/// Drives a running container to a stopped state before it is removed or replaced.
/// Each attempt issues a graceful stop and then polls the status for a bounded time;
/// when every graceful attempt fails the container is killed. Runtime errors during
/// the graceful phase are reported and retried, never propagated, so the caller
/// always gets a definitive stopped / not stopped answer.

use humantime::format_duration;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::core::docker::ContainerRuntime;
use crate::core::notify::Reporter;
use crate::utils::{
    DEFAULT_MAX_WAIT, DEFAULT_POLL_INTERVAL, DEFAULT_STOP_COOLDOWN, DEFAULT_STOP_RETRIES,
    DEFAULT_STOP_TIMEOUT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Graceful attempts before escalating to kill
    pub max_retries: u32,
    /// Grace period handed to the engine with each stop request
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
    /// Polling budget per attempt
    pub max_wait: Duration,
    /// Pause after a rejected stop request
    pub cooldown: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_STOP_RETRIES,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
            cooldown: DEFAULT_STOP_COOLDOWN,
        }
    }
}

impl LifecyclePolicy {
    /// Worst-case time spent before the kill is issued, ignoring engine latency
    pub fn worst_case(&self) -> Duration {
        (self.stop_timeout + self.max_wait + self.cooldown) * self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Stopped,
    TimedOut,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleAttemptRecord {
    pub attempt: u32,
    pub requested_timeout: Duration,
    pub waited: Duration,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResolution {
    /// A graceful attempt observed a terminal status
    Graceful { attempt: u32 },
    /// Every graceful attempt failed and the kill succeeded
    Forced,
    /// The kill failed as well
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub attempts: Vec<LifecycleAttemptRecord>,
    pub resolution: StopResolution,
}

impl StopReport {
    pub fn stopped(&self) -> bool {
        !matches!(self.resolution, StopResolution::Failed)
    }
}

#[derive(Clone)]
pub struct ContainerLifecycleController {
    runtime: Arc<dyn ContainerRuntime>,
    reporter: Reporter,
    policy: LifecyclePolicy,
}

impl ContainerLifecycleController {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, reporter: Reporter, policy: LifecyclePolicy) -> Self {
        Self {
            runtime,
            reporter,
            policy,
        }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Returns true once the container is stopped, gracefully or by force
    pub async fn stop_container(&self, name: &str) -> bool {
        self.drive_to_stopped(name).await.stopped()
    }

    pub async fn drive_to_stopped(&self, name: &str) -> StopReport {
        let policy = self.policy;
        let mut attempts = Vec::with_capacity(policy.max_retries as usize);
        tracing::info!("Attempting to stop container: {}", name);

        for attempt in 1..=policy.max_retries {
            self.reporter.info(format!(
                "Stop attempt {}/{} for container {}",
                attempt, policy.max_retries, name
            ));

            if let Err(e) = self.runtime.stop_container(name, policy.stop_timeout).await {
                self.reporter.error(format!(
                    "Stop attempt {} for container {} failed: {}",
                    attempt, name, e
                ));
                attempts.push(LifecycleAttemptRecord {
                    attempt,
                    requested_timeout: policy.stop_timeout,
                    waited: Duration::ZERO,
                    outcome: AttemptOutcome::Error(e.to_string()),
                });

                self.reporter.info(format!(
                    "Waiting {} before retrying to stop container {}",
                    format_duration(policy.cooldown),
                    name
                ));
                sleep(policy.cooldown).await;
                continue;
            }

            let record = self.poll_until_stopped(name, attempt).await;
            match &record.outcome {
                AttemptOutcome::Stopped => {
                    tracing::info!(
                        "Container {} stopped successfully after {}",
                        name,
                        format_duration(record.waited)
                    );
                    attempts.push(record);
                    return StopReport {
                        attempts,
                        resolution: StopResolution::Graceful { attempt },
                    };
                }
                AttemptOutcome::TimedOut => self.reporter.error(format!(
                    "Container {} did not stop within {}, attempt {}",
                    name,
                    format_duration(policy.max_wait),
                    attempt
                )),
                AttemptOutcome::Error(e) => self.reporter.error(format!(
                    "Checking status of container {} failed on attempt {}: {}",
                    name, attempt, e
                )),
            }
            attempts.push(record);
        }

        tracing::warn!("Force killing container {}", name);
        let resolution = match self.runtime.kill_container(name).await {
            Ok(()) => {
                self.reporter.error(format!(
                    "Forced container {} to stop with kill after {} failed stop attempts",
                    name, policy.max_retries
                ));
                StopResolution::Forced
            }
            Err(e) => {
                self.reporter
                    .error(format!("Failed to force-stop container {}: {}", name, e));
                StopResolution::Failed
            }
        };

        StopReport {
            attempts,
            resolution,
        }
    }

    async fn poll_until_stopped(&self, name: &str, attempt: u32) -> LifecycleAttemptRecord {
        let policy = self.policy;
        let started = Instant::now();
        let mut waited = Duration::ZERO;

        let outcome = loop {
            if waited >= policy.max_wait {
                break AttemptOutcome::TimedOut;
            }

            match self.runtime.container_status(name).await {
                Ok(status) if status.is_terminal() => break AttemptOutcome::Stopped,
                Ok(status) => {
                    tracing::debug!("Container {} is {} ({} waited)", name, status.as_str(), format_duration(waited));
                }
                // Gone entirely, e.g. auto-removed on exit
                Err(e) if e.is_not_found() => break AttemptOutcome::Stopped,
                Err(e) => break AttemptOutcome::Error(e.to_string()),
            }

            sleep(policy.poll_interval).await;
            waited += policy.poll_interval;
        };

        LifecycleAttemptRecord {
            attempt,
            requested_timeout: policy.stop_timeout,
            waited: started.elapsed().max(waited),
            outcome,
        }
    }
}
