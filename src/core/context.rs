/// Tracks which operation is in flight so an interrupt can name it
///
/// A context value is created per run and passed to every operation. Operations
/// enter it with a description and the returned guard clears it on drop, so the
/// slot is empty between targets even when an operation bails out early. Helper
/// containers are registered while they are alive so an interrupted run can still
/// release them.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Phase of a single database operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    Pending,
    ValidatingConfig,
    RunningDump,
    RunningRestore,
    VerifyingArtifact,
    RestartingContainer,
    Done,
    Failed,
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationPhase::Pending => "pending",
            OperationPhase::ValidatingConfig => "validating-config",
            OperationPhase::RunningDump => "running-dump",
            OperationPhase::RunningRestore => "running-restore",
            OperationPhase::VerifyingArtifact => "verifying-artifact",
            OperationPhase::RestartingContainer => "restarting-container",
            OperationPhase::Done => "done",
            OperationPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
struct Current {
    description: String,
    phase: Option<OperationPhase>,
}

#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    current: Arc<Mutex<Option<Current>>>,
    helper: Arc<Mutex<Option<String>>>,
}

/// State of the run at the moment it was interrupted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interrupted {
    pub during: Option<String>,
    /// Helper container still alive when the run was abandoned
    pub helper: Option<String>,
}

impl Interrupted {
    pub fn describe(&self) -> &str {
        self.during.as_deref().unwrap_or("no operation")
    }
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `description` as the operation in flight until the guard is dropped
    pub fn enter(&self, description: impl Into<String>) -> OperationGuard {
        self.replace(Some(Current {
            description: description.into(),
            phase: None,
        }));
        OperationGuard { ctx: self.clone() }
    }

    /// Refine the description of the operation in flight (e.g. a sub-step)
    pub fn describe(&self, description: impl Into<String>) {
        if let Ok(mut current) = self.current.lock() {
            match current.as_mut() {
                Some(c) => c.description = description.into(),
                None => {
                    *current = Some(Current {
                        description: description.into(),
                        phase: None,
                    })
                }
            }
        }
    }

    pub fn set_phase(&self, phase: OperationPhase) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(c) = current.as_mut() {
                c.phase = Some(phase);
            }
        }
    }

    pub fn phase(&self) -> Option<OperationPhase> {
        self.current
            .lock()
            .ok()
            .and_then(|c| c.as_ref().and_then(|c| c.phase))
    }

    /// Human-readable description of the operation in flight, if any
    pub fn current(&self) -> Option<String> {
        let current = self.current.lock().ok()?;
        current.as_ref().map(|c| match c.phase {
            Some(phase) => format!("{} [{}]", c.description, phase),
            None => c.description.clone(),
        })
    }

    /// Register a running helper container until [`Self::clear_helper`]
    pub fn hold_helper(&self, name: impl Into<String>) {
        if let Ok(mut helper) = self.helper.lock() {
            *helper = Some(name.into());
        }
    }

    pub fn clear_helper(&self) {
        if let Ok(mut helper) = self.helper.lock() {
            *helper = None;
        }
    }

    pub fn helper(&self) -> Option<String> {
        self.helper.lock().ok().and_then(|h| h.clone())
    }

    /// Drive `work` until it finishes or `signal` fires. On interrupt the context is
    /// read while `work` is still alive, before its guards run.
    pub async fn run_interruptible<W, S>(&self, work: W, signal: S) -> Result<W::Output, Interrupted>
    where
        W: Future,
        S: Future,
    {
        tokio::select! {
            output = work => Ok(output),
            interrupted = async {
                signal.await;
                Interrupted {
                    during: self.current(),
                    helper: self.helper(),
                }
            } => Err(interrupted),
        }
    }

    fn replace(&self, value: Option<Current>) {
        if let Ok(mut current) = self.current.lock() {
            *current = value;
        }
    }
}

pub struct OperationGuard {
    ctx: OperationContext,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.ctx.replace(None);
    }
}
