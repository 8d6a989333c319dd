/// Fire-and-forget start of a database backup run
///
/// The run is started as an independent process in its own process group with its
/// output appended to a log file, so the caller gets a status document right away.
/// A run that is already in progress is detected with `pgrep -f` and not duplicated.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::core::process::{CommandRunner, CommandSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchState {
    Started,
    AlreadyRunning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcessIds {
    One(u32),
    Many(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchStatus {
    pub status: LaunchState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<ProcessIds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    pub timestamp: String,
}

impl LaunchStatus {
    fn new(status: LaunchState, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            pid: None,
            log_file: None,
            timestamp: Local::now().to_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LaunchState::Error, message)
    }

    /// Started and already-running both count as success
    pub fn is_success(&self) -> bool {
        self.status != LaunchState::Error
    }
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub log_file: PathBuf,
    /// Command-line fragment identifying a run in progress
    pub running_pattern: String,
    /// Keep the launcher attached and copy the run's output into the log itself
    pub follow: bool,
}

/// PIDs of processes whose command line matches `pattern`
pub async fn running_instances(runner: &dyn CommandRunner, pattern: &str) -> Vec<u32> {
    let spec = CommandSpec::new("pgrep").args(["-f", pattern]);
    match runner.run(&spec).await {
        Ok(output) if output.success() => output
            .stdout
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect(),
        Ok(_) => Vec::new(),
        Err(e) => {
            tracing::warn!("Could not check for a running backup: {}", e);
            Vec::new()
        }
    }
}

async fn write_header(log_file: &Path) -> std::io::Result<()> {
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .await?;
    let rule = "=".repeat(50);
    let header = format!(
        "\n{}\nBackup started at: {}\n{}\n",
        rule,
        Local::now().to_rfc3339(),
        rule
    );
    log.write_all(header.as_bytes()).await?;
    log.flush().await
}

fn spawn_child(request: &LaunchRequest) -> std::io::Result<Child> {
    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .current_dir(&request.working_dir)
        .stdin(Stdio::null());

    if request.follow {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_file)?;
        cmd.stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
    }

    // Detach from the caller's process group so its signals do not reach the run
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn()
}

/// Copy stdout and stderr of `child` into `log_file` line by line until both close
async fn drain_output(mut child: Child, log_file: PathBuf) {
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return;
    };

    let mut log = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .await
    {
        Ok(log) => log,
        Err(e) => {
            tracing::error!("Cannot open {}: {}", log_file.display(), e);
            return;
        }
    };

    let mut out = BufReader::new(stdout).lines();
    let mut err = BufReader::new(stderr).lines();
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        let line = tokio::select! {
            line = out.next_line(), if out_open => match line {
                Ok(Some(line)) => Some(line),
                _ => { out_open = false; None }
            },
            line = err.next_line(), if err_open => match line {
                Ok(Some(line)) => Some(line),
                _ => { err_open = false; None }
            },
        };

        if let Some(line) = line {
            if let Err(e) = log.write_all(format!("{}\n", line).as_bytes()).await {
                tracing::error!("Failed to write to {}: {}", log_file.display(), e);
                break;
            }
        }
    }

    let _ = log.flush().await;
    match child.wait().await {
        Ok(status) => tracing::info!("Backup run finished with {}", status),
        Err(e) => tracing::warn!("Failed to wait for backup run: {}", e),
    }
}

/// Start the run described by `request`. The handle is set when `follow` is on and
/// completes once the run's output is fully copied.
pub async fn launch_detached(
    runner: &dyn CommandRunner,
    request: &LaunchRequest,
) -> (LaunchStatus, Option<JoinHandle<()>>) {
    let running = running_instances(runner, &request.running_pattern).await;
    if !running.is_empty() {
        let mut status = LaunchStatus::new(LaunchState::AlreadyRunning, "Backup is already running");
        status.pid = Some(ProcessIds::Many(running));
        return (status, None);
    }

    if let Err(e) = write_header(&request.log_file).await {
        return (
            LaunchStatus::error(format!(
                "Failed to write log file {}: {}",
                request.log_file.display(),
                e
            )),
            None,
        );
    }

    let child = match spawn_child(request) {
        Ok(child) => child,
        Err(e) => {
            return (
                LaunchStatus::error(format!("Failed to start backup: {}", e)),
                None,
            )
        }
    };

    let mut status = LaunchStatus::new(LaunchState::Started, "Backup started successfully in background");
    status.pid = child.id().map(ProcessIds::One);
    status.log_file = Some(request.log_file.clone());
    tracing::info!(
        "Started {} (pid {:?}), output in {}",
        request.program.display(),
        child.id(),
        request.log_file.display()
    );

    let drain = if request.follow {
        Some(tokio::spawn(drain_output(child, request.log_file.clone())))
    } else {
        None
    };

    (status, drain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::process::{CommandOutput, MockCommandRunner};
    use tempfile::TempDir;

    fn not_running() -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.program == "pgrep")
            .returning(|_| Ok(CommandOutput::failed(1, "")));
        runner
    }

    fn request(dir: &TempDir, script: &str, follow: bool) -> LaunchRequest {
        LaunchRequest {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: dir.path().to_path_buf(),
            log_file: dir.path().join("async_backup.log"),
            running_pattern: "db-backup backup".to_string(),
            follow,
        }
    }

    #[test]
    fn test_status_document_shape() {
        let mut status = LaunchStatus::new(LaunchState::AlreadyRunning, "Backup is already running");
        status.pid = Some(ProcessIds::Many(vec![41, 42]));

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "already_running");
        assert_eq!(value["pid"], serde_json::json!([41, 42]));
        assert!(value.get("log_file").is_none());
        assert!(status.is_success());
        assert!(!LaunchStatus::error("boom").is_success());
    }

    #[tokio::test]
    async fn test_existing_run_is_not_duplicated() {
        let dir = TempDir::new().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|_| {
            Ok(CommandOutput {
                exit_code: Some(0),
                stdout: "1234\n5678\n".to_string(),
                stderr: String::new(),
            })
        });

        let req = request(&dir, "echo should-not-run", false);
        let (status, drain) = launch_detached(&runner, &req).await;

        assert_eq!(status.status, LaunchState::AlreadyRunning);
        assert_eq!(status.pid, Some(ProcessIds::Many(vec![1234, 5678])));
        assert!(drain.is_none());
        assert!(!req.log_file.exists());
    }

    #[tokio::test]
    async fn test_followed_run_output_lands_in_log() {
        let dir = TempDir::new().unwrap();
        let runner = not_running();
        let req = request(&dir, "echo from-stdout; echo from-stderr >&2", true);

        let (status, drain) = launch_detached(&runner, &req).await;
        assert_eq!(status.status, LaunchState::Started);
        assert!(matches!(status.pid, Some(ProcessIds::One(_))));
        drain.unwrap().await.unwrap();

        let log = std::fs::read_to_string(&req.log_file).unwrap();
        assert!(log.contains("Backup started at:"));
        assert!(log.contains("from-stdout"));
        assert!(log.contains("from-stderr"));
    }

    #[tokio::test]
    async fn test_missing_program_reports_error() {
        let dir = TempDir::new().unwrap();
        let runner = not_running();
        let mut req = request(&dir, "", false);
        req.program = dir.path().join("no-such-binary");

        let (status, drain) = launch_detached(&runner, &req).await;
        assert_eq!(status.status, LaunchState::Error);
        assert!(status.message.starts_with("Failed to start backup"));
        assert!(drain.is_none());
    }
}
