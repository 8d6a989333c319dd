/// External command execution with a hard timeout
///
/// Database clients and `docker` CLI calls run through [`CommandRunner`]. Secret
/// arguments are masked whenever a command line is logged.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::core::error::{BackupError, BackupResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArg {
    Plain(String),
    /// Never written to logs
    Secret(String),
}

impl CommandArg {
    pub fn value(&self) -> &str {
        match self {
            CommandArg::Plain(v) | CommandArg::Secret(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<CommandArg>,
    /// Extra environment for the child; values are never logged
    pub env: Vec<(String, String)>,
    /// Feed this file to the child's stdin
    pub stdin: Option<PathBuf>,
    /// Redirect the child's stdout into this file
    pub stdout: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            stdout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(CommandArg::Plain(arg.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(args.into_iter().map(|a| CommandArg::Plain(a.into())));
        self
    }

    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(CommandArg::Secret(arg.into()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin_from(mut self, path: impl AsRef<Path>) -> Self {
        self.stdin = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn stdout_to(mut self, path: impl AsRef<Path>) -> Self {
        self.stdout = Some(path.as_ref().to_path_buf());
        self
    }

    /// Plain argument values, secrets excluded
    pub fn plain_args(&self) -> Vec<&str> {
        self.args
            .iter()
            .filter_map(|a| match a {
                CommandArg::Plain(v) => Some(v.as_str()),
                CommandArg::Secret(_) => None,
            })
            .collect()
    }

    pub fn argv(&self) -> Vec<&str> {
        self.args.iter().map(CommandArg::value).collect()
    }
}

/// Loggable rendition of the command line
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            match arg {
                CommandArg::Plain(v) => write!(f, " {}", v)?,
                CommandArg::Secret(_) => f.write_str(" ****")?,
            }
        }
        if let Some(stdin) = &self.stdin {
            write!(f, " < {}", stdin.display())?;
        }
        if let Some(stdout) = &self.stdout {
            write!(f, " > {}", stdout.display())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn ok() -> Self {
        Self {
            exit_code: Some(0),
            ..Default::default()
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// Turn a non-zero exit into a runtime error carrying the diagnostics
    pub fn into_result(self, spec: &CommandSpec) -> BackupResult<Self> {
        if self.success() {
            return Ok(self);
        }

        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };

        Err(BackupError::Runtime(format!(
            "{} exited with {}: {}",
            spec.program, code, detail
        )))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is reported in the output, not as an error;
    /// spawn failures and timeouts are errors.
    async fn run(&self, spec: &CommandSpec) -> BackupResult<CommandOutput>;
}

pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> BackupResult<CommandOutput> {
        tracing::info!("Running command: {}", spec);

        let mut cmd = Command::new(&spec.program);
        cmd.args(spec.argv())
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match &spec.stdin {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        match &spec.stdout {
            Some(path) => {
                let file = std::fs::File::create(path)?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BackupError::not_found("program", &spec.program),
            _ => BackupError::Io(e),
        })?;

        // Dropping the child on timeout kills it
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                tracing::error!("Timeout while running command: {}", spec);
                return Err(BackupError::Timeout {
                    operation: spec.program.clone(),
                    after: self.timeout,
                });
            }
        };

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if result.success() {
            tracing::info!("Command finished: {}", spec.program);
            if !result.stdout.is_empty() {
                tracing::debug!("stdout: {}", result.stdout);
            }
        } else {
            tracing::error!("Command failed: {}", spec);
            tracing::error!("Exit code: {:?}", result.exit_code);
            if !result.stderr.is_empty() {
                tracing::error!("stderr: {}", result.stderr.trim());
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_display_masks_secrets() {
        let spec = CommandSpec::new("docker")
            .args(["exec", "-i", "db", "mariadb-dump", "-u", "root"])
            .secret_arg("-phunter2")
            .arg("shop")
            .env("MYSQL_PWD", "hunter2")
            .stdout_to("/backups/shop.sql");

        let shown = spec.to_string();
        assert_eq!(
            shown,
            "docker exec -i db mariadb-dump -u root **** shop > /backups/shop.sql"
        );
        assert!(!shown.contains("hunter2"));
        assert!(spec.argv().contains(&"-phunter2"));
        assert!(!spec.plain_args().contains(&"-phunter2"));
    }

    #[test]
    fn test_into_result_prefers_stderr() {
        let spec = CommandSpec::new("pg_dump");
        let err = CommandOutput::failed(1, "connection refused\n")
            .into_result(&spec)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "runtime invocation failed: pg_dump exited with 1: connection refused"
        );
        assert!(CommandOutput::ok().into_result(&spec).is_ok());
    }

    #[tokio::test]
    async fn test_runner_redirects_stdout_to_file() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.txt");
        let runner = ProcessRunner::new(Duration::from_secs(10));

        let spec = CommandSpec::new("sh")
            .args(["-c", "printf hello"])
            .stdout_to(&out);
        let result = runner.run(&spec).await.unwrap();

        assert!(result.success());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_runner_passes_env_and_stdin() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "from-stdin").unwrap();
        let runner = ProcessRunner::new(Duration::from_secs(10));

        let spec = CommandSpec::new("sh")
            .args(["-c", "cat; printf \" $PGPASSWORD\""])
            .env("PGPASSWORD", "secret")
            .stdin_from(&input);
        let result = runner.run(&spec).await.unwrap();

        assert_eq!(result.stdout, "from-stdin secret");
    }

    #[tokio::test]
    async fn test_runner_reports_failure_and_missing_program() {
        let runner = ProcessRunner::new(Duration::from_secs(10));

        let result = runner
            .run(&CommandSpec::new("sh").args(["-c", "echo nope >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr.trim(), "nope");

        let err = runner
            .run(&CommandSpec::new("definitely-not-a-real-binary-xyz"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_runner_enforces_timeout() {
        let runner = ProcessRunner::new(Duration::from_millis(200));
        let err = runner
            .run(&CommandSpec::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Timeout { .. }));
    }
}
