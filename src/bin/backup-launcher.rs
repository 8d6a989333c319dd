use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;

use dockvault::cli::{get_version, LauncherCli};
use dockvault::core::launcher::{launch_detached, LaunchRequest, LaunchStatus};
use dockvault::core::ProcessRunner;
use dockvault::utils::logging::init_stderr_logging;
use dockvault::utils::{EXIT_OK, EXIT_OPERATION_FAILED};

const DB_BACKUP_BINARY: &str = "db-backup";
const RUNNING_PATTERN: &str = "db-backup backup";

/// `db-backup` installed next to this executable
fn sibling_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Cannot locate the launcher executable")?;
    let dir = exe
        .parent()
        .context("Launcher executable has no parent directory")?;
    Ok(dir.join(DB_BACKUP_BINARY))
}

fn print_status(status: &LaunchStatus) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, status)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = LauncherCli::parse();

    if let Err(e) = init_stderr_logging() {
        eprintln!("Failed to initialize logging: {:#}", e);
    }
    tracing::info!("backup-launcher {}", get_version());

    let program = match cli.program.clone() {
        Some(program) => Ok(program),
        None => sibling_binary(),
    };
    let program = match program {
        Ok(program) => program,
        Err(e) => {
            print_status(&LaunchStatus::error(format!("{:#}", e)))?;
            std::process::exit(EXIT_OPERATION_FAILED);
        }
    };

    let working_dir = std::env::current_dir().context("Cannot read the working directory")?;
    let request = LaunchRequest {
        program,
        args: vec![
            "backup".to_string(),
            "--config".to_string(),
            cli.config.display().to_string(),
        ],
        working_dir,
        log_file: cli.log_file.clone(),
        running_pattern: RUNNING_PATTERN.to_string(),
        follow: cli.follow,
    };

    // pgrep should answer instantly; the bound only guards against a wedged system
    let runner = ProcessRunner::new(std::time::Duration::from_secs(10));
    let (status, drain) = launch_detached(&runner, &request).await;
    print_status(&status)?;

    if let Some(drain) = drain {
        if let Err(e) = drain.await {
            tracing::warn!("Output copy task failed: {}", e);
        }
    }

    std::process::exit(if status.is_success() {
        EXIT_OK
    } else {
        EXIT_OPERATION_FAILED
    });
}
