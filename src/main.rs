use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use dockvault::cli::{get_version, DockerCli, DockerCommands};
use dockvault::core::notify::sink_for;
use dockvault::core::{
    ContainerLifecycleController, ContainerRuntime, ContainerSnapshotArchiver, DockerBackupConfig,
    DockerManager, OperationContext, Reporter, VolumeArchiver,
};
use dockvault::utils::logging::init_logging;
use dockvault::utils::{EXIT_INVALID_INVOCATION, EXIT_OK, EXIT_OPERATION_FAILED};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DockerCli::parse();

    if let Err(e) = init_logging(&cli.log_file) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }
    tracing::info!("backup-dockers {}", get_version());

    let config = match DockerBackupConfig::load(cli.command.config()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(EXIT_INVALID_INVOCATION);
        }
    };

    let reporter = Reporter::new(sink_for(config.webhook_url.as_deref()));
    let ctx = OperationContext::new();

    let code = run(&cli.command, &config, &reporter, &ctx).await;

    reporter.flush().await;
    std::process::exit(code);
}

async fn run(command: &DockerCommands, config: &DockerBackupConfig, reporter: &Reporter, ctx: &OperationContext) -> i32 {
    let policy = match config.lifecycle.policy() {
        Ok(policy) => policy,
        Err(e) => {
            reporter.error(e.to_string());
            return EXIT_INVALID_INVOCATION;
        }
    };

    let docker = match DockerManager::new() {
        Ok(docker) => docker,
        Err(e) => {
            reporter.error(format!("{:#}", e));
            return EXIT_OPERATION_FAILED;
        }
    };
    if !docker.check_docker().await {
        reporter.error("Docker daemon is not reachable");
        return EXIT_OPERATION_FAILED;
    }

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    let lifecycle = ContainerLifecycleController::new(runtime.clone(), reporter.clone(), policy);
    let volumes = VolumeArchiver::new(runtime.clone(), reporter.clone());
    let snapshots = ContainerSnapshotArchiver::new(runtime, reporter.clone(), lifecycle);

    let work = async {
        match command {
            DockerCommands::Backup { .. } => handle_backup(config, &volumes, &snapshots, reporter, ctx).await,
            DockerCommands::Restore { .. } => handle_restore(config, &volumes, &snapshots, reporter, ctx).await,
        }
    };

    match ctx.run_interruptible(work, tokio::signal::ctrl_c()).await {
        Ok(code) => code,
        Err(interrupted) => {
            reporter.error(format!("Interrupted by user during: {}", interrupted.describe()));
            if let Some(helper) = &interrupted.helper {
                volumes.release_helper(helper).await;
            }
            EXIT_OPERATION_FAILED
        }
    }
}

/// Volumes first, then containers, each in configured order. Failures are reported
/// per item and never stop the batch.
async fn handle_backup(
    config: &DockerBackupConfig,
    volumes: &VolumeArchiver,
    snapshots: &ContainerSnapshotArchiver,
    reporter: &Reporter,
    ctx: &OperationContext,
) -> i32 {
    reporter.info(format!(
        "Starting backup process: {} volumes, {} containers",
        config.volumes.len(),
        config.containers.len()
    ));

    if let Err(e) = tokio::fs::create_dir_all(&config.backup_dir).await {
        reporter.error(format!(
            "Cannot create backup directory {}: {}",
            config.backup_dir.display(),
            e
        ));
        return EXIT_OPERATION_FAILED;
    }

    let mut succeeded = 0;
    let total = config.volumes.len() + config.containers.len();

    for (i, volume) in config.volumes.iter().enumerate() {
        reporter.info(format!(
            "Processing volume {}/{}: {}",
            i + 1,
            config.volumes.len(),
            volume
        ));
        let dest = config.artifact_path(volume);
        if volumes.backup_volume(volume, &dest, ctx).await.is_ok() {
            succeeded += 1;
        }
    }

    for (i, container) in config.containers.iter().enumerate() {
        reporter.info(format!(
            "Processing container {}/{}: {}",
            i + 1,
            config.containers.len(),
            container
        ));
        let dest = config.artifact_path(container);
        if snapshots.backup_container(container, &dest, ctx).await.is_ok() {
            succeeded += 1;
        }
    }

    reporter.info(format!(
        "Backup process finished: {}/{} succeeded",
        succeeded, total
    ));
    EXIT_OK
}

/// Same order as the backup. Any failed item makes the run exit non-zero.
async fn handle_restore(
    config: &DockerBackupConfig,
    volumes: &VolumeArchiver,
    snapshots: &ContainerSnapshotArchiver,
    reporter: &Reporter,
    ctx: &OperationContext,
) -> i32 {
    reporter.info(format!(
        "Starting restore process: {} volumes, {} containers",
        config.volumes.len(),
        config.containers.len()
    ));

    let mut failed = Vec::new();

    for (i, volume) in config.volumes.iter().enumerate() {
        reporter.info(format!(
            "Restoring volume {}/{}: {}",
            i + 1,
            config.volumes.len(),
            volume
        ));
        let src = config.artifact_path(volume);
        if volumes.restore_volume(volume, &src, ctx).await.is_err() {
            failed.push(volume.as_str());
        }
    }

    for (i, container) in config.containers.iter().enumerate() {
        reporter.info(format!(
            "Restoring container {}/{}: {}",
            i + 1,
            config.containers.len(),
            container
        ));
        let src = config.artifact_path(container);
        if snapshots.restore_container(container, &src, ctx).await.is_err() {
            failed.push(container.as_str());
        }
    }

    if failed.is_empty() {
        reporter.info("Restore process finished successfully");
        EXIT_OK
    } else {
        reporter.error(format!(
            "Restore process finished with failures: {}",
            failed.join(", ")
        ));
        EXIT_OPERATION_FAILED
    }
}
