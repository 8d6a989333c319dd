use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;

use dockvault::cli::{get_version, DbCli, DbCommands};
use dockvault::core::config::RawDatabaseEntry;
use dockvault::core::notify::sink_for;
use dockvault::core::{DatabaseConfig, DatabaseDumpOrchestrator, OperationContext, ProcessRunner, Reporter};
use dockvault::utils::logging::init_logging;
use dockvault::utils::{EXIT_INVALID_INVOCATION, EXIT_OK, EXIT_OPERATION_FAILED};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DbCli::parse();

    if let Err(e) = init_logging(&cli.log_file) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }
    tracing::info!("db-backup {}", get_version());

    let config = match DatabaseConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(EXIT_INVALID_INVOCATION);
        }
    };

    let reporter = Reporter::new(sink_for(config.webhook_url.as_deref()));
    let timeout = match config.command_timeout() {
        Ok(timeout) => timeout,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(EXIT_INVALID_INVOCATION);
        }
    };
    let orchestrator = DatabaseDumpOrchestrator::new(Arc::new(ProcessRunner::new(timeout)), reporter.clone());
    let ctx = OperationContext::new();

    let work = async {
        match &cli.command {
            DbCommands::List => {
                handle_list(&config);
                EXIT_OK
            }
            DbCommands::Backup => handle_backup(&config, &orchestrator, &ctx).await,
            DbCommands::Restore { name, source } => {
                handle_restore(&config, name, source, &orchestrator, &ctx).await
            }
        }
    };

    let code = match ctx.run_interruptible(work, tokio::signal::ctrl_c()).await {
        Ok(code) => code,
        Err(interrupted) => {
            reporter.error(format!("Interrupted by user during: {}", interrupted.describe()));
            EXIT_OPERATION_FAILED
        }
    };

    reporter.flush().await;
    std::process::exit(code);
}

async fn handle_backup(config: &DatabaseConfig, orchestrator: &DatabaseDumpOrchestrator, ctx: &OperationContext) -> i32 {
    let report = orchestrator.backup_all(config.entries(), ctx).await;

    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(path) => tracing::info!("{}: {}", outcome.name, path.display()),
            Err(e) => tracing::error!("{}: {}", outcome.name, e),
        }
    }
    if !report.failed_restarts.is_empty() {
        tracing::warn!(
            "Containers that failed to restart: {}",
            report.failed_restarts.join(", ")
        );
    }

    EXIT_OK
}

async fn handle_restore(
    config: &DatabaseConfig,
    name: &str,
    source: &Path,
    orchestrator: &DatabaseDumpOrchestrator,
    ctx: &OperationContext,
) -> i32 {
    let entry = match config.find(name) {
        Some(entry) => entry,
        None => {
            tracing::error!("Database '{}' not found in configuration", name);
            println!("Available databases:");
            for available in config.names() {
                println!("  - {}", available);
            }
            return EXIT_INVALID_INVOCATION;
        }
    };

    if !source.exists() {
        tracing::error!("Backup file or directory '{}' does not exist", source.display());
        return EXIT_INVALID_INVOCATION;
    }

    let target = match entry.and_then(|raw| raw.validate()) {
        Ok(target) => target,
        Err(e) => {
            tracing::error!("Invalid configuration for database '{}': {}", name, e);
            return EXIT_INVALID_INVOCATION;
        }
    };

    match orchestrator.restore(&target, source, ctx).await {
        Ok(()) => {
            tracing::info!("Restore completed successfully");
            EXIT_OK
        }
        Err(_) => {
            tracing::error!("Restore failed");
            EXIT_OPERATION_FAILED
        }
    }
}

fn handle_list(config: &DatabaseConfig) {
    println!("{}", "Configured databases".bold());
    println!("{}", "-".repeat(50));

    for (index, entry) in config.entries().into_iter().enumerate() {
        match entry {
            Ok(raw) => print_entry(&raw),
            Err(e) => println!("{} {}", format!("Entry {}:", index + 1).bold(), e.to_string().red()),
        }
        println!("{}", "-".repeat(50));
    }
}

fn print_entry(raw: &RawDatabaseEntry) {
    let or_na = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());
    let port = raw
        .port
        .as_ref()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "N/A".to_string());

    println!("Name:        {}", raw.label().bold());
    println!("Type:        {}", or_na(&raw.kind));
    println!("Host:        {}:{}", or_na(&raw.host), port);
    println!("Database:    {}", or_na(&raw.database));
    println!("Backup path: {}", or_na(&raw.backup_path));
    if let Some(container) = &raw.docker_container {
        let mode = if raw.use_docker_exec { "docker exec" } else { "restart only" };
        println!("Container:   {} ({})", container, mode);
    }

    match raw.validate() {
        Ok(target) => println!("Status:      {} (keeps {} backups)", "valid".green(), target.max_backups),
        Err(e) => println!("Status:      {}", e.to_string().red()),
    }
}
