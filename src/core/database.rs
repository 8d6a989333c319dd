/// Database dump and restore orchestration
///
/// Each operation walks `pending -> validating-config -> running-dump|running-restore
/// -> verifying-artifact -> restarting-container -> done|failed`, recording the phase
/// in the operation context. Failures are reported and returned to the caller; a
/// batch run keeps going past failed entries.

use chrono::Local;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::artifact::discard_partial;
use crate::core::config::RawDatabaseEntry;
use crate::core::context::{OperationContext, OperationPhase};
use crate::core::engine::{CommandPlan, DatabaseTarget, EngineKind};
use crate::core::error::{BackupError, BackupResult};
use crate::core::notify::Reporter;
use crate::core::process::{CommandRunner, CommandSpec};
use crate::core::retention;
use crate::utils::{backup_timestamp, format_bytes, RESTART_GRACE_SECS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub name: String,
    /// Artifact path on success, the reported error otherwise
    pub result: Result<PathBuf, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<TargetOutcome>,
    /// Containers restarted after the batch, in first-seen order
    pub restarted: Vec<String>,
    pub failed_restarts: Vec<String>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }
}

#[derive(Clone)]
pub struct DatabaseDumpOrchestrator {
    runner: Arc<dyn CommandRunner>,
    reporter: Reporter,
}

impl DatabaseDumpOrchestrator {
    pub fn new(runner: Arc<dyn CommandRunner>, reporter: Reporter) -> Self {
        Self { runner, reporter }
    }

    /// Run `plan.steps` in order, stopping at the first failure, then the cleanup steps
    async fn execute(&self, plan: &CommandPlan) -> BackupResult<()> {
        let mut result = Ok(());
        for step in &plan.steps {
            if let Err(e) = self.run_checked(step).await {
                result = Err(e);
                break;
            }
        }

        for step in &plan.cleanup {
            if let Err(e) = self.run_checked(step).await {
                tracing::warn!("Cleanup step failed ({}): {}", step, e);
            }
        }

        result
    }

    async fn run_checked(&self, spec: &CommandSpec) -> BackupResult<()> {
        self.runner.run(spec).await?.into_result(spec)?;
        Ok(())
    }

    /// Dump `target` into a new timestamped artifact, then apply retention
    pub async fn backup(&self, target: &DatabaseTarget, ctx: &OperationContext) -> BackupResult<PathBuf> {
        let _guard = ctx.enter(format!("backup of database {}", target.name));
        ctx.set_phase(OperationPhase::Pending);

        match self.backup_inner(target, ctx).await {
            Ok((artifact, size)) => {
                ctx.set_phase(OperationPhase::Done);
                self.reporter.info(format!(
                    "Backup of database {} completed: {} ({})",
                    target.name,
                    artifact.display(),
                    format_bytes(size)
                ));
                Ok(artifact)
            }
            Err(e) => {
                ctx.set_phase(OperationPhase::Failed);
                self.reporter
                    .error(format!("Backup of database {} failed: {}", target.name, e));
                Err(e)
            }
        }
    }

    async fn backup_inner(&self, target: &DatabaseTarget, ctx: &OperationContext) -> BackupResult<(PathBuf, u64)> {
        ctx.set_phase(OperationPhase::ValidatingConfig);
        tokio::fs::create_dir_all(&target.backup_path).await?;

        let stamp = backup_timestamp(Local::now());
        let artifact = target
            .backup_path
            .join(target.engine.artifact_name(&target.database, &stamp));

        ctx.set_phase(OperationPhase::RunningDump);
        tracing::info!(
            "Backing up {} database {} to {}",
            target.engine,
            target.database,
            artifact.display()
        );
        let plan = target.engine.dump_plan(target, &artifact);
        if let Err(e) = self.execute(&plan).await {
            discard_partial(&artifact).await;
            return Err(e);
        }

        ctx.set_phase(OperationPhase::VerifyingArtifact);
        let size = match verify_artifact(target.engine, &artifact, &target.database).await {
            Ok(size) => size,
            Err(e) => {
                discard_partial(&artifact).await;
                return Err(e);
            }
        };

        match retention::prune(&target.backup_path, &target.database, target.max_backups) {
            Ok(removed) if !removed.is_empty() => self.reporter.info(format!(
                "Removed {} old backups of database {}",
                removed.len(),
                target.database
            )),
            Ok(_) => {}
            Err(e) => tracing::error!(
                "Failed to prune old backups of database {}: {}",
                target.database,
                e
            ),
        }

        Ok((artifact, size))
    }

    /// Load `source` into `target`, restarting the referenced container afterwards
    pub async fn restore(&self, target: &DatabaseTarget, source: &Path, ctx: &OperationContext) -> BackupResult<()> {
        let _guard = ctx.enter(format!("restore of database {}", target.name));
        ctx.set_phase(OperationPhase::ValidatingConfig);

        if let Err(e) = check_restore_source(target, source) {
            ctx.set_phase(OperationPhase::Failed);
            self.reporter
                .error(format!("Restore of database {} aborted: {}", target.name, e));
            return Err(e);
        }

        ctx.set_phase(OperationPhase::RunningRestore);
        self.reporter.info(format!(
            "Restoring {} database {} from {}",
            target.engine,
            target.database,
            source.display()
        ));

        let plan = target.engine.restore_plan(target, source);
        if let Err(e) = self.execute(&plan).await {
            ctx.set_phase(OperationPhase::Failed);
            self.reporter
                .error(format!("Restore of database {} failed: {}", target.name, e));
            return Err(e);
        }

        if let Some(container) = &target.container {
            ctx.set_phase(OperationPhase::RestartingContainer);
            self.restart_container(container).await;
        }

        ctx.set_phase(OperationPhase::Done);
        self.reporter
            .info(format!("Restore of database {} completed", target.name));
        Ok(())
    }

    /// Plain `docker restart`; returns whether it succeeded
    pub async fn restart_container(&self, container: &str) -> bool {
        tracing::info!("Restarting container {}", container);
        let spec = CommandSpec::new("docker")
            .args(["restart", "-t"])
            .arg(RESTART_GRACE_SECS.to_string())
            .arg(container);

        match self.run_checked(&spec).await {
            Ok(()) => {
                self.reporter
                    .info(format!("Container {} restarted", container));
                true
            }
            Err(e) => {
                self.reporter
                    .error(format!("Failed to restart container {}: {}", container, e));
                false
            }
        }
    }

    /// Back up every entry in order, then restart each container referenced by a
    /// successful entry exactly once
    pub async fn backup_all(&self, entries: Vec<BackupResult<RawDatabaseEntry>>, ctx: &OperationContext) -> BatchReport {
        let mut report = BatchReport::default();
        let mut to_restart: Vec<String> = Vec::new();
        let mut artifact_owners: HashMap<(String, PathBuf), String> = HashMap::new();
        let total = entries.len();

        self.reporter
            .info(format!("Starting database backup: {} configured", total));

        for (index, entry) in entries.into_iter().enumerate() {
            let (label, validated) = match entry {
                Ok(raw) => (raw.label().to_string(), raw.validate()),
                Err(e) => (format!("entry {}", index + 1), Err(e)),
            };

            let target = match validated {
                Ok(target) => target,
                Err(e) => {
                    self.reporter.error(format!(
                        "Skipping database {} ({}/{}): {}",
                        label,
                        index + 1,
                        total,
                        e
                    ));
                    report.outcomes.push(TargetOutcome {
                        name: label,
                        result: Err(e.to_string()),
                    });
                    continue;
                }
            };

            // Entries sharing both would overwrite and prune each other's artifacts
            let artifact_key = (target.database.clone(), target.backup_path.clone());
            if let Some(owner) = artifact_owners.get(&artifact_key) {
                let e = BackupError::ConfigValidation(format!(
                    "database {} in {} is already backed up by entry {}",
                    target.database,
                    target.backup_path.display(),
                    owner
                ));
                self.reporter.error(format!(
                    "Skipping database {} ({}/{}): {}",
                    target.name,
                    index + 1,
                    total,
                    e
                ));
                report.outcomes.push(TargetOutcome {
                    name: target.name.clone(),
                    result: Err(e.to_string()),
                });
                continue;
            }
            artifact_owners.insert(artifact_key, target.name.clone());

            self.reporter.info(format!(
                "Starting backup of database {} ({}/{})",
                target.name,
                index + 1,
                total
            ));

            let result = self.backup(&target, ctx).await;
            if result.is_ok() {
                if let Some(container) = &target.container {
                    if !to_restart.contains(container) {
                        to_restart.push(container.clone());
                    }
                }
            }

            report.outcomes.push(TargetOutcome {
                name: target.name.clone(),
                result: result.map_err(|e| e.to_string()),
            });
        }

        for container in to_restart {
            if self.restart_container(&container).await {
                report.restarted.push(container);
            } else {
                report.failed_restarts.push(container);
            }
        }

        self.reporter.info(format!(
            "Database backups finished. Succeeded {}/{}",
            report.succeeded(),
            report.total()
        ));
        if !report.restarted.is_empty() {
            self.reporter.info(format!(
                "Restarted containers: {}",
                report.restarted.join(", ")
            ));
        }

        report
    }
}

/// Non-empty file, or for directory dumps a non-empty `<artifact>/<database>` directory
async fn verify_artifact(engine: EngineKind, artifact: &Path, database: &str) -> BackupResult<u64> {
    let fail = |reason: &str| BackupError::ArtifactVerification {
        path: artifact.to_path_buf(),
        reason: reason.to_string(),
    };

    if engine.produces_directory() {
        let db_dir = artifact.join(database);
        let mut entries = match tokio::fs::read_dir(&db_dir).await {
            Ok(entries) => entries,
            Err(_) => return Err(fail("dump contains no data for the database")),
        };

        let mut size = 0u64;
        let mut count = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            count += 1;
            size += entry.metadata().await.map(|m| m.len()).unwrap_or(0);
        }
        if count == 0 {
            return Err(fail("dump contains no data for the database"));
        }
        Ok(size)
    } else {
        match tokio::fs::metadata(artifact).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
            Ok(_) => Err(fail("dump file is empty")),
            Err(_) => Err(fail("dump file was not created")),
        }
    }
}

fn check_restore_source(target: &DatabaseTarget, source: &Path) -> BackupResult<()> {
    if !source.exists() {
        return Err(BackupError::not_found(
            "backup source",
            source.display().to_string(),
        ));
    }

    if target.engine.produces_directory() {
        if !source.join(&target.database).is_dir() {
            return Err(BackupError::not_found(
                "database dump directory",
                source.join(&target.database).display().to_string(),
            ));
        }
    } else if !source.is_file() {
        return Err(BackupError::ConfigValidation(format!(
            "{} is not a file",
            source.display()
        )));
    }

    Ok(())
}
