/// Container snapshots as image archives
///
/// A backup commits the container filesystem to `backup_snapshot_<name>` and exports
/// that image to a single file. A restore loads the archive, displaces any existing
/// container of the same name through the stop state machine and starts a fresh one.

use std::path::Path;
use std::sync::Arc;

use crate::core::artifact::stream_to_file;
use crate::core::context::OperationContext;
use crate::core::docker::ContainerRuntime;
use crate::core::error::{BackupError, BackupResult};
use crate::core::lifecycle::ContainerLifecycleController;
use crate::core::notify::Reporter;
use crate::utils::{format_bytes, is_file_readable, snapshot_image_name, SNAPSHOT_PROGRESS_EVERY};

#[derive(Clone)]
pub struct ContainerSnapshotArchiver {
    runtime: Arc<dyn ContainerRuntime>,
    reporter: Reporter,
    lifecycle: ContainerLifecycleController,
}

impl ContainerSnapshotArchiver {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        reporter: Reporter,
        lifecycle: ContainerLifecycleController,
    ) -> Self {
        Self {
            runtime,
            reporter,
            lifecycle,
        }
    }

    /// Snapshot container `name` into `dest`; returns the artifact size in bytes
    pub async fn backup_container(&self, name: &str, dest: &Path, ctx: &OperationContext) -> BackupResult<u64> {
        let _guard = ctx.enter(format!("backing up container {}", name));
        self.reporter.info(format!("Starting backup of container: {}", name));

        if let Err(e) = self.runtime.container_status(name).await {
            if e.is_not_found() {
                self.reporter.error(format!("Container {} does not exist", name));
            } else {
                self.reporter
                    .error(format!("Failed to inspect container {}: {}", name, e));
            }
            return Err(e);
        }

        ctx.describe(format!("committing container {}", name));
        let repository = snapshot_image_name(name);
        let image = match self.runtime.commit_container(name, &repository).await {
            Ok(image) => image,
            Err(e) => {
                self.reporter
                    .error(format!("Failed to commit container {}: {}", name, e));
                return Err(e);
            }
        };
        tracing::info!("Committed container {} to image {}", name, image);

        ctx.describe(format!("exporting image {} to {}", image, dest.display()));
        let stream = self.runtime.export_image(&image);
        let size = match stream_to_file(
            stream,
            dest,
            &format!("Container {}", name),
            SNAPSHOT_PROGRESS_EVERY,
        )
        .await
        {
            Ok(size) => size,
            Err(e) => {
                self.reporter.error(format!(
                    "Failed to export snapshot of container {}: {}",
                    name, e
                ));
                return Err(e);
            }
        };

        if let Err(e) = self.runtime.remove_image(&image).await {
            tracing::warn!("Could not remove temporary image {}: {}", image, e);
        }

        self.reporter.info(format!(
            "Container backup completed: {} ({} bytes, {})",
            name,
            size,
            format_bytes(size)
        ));
        Ok(size)
    }

    /// Replace container `name` with one started from the snapshot at `src`
    pub async fn restore_container(&self, name: &str, src: &Path, ctx: &OperationContext) -> BackupResult<()> {
        let _guard = ctx.enter(format!("restoring container {}", name));
        self.reporter.info(format!("Starting restore of container: {}", name));

        if !is_file_readable(src) {
            self.reporter.error(format!(
                "Backup of container {} does not exist at {}",
                name,
                src.display()
            ));
            return Err(BackupError::not_found("backup file", src.display().to_string()));
        }

        ctx.describe(format!("loading image for container {}", name));
        let image = match self.load_snapshot(name, src).await {
            Ok(image) => image,
            Err(e) => {
                self.reporter
                    .error(format!("Failed to load image for container {}: {}", name, e));
                return Err(e);
            }
        };
        tracing::info!("Loaded image {} for container {}", image, name);

        self.displace_existing(name, ctx).await?;

        ctx.describe(format!("starting container {} from {}", name, image));
        match self.runtime.run_container(name, &image).await {
            Ok(()) => {
                self.reporter
                    .info(format!("Container restore completed: {}", name));
                Ok(())
            }
            Err(e) => {
                self.reporter
                    .error(format!("Failed to start container {}: {}", name, e));
                Err(e)
            }
        }
    }

    async fn load_snapshot(&self, name: &str, src: &Path) -> BackupResult<String> {
        let archive = tokio::fs::read(src).await?;
        let reference = self.runtime.load_image(archive).await?;
        Ok(reference.unwrap_or_else(|| format!("{}:latest", snapshot_image_name(name))))
    }

    /// Stop and remove a container occupying `name`. Any failure aborts the restore
    /// before anything destructive happens.
    async fn displace_existing(&self, name: &str, ctx: &OperationContext) -> BackupResult<()> {
        let status = match self.runtime.container_status(name).await {
            Ok(status) => status,
            Err(e) if e.is_not_found() => {
                tracing::info!("No existing container named {}", name);
                return Ok(());
            }
            Err(e) => {
                self.reporter
                    .error(format!("Failed to inspect container {}: {}", name, e));
                return Err(e);
            }
        };

        if !status.is_terminal() {
            ctx.describe(format!("stopping existing container {}", name));
            self.reporter.info(format!(
                "Container {} exists ({}), stopping it",
                name,
                status.as_str()
            ));

            if !self.lifecycle.stop_container(name).await {
                self.reporter.error(format!(
                    "Could not stop container {}, restore aborted",
                    name
                ));
                return Err(BackupError::Runtime(format!(
                    "container {} could not be stopped",
                    name
                )));
            }
        }

        ctx.describe(format!("removing existing container {}", name));
        match self.runtime.remove_container(name).await {
            Ok(()) => {
                tracing::info!("Removed existing container {}", name);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                self.reporter
                    .error(format!("Failed to remove container {}: {}", name, e));
                Err(e)
            }
        }
    }
}
