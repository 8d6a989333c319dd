/// Volume backup and restore through disposable helper containers
///
/// A helper (`temp-backup-<volume>` / `temp-restore-<volume>`) mounts the volume,
/// the archive is moved in or out through the engine's archive API, and the helper
/// is killed afterwards whatever the outcome. Helpers are auto-removed on exit.

use std::path::Path;
use std::sync::Arc;

use crate::core::artifact::stream_to_file;
use crate::core::context::OperationContext;
use crate::core::docker::{ContainerRuntime, HelperSpec};
use crate::core::error::{BackupError, BackupResult};
use crate::core::notify::Reporter;
use crate::utils::{
    backup_helper_name, format_bytes, is_file_readable, restore_helper_name, HELPER_ARCHIVE_PATH,
    HELPER_IDLE_COMMAND, HELPER_IMAGE, HELPER_MOUNT_POINT, VOLUME_PROGRESS_EVERY,
};

/// Shell snippet unpacking the archive produced by a backup helper once the upload
/// has placed it in the mount point
fn unpack_nested_archive() -> String {
    let archive_name = Path::new(HELPER_ARCHIVE_PATH)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let nested = format!("{}/{}", HELPER_MOUNT_POINT, archive_name);

    format!(
        "if [ -f {nested} ]; then mv {nested} /tmp/restore.tar && \
         tar -xf /tmp/restore.tar -C {mount} && rm -f /tmp/restore.tar; fi",
        nested = nested,
        mount = HELPER_MOUNT_POINT
    )
}

#[derive(Clone)]
pub struct VolumeArchiver {
    runtime: Arc<dyn ContainerRuntime>,
    reporter: Reporter,
}

impl VolumeArchiver {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, reporter: Reporter) -> Self {
        Self { runtime, reporter }
    }

    fn helper(name: String, volume: &str, read_only: bool) -> HelperSpec {
        HelperSpec {
            name,
            image: HELPER_IMAGE.to_string(),
            volume: volume.to_string(),
            mount_point: HELPER_MOUNT_POINT.to_string(),
            read_only,
            command: HELPER_IDLE_COMMAND.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Archive `volume` into `dest`; returns the artifact size in bytes
    pub async fn backup_volume(&self, volume: &str, dest: &Path, ctx: &OperationContext) -> BackupResult<u64> {
        let _guard = ctx.enter(format!("backing up volume {}", volume));
        self.reporter.info(format!("Starting backup of volume: {}", volume));

        match self.runtime.volume_exists(volume).await {
            Ok(true) => tracing::info!("Volume {} found successfully", volume),
            Ok(false) => {
                self.reporter.error(format!("Volume {} does not exist", volume));
                return Err(BackupError::not_found("volume", volume));
            }
            Err(e) => {
                self.reporter
                    .error(format!("Failed to look up volume {}: {}", volume, e));
                return Err(e);
            }
        }

        let helper = Self::helper(backup_helper_name(volume), volume, true);
        tracing::info!("Creating temporary container {} for volume backup", helper.name);
        if let Err(e) = self.runtime.run_helper(&helper).await {
            self.reporter.error(format!(
                "Failed to create backup container for volume {}: {}",
                volume, e
            ));
            return Err(e);
        }
        ctx.hold_helper(&helper.name);

        let result = self.archive_from_helper(volume, &helper.name, dest, ctx).await;
        self.release_helper(&helper.name).await;
        ctx.clear_helper();

        match result {
            Ok(size) => {
                tracing::info!(
                    "Volume backup completed: {} -> {} ({} bytes)",
                    volume,
                    dest.display(),
                    size
                );
                self.reporter.info(format!(
                    "Volume backup completed: {} ({} bytes, {})",
                    volume,
                    size,
                    format_bytes(size)
                ));
                Ok(size)
            }
            Err(e) => {
                self.reporter.error(format!(
                    "Failed to copy archive of volume {}: {}",
                    volume, e
                ));
                Err(e)
            }
        }
    }

    async fn archive_from_helper(
        &self,
        volume: &str,
        helper: &str,
        dest: &Path,
        ctx: &OperationContext,
    ) -> BackupResult<u64> {
        ctx.describe(format!("creating TAR archive for volume {}", volume));
        tracing::info!("Creating TAR archive for volume {}", volume);

        let tar = vec![
            "tar".to_string(),
            "-cf".to_string(),
            HELPER_ARCHIVE_PATH.to_string(),
            "-C".to_string(),
            HELPER_MOUNT_POINT.to_string(),
            ".".to_string(),
        ];
        let exec = self.runtime.exec(helper, tar).await?;
        if exec.exit_code != 0 {
            return Err(BackupError::Runtime(format!(
                "tar exited with {} in {}: {}",
                exec.exit_code,
                helper,
                exec.output.trim()
            )));
        }

        ctx.describe(format!(
            "copying volume data for {} to {}",
            volume,
            dest.display()
        ));
        tracing::info!("TAR archive created successfully, copying to {}", dest.display());

        let stream = self.runtime.download_archive(helper, HELPER_ARCHIVE_PATH);
        stream_to_file(
            stream,
            dest,
            &format!("Volume {}", volume),
            VOLUME_PROGRESS_EVERY,
        )
        .await
    }

    /// Restore `volume` from the archive at `src`, creating the volume when missing
    pub async fn restore_volume(&self, volume: &str, src: &Path, ctx: &OperationContext) -> BackupResult<()> {
        let _guard = ctx.enter(format!("restoring volume {}", volume));
        self.reporter.info(format!("Starting restore of volume: {}", volume));

        if !is_file_readable(src) {
            self.reporter.error(format!(
                "Backup of volume {} does not exist at {}",
                volume,
                src.display()
            ));
            return Err(BackupError::not_found("backup file", src.display().to_string()));
        }

        match self.runtime.volume_exists(volume).await {
            Ok(true) => tracing::info!("Volume {} already exists", volume),
            Ok(false) => match self.runtime.create_volume(volume).await {
                Ok(()) => tracing::info!("Volume {} created successfully", volume),
                Err(e) => {
                    self.reporter
                        .error(format!("Failed to create volume {}: {}", volume, e));
                    return Err(e);
                }
            },
            Err(e) => {
                self.reporter
                    .error(format!("Failed to look up volume {}: {}", volume, e));
                return Err(e);
            }
        }

        let helper = Self::helper(restore_helper_name(volume), volume, false);
        tracing::info!("Creating temporary container {} for volume restore", helper.name);
        if let Err(e) = self.runtime.run_helper(&helper).await {
            self.reporter.error(format!(
                "Failed to create restore container for volume {}: {}",
                volume, e
            ));
            return Err(e);
        }
        ctx.hold_helper(&helper.name);

        let result = self.inject_into_helper(volume, &helper.name, src, ctx).await;
        self.release_helper(&helper.name).await;
        ctx.clear_helper();

        match result {
            Ok(()) => {
                self.reporter
                    .info(format!("Volume restore completed: {}", volume));
                Ok(())
            }
            Err(e) => {
                self.reporter.error(format!(
                    "Failed to restore files into volume {}: {}",
                    volume, e
                ));
                Err(e)
            }
        }
    }

    async fn inject_into_helper(
        &self,
        volume: &str,
        helper: &str,
        src: &Path,
        ctx: &OperationContext,
    ) -> BackupResult<()> {
        ctx.describe(format!("restoring data into volume {}", volume));
        tracing::info!("Reading backup file: {}", src.display());
        let archive = tokio::fs::read(src).await?;

        tracing::info!("Restoring data to volume {}", volume);
        self.runtime
            .upload_archive(helper, HELPER_MOUNT_POINT, archive)
            .await?;

        let unpack = vec![
            "sh".to_string(),
            "-c".to_string(),
            unpack_nested_archive(),
        ];
        let exec = self.runtime.exec(helper, unpack).await?;
        if exec.exit_code != 0 {
            return Err(BackupError::Runtime(format!(
                "unpacking archive in {} exited with {}: {}",
                helper,
                exec.exit_code,
                exec.output.trim()
            )));
        }

        Ok(())
    }

    /// Kill a helper container; it is auto-removed once stopped
    pub async fn release_helper(&self, helper: &str) {
        tracing::info!("Cleaning up temporary container {}", helper);
        if let Err(e) = self.runtime.kill_container(helper).await {
            tracing::debug!("Helper {} already gone: {}", helper, e);
        }
    }
}
