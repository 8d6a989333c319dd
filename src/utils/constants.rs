/// Defaults and naming conventions shared by the backup tools

use std::time::Duration;

/// Base image for disposable helper containers
pub const HELPER_IMAGE: &str = "alpine:latest";

/// Idle command keeping a helper alive while it is driven through exec
pub const HELPER_IDLE_COMMAND: &[&str] = &["sleep", "600"];

/// Mount point of the volume inside a helper container
pub const HELPER_MOUNT_POINT: &str = "/data";

/// Archive created inside the backup helper
pub const HELPER_ARCHIVE_PATH: &str = "/data_backup.tar";

pub const BACKUP_HELPER_PREFIX: &str = "temp-backup-";
pub const RESTORE_HELPER_PREFIX: &str = "temp-restore-";
pub const SNAPSHOT_IMAGE_PREFIX: &str = "backup_snapshot_";

/// Progress is logged every N chunks while streaming a volume archive
pub const VOLUME_PROGRESS_EVERY: usize = 100;

/// Progress is logged every N chunks while exporting a snapshot image
pub const SNAPSHOT_PROGRESS_EVERY: usize = 50;

pub const DEFAULT_BACKUP_DIR: &str = "/mnt/pendrak";
pub const DEFAULT_DB_CONFIG: &str = "config.json";
pub const DOCKER_LOG_FILE: &str = "/tmp/backup-dockers.log";
pub const DB_LOG_FILE: &str = "backup.log";
pub const LAUNCHER_LOG_FILE: &str = "async_backup.log";

/// Artifacts kept per database when the entry does not say otherwise
pub const DEFAULT_MAX_BACKUPS: usize = 3;

/// Upper bound for every external client invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3600);

/// Grace period handed to `docker restart`
pub const RESTART_GRACE_SECS: u64 = 10;

pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

// Container stop state machine defaults
pub const DEFAULT_STOP_RETRIES: u32 = 3;
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_STOP_COOLDOWN: Duration = Duration::from_secs(2);

// Exit codes
pub const EXIT_OK: i32 = 0;
/// A restore (or the launcher) ran and failed
pub const EXIT_OPERATION_FAILED: i32 = 1;
/// Nothing was attempted: bad arguments, missing config, unknown target
pub const EXIT_INVALID_INVOCATION: i32 = 2;

pub fn backup_helper_name(volume: &str) -> String {
    format!("{}{}", BACKUP_HELPER_PREFIX, volume)
}

pub fn restore_helper_name(volume: &str) -> String {
    format!("{}{}", RESTORE_HELPER_PREFIX, volume)
}

pub fn snapshot_image_name(container: &str) -> String {
    format!("{}{}", SNAPSHOT_IMAGE_PREFIX, container.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_names() {
        assert_eq!(backup_helper_name("pg_data"), "temp-backup-pg_data");
        assert_eq!(restore_helper_name("pg_data"), "temp-restore-pg_data");
    }

    #[test]
    fn test_snapshot_image_is_lowercase() {
        assert_eq!(snapshot_image_name("Web1"), "backup_snapshot_web1");
    }
}
