/// Helper utilities shared by the backup tools

use chrono::{DateTime, Local, NaiveDateTime};
use std::path::Path;

use crate::utils::BACKUP_TIMESTAMP_FORMAT;

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Timestamp suffix used in database artifact names (`YYYYMMDD_HHMMSS`)
pub fn backup_timestamp(at: DateTime<Local>) -> String {
    at.format(BACKUP_TIMESTAMP_FORMAT).to_string()
}

/// Whether `s` is a timestamp produced by [`backup_timestamp`]
pub fn is_backup_timestamp(s: &str) -> bool {
    s.len() == 15 && NaiveDateTime::parse_from_str(s, BACKUP_TIMESTAMP_FORMAT).is_ok()
}

/// Check if a file exists and is readable
pub fn is_file_readable<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().exists() && path.as_ref().is_file()
}

/// Container status as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    /// The engine no longer knows the container
    Removed,
    Unknown,
}

impl From<&str> for ContainerStatus {
    fn from(status: &str) -> Self {
        match status.to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            "removed" => ContainerStatus::Removed,
            _ => ContainerStatus::Unknown,
        }
    }
}

impl ContainerStatus {
    /// A container in one of these states holds no running process
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Exited | ContainerStatus::Dead | ContainerStatus::Removed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Removed => "removed",
            ContainerStatus::Unknown => "unknown",
        }
    }
}
