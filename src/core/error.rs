/// Error taxonomy shared by the archivers and the database orchestrator
///
/// Failures are caught at the boundary of a single target, reported, and never
/// abort sibling targets. Binaries wrap these in `anyhow` where they need context.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type BackupResult<T> = Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum BackupError {
    /// Volume, container, image or configured database does not exist
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// The container engine or an external client rejected the call
    #[error("runtime invocation failed: {0}")]
    Runtime(String),

    #[error("{operation} timed out after {}", humantime::format_duration(*.after))]
    Timeout { operation: String, after: Duration },

    /// The operation claimed success but produced no usable artifact
    #[error("artifact {} failed verification: {reason}", .path.display())]
    ArtifactVerification { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        BackupError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackupError::NotFound { .. })
    }
}

impl From<bollard::errors::Error> for BackupError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => BackupError::NotFound {
                kind: "docker object",
                name: message,
            },
            other => BackupError::Runtime(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_404_maps_to_not_found() {
        let err: BackupError = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such volume: data".to_string(),
        }
        .into();
        assert!(err.is_not_found());

        let err: BackupError = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        }
        .into();
        assert!(matches!(err, BackupError::Runtime(_)));
    }

    #[test]
    fn test_timeout_message() {
        let err = BackupError::Timeout {
            operation: "pg_dump".to_string(),
            after: Duration::from_secs(3600),
        };
        assert_eq!(err.to_string(), "pg_dump timed out after 1h");
    }
}
