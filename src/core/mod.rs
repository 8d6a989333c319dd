pub mod artifact;
pub mod config;
pub mod context;
pub mod database;
pub mod docker;
pub mod engine;
pub mod error;
pub mod launcher;
pub mod lifecycle;
pub mod notify;
pub mod process;
pub mod retention;
pub mod snapshot;
pub mod volume;

pub use config::{DatabaseConfig, DockerBackupConfig};
pub use context::OperationContext;
pub use database::DatabaseDumpOrchestrator;
pub use docker::{ContainerRuntime, DockerManager};
pub use error::{BackupError, BackupResult};
pub use lifecycle::{ContainerLifecycleController, LifecyclePolicy};
pub use notify::Reporter;
pub use process::{CommandRunner, ProcessRunner};
pub use snapshot::ContainerSnapshotArchiver;
pub use volume::VolumeArchiver;
