/// Docker Engine integration
///
/// The archivers and the stop state machine talk to the engine through the
/// [`ContainerRuntime`] trait; [`DockerManager`] implements it on top of bollard.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    KillContainerOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CommitContainerOptions, CreateImageOptions, ImportImageOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::time::Duration;

use crate::core::error::{BackupError, BackupResult};
use crate::utils::ContainerStatus;

/// Disposable container mounting a single volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperSpec {
    pub name: String,
    pub image: String,
    pub volume: String,
    pub mount_point: String,
    pub read_only: bool,
    pub command: Vec<String>,
}

impl HelperSpec {
    fn bind(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.volume, self.mount_point, mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn volume_exists(&self, name: &str) -> BackupResult<bool>;

    async fn create_volume(&self, name: &str) -> BackupResult<()>;

    /// Create and start a detached, auto-removed helper container
    async fn run_helper(&self, spec: &HelperSpec) -> BackupResult<()>;

    async fn exec(&self, container: &str, cmd: Vec<String>) -> BackupResult<ExecOutput>;

    /// Tar stream of `path` inside `container`
    fn download_archive(&self, container: &str, path: &str) -> BoxStream<'static, BackupResult<Bytes>>;

    /// Extract a tar archive into `path` inside `container`
    async fn upload_archive(&self, container: &str, path: &str, archive: Vec<u8>) -> BackupResult<()>;

    async fn container_status(&self, name: &str) -> BackupResult<ContainerStatus>;

    async fn stop_container(&self, name: &str, grace: Duration) -> BackupResult<()>;

    async fn kill_container(&self, name: &str) -> BackupResult<()>;

    async fn remove_container(&self, name: &str) -> BackupResult<()>;

    /// Commit the container filesystem; returns the image reference
    async fn commit_container(&self, name: &str, repository: &str) -> BackupResult<String>;

    fn export_image(&self, image: &str) -> BoxStream<'static, BackupResult<Bytes>>;

    /// Load an image archive; returns the loaded reference when the engine reports one
    async fn load_image(&self, archive: Vec<u8>) -> BackupResult<Option<String>>;

    async fn remove_image(&self, image: &str) -> BackupResult<()>;

    /// Start a detached container `name` from `image`
    async fn run_container(&self, name: &str, image: &str) -> BackupResult<()>;
}

#[derive(Clone)]
pub struct DockerManager {
    docker: Docker,
}

impl DockerManager {
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon. Is Docker running?")?;

        Ok(Self { docker })
    }

    /// Check if Docker daemon is accessible
    pub async fn check_docker(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn ensure_image(&self, image: &str) -> BackupResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!("Pulling image {}", image);
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image,
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;

        Ok(())
    }
}

/// Extract the image reference from `docker load` progress output
fn loaded_reference(line: &str) -> Option<String> {
    let line = line.trim();
    line.strip_prefix("Loaded image ID:")
        .or_else(|| line.strip_prefix("Loaded image:"))
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
}

#[async_trait]
impl ContainerRuntime for DockerManager {
    async fn volume_exists(&self, name: &str) -> BackupResult<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) => match BackupError::from(e) {
                err if err.is_not_found() => Ok(false),
                err => Err(err),
            },
        }
    }

    async fn create_volume(&self, name: &str) -> BackupResult<()> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn run_helper(&self, spec: &HelperSpec) -> BackupResult<()> {
        self.ensure_image(&spec.image).await?;

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            host_config: Some(HostConfig {
                binds: Some(vec![spec.bind()]),
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await?;

        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await?;

        Ok(())
    }

    async fn exec(&self, container: &str, cmd: Vec<String>) -> BackupResult<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = stream.next().await {
                output.push_str(&chunk?.to_string());
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    fn download_archive(&self, container: &str, path: &str) -> BoxStream<'static, BackupResult<Bytes>> {
        self.docker
            .download_from_container(
                container,
                Some(DownloadFromContainerOptions {
                    path: path.to_string(),
                }),
            )
            .map_err(BackupError::from)
            .boxed()
    }

    async fn upload_archive(&self, container: &str, path: &str, archive: Vec<u8>) -> BackupResult<()> {
        self.docker
            .upload_to_container(
                container,
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await?;
        Ok(())
    }

    async fn container_status(&self, name: &str) -> BackupResult<ContainerStatus> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match BackupError::from(e) {
                err if err.is_not_found() => BackupError::not_found("container", name),
                err => err,
            })?;

        let status = inspect
            .state
            .and_then(|s| s.status)
            .map(|s| ContainerStatus::from(s.to_string().as_str()))
            .unwrap_or(ContainerStatus::Unknown);

        Ok(status)
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> BackupResult<()> {
        self.docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await?;
        Ok(())
    }

    async fn kill_container(&self, name: &str) -> BackupResult<()> {
        self.docker
            .kill_container(name, None::<KillContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> BackupResult<()> {
        self.docker
            .remove_container(name, None::<RemoveContainerOptions>)
            .await?;
        Ok(())
    }

    async fn commit_container(&self, name: &str, repository: &str) -> BackupResult<String> {
        self.docker
            .commit_container(
                CommitContainerOptions {
                    container: name.to_string(),
                    repo: repository.to_string(),
                    ..Default::default()
                },
                Config::<String>::default(),
            )
            .await?;

        Ok(format!("{}:latest", repository))
    }

    fn export_image(&self, image: &str) -> BoxStream<'static, BackupResult<Bytes>> {
        self.docker
            .export_image(image)
            .map_err(BackupError::from)
            .boxed()
    }

    async fn load_image(&self, archive: Vec<u8>) -> BackupResult<Option<String>> {
        let progress: Vec<_> = self
            .docker
            .import_image(ImportImageOptions::default(), archive.into(), None)
            .try_collect()
            .await?;

        let reference = progress
            .iter()
            .filter_map(|info| info.stream.as_deref())
            .filter_map(loaded_reference)
            .last();

        Ok(reference)
    }

    async fn remove_image(&self, image: &str) -> BackupResult<()> {
        self.docker
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await?;
        Ok(())
    }

    async fn run_container(&self, name: &str, image: &str) -> BackupResult<()> {
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    ..Default::default()
                }),
                Config {
                    image: Some(image.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_bind_modes() {
        let mut spec = HelperSpec {
            name: "temp-backup-data".to_string(),
            image: "alpine:latest".to_string(),
            volume: "data".to_string(),
            mount_point: "/data".to_string(),
            read_only: true,
            command: vec!["sleep".to_string(), "600".to_string()],
        };
        assert_eq!(spec.bind(), "data:/data:ro");

        spec.read_only = false;
        assert_eq!(spec.bind(), "data:/data:rw");
    }

    #[test]
    fn test_loaded_reference() {
        assert_eq!(
            loaded_reference("Loaded image: backup_snapshot_web1:latest\n"),
            Some("backup_snapshot_web1:latest".to_string())
        );
        assert_eq!(
            loaded_reference("Loaded image ID: sha256:abc123"),
            Some("sha256:abc123".to_string())
        );
        assert_eq!(loaded_reference("Loading layer 1/3"), None);
    }

    #[tokio::test]
    async fn test_docker_manager_creation() {
        // This test requires Docker to be running
        if let Ok(manager) = DockerManager::new() {
            let _ = manager.check_docker().await;
        }
    }
}
