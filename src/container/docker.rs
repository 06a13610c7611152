//! `ContainerRuntime` backed by the local Docker daemon via bollard.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptions,
};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{ContainerRuntime, ContainerSpec, ExecOutput};
use crate::errors::ContainerError;
use crate::server::models::ContainerStatus;

type Result<T> = std::result::Result<T, ContainerError>;

pub struct DockerRuntime {
    docker: Option<Docker>,
}

impl DockerRuntime {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local
    /// socket). A failed connection yields a runtime that reports itself
    /// unavailable instead of an error.
    pub fn connect() -> Self {
        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("Docker client initialized");
                Self {
                    docker: Some(docker),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to initialize Docker client");
                Self { docker: None }
            }
        }
    }

    fn client(&self) -> Result<&Docker> {
        self.docker.as_ref().ok_or(ContainerError::Unavailable)
    }
}

/// Map a bollard error for container `id`, turning 404s into `NotFound`.
fn map_err(id: &str, err: bollard::errors::Error) -> ContainerError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => ContainerError::NotFound { id: id.to_string() },
        other => ContainerError::Api(other.to_string()),
    }
}

fn is_not_modified(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> bool {
        match &self.docker {
            Some(docker) => docker.ping().await.is_ok(),
            None => false,
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let docker = self.client()?;
        if docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image found locally");
            return Ok(());
        }

        info!(image, "Image not found locally, pulling");
        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        let mut stream = docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| ContainerError::ImagePull {
                image: image.to_string(),
                message: e.to_string(),
            })?;
        }
        info!(image, "Image pulled");
        Ok(())
    }

    async fn remove_by_name(&self, name: &str) -> Result<()> {
        let docker = self.client()?;
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match docker.remove_container(name, Some(options)).await {
            Ok(()) => {
                warn!(name, "Removed existing container with the same name");
                Ok(())
            }
            Err(e) => match map_err(name, e) {
                ContainerError::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let docker = self.client()?;
        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let response = docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| ContainerError::Api(e.to_string()))?;
        for warning in &response.warnings {
            warn!(container = %spec.name, warning = %warning, "Docker create warning");
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let docker = self.client()?;
        match docker
            .start_container(id, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_err(id, e)),
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let docker = self.client()?;
        match docker.stop_container(id, None::<StopContainerOptions>).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_err(id, e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let docker = self.client()?;
        let options = RemoveContainerOptionsBuilder::default().build();
        docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_err(id, e))
    }

    async fn state(&self, id: &str) -> Result<ContainerStatus> {
        let docker = self.client()?;
        let info = docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err(id, e))?;
        let raw = info
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default();
        raw.parse::<ContainerStatus>()
            .map_err(|_| ContainerError::Api(format!("Unexpected container state '{}'", raw)))
    }

    async fn exec(&self, id: &str, cmd: Vec<String>, working_dir: &str) -> Result<ExecOutput> {
        let docker = self.client()?;
        let exec = docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(working_dir.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_err(id, e))?;

        let mut output = ExecOutput::default();
        match docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_err(id, e))?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    match chunk.map_err(|e| map_err(id, e))? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            output.stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdErr { message } => {
                            output.stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_err(id, e))?;
        output.exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_err_404_is_not_found() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        assert!(matches!(
            map_err("abc", err),
            ContainerError::NotFound { id } if id == "abc"
        ));
    }

    #[test]
    fn test_map_err_other_status_is_api_error() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        assert!(matches!(map_err("abc", err), ContainerError::Api(_)));
    }

    #[tokio::test]
    async fn test_disconnected_runtime_is_unavailable() {
        let runtime = DockerRuntime { docker: None };
        assert!(!runtime.ping().await);
        assert!(matches!(
            runtime.state("abc").await.unwrap_err(),
            ContainerError::Unavailable
        ));
    }
}
