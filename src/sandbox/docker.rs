//! Docker-backed container runtime.
//!
//! Every tool container is created with all capabilities dropped,
//! `no-new-privileges`, a tmpfs `/tmp`, memory and CPU caps, and no network
//! unless the tool entry asks for outbound access. Ports are never published.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::RwLock;

use crate::error::SandboxError;
use crate::sandbox::runtime::{ContainerRuntime, ContainerSpec, MANAGED_LABEL};

/// Connect to the local Docker daemon and verify it answers.
pub async fn connect_docker() -> Result<Docker, SandboxError> {
    let docker = Docker::connect_with_local_defaults().map_err(|e| SandboxError::Runtime {
        reason: format!("failed to connect to Docker: {}", e),
    })?;
    docker.ping().await.map_err(|e| SandboxError::Runtime {
        reason: format!("Docker daemon is not responding: {}", e),
    })?;
    Ok(docker)
}

/// Build `source:target[:ro]` bind strings.
fn bind_strings(spec: &ContainerSpec) -> Vec<String> {
    spec.volumes
        .iter()
        .map(|v| {
            let mode = if v.read_only { "ro" } else { "rw" };
            format!("{}:{}:{}", v.source, v.target, mode)
        })
        .collect()
}

/// [`ContainerRuntime`] implementation on top of bollard.
pub struct DockerRuntime {
    auto_pull_image: bool,
    pull_timeout: Duration,
    /// Cached Docker connection (created on first use).
    docker: Arc<RwLock<Option<Docker>>>,
}

impl DockerRuntime {
    pub fn new(auto_pull_image: bool, pull_timeout: Duration) -> Self {
        Self {
            auto_pull_image,
            pull_timeout,
            docker: Arc::new(RwLock::new(None)),
        }
    }

    /// Get or create a Docker connection.
    async fn docker(&self) -> Result<Docker, SandboxError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = connect_docker().await?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    async fn ensure_image(&self, docker: &Docker, image: &str) -> Result<(), SandboxError> {
        if docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        if !self.auto_pull_image {
            return Err(SandboxError::StartFailed {
                reason: format!("image {} not present and auto-pull is disabled", image),
            });
        }

        tracing::info!(image = %image, "Pulling tool image");
        let options = bollard::image::CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let pull = async {
            let mut progress = docker.create_image(Some(options), None, None);
            while let Some(step) = progress.next().await {
                step.map_err(|e| SandboxError::StartFailed {
                    reason: format!("failed to pull image {}: {}", image, e),
                })?;
            }
            Ok::<(), SandboxError>(())
        };
        tokio::time::timeout(self.pull_timeout, pull)
            .await
            .map_err(|_| SandboxError::StartFailed {
                reason: format!(
                    "pulling image {} did not finish within {}s",
                    image,
                    self.pull_timeout.as_secs()
                ),
            })?
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::HostConfig;

        let docker = self.docker().await?;
        self.ensure_image(&docker, &spec.image).await?;

        let binds = bind_strings(spec);
        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            network_mode: Some(if spec.network { "bridge" } else { "none" }.to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            pids_limit: Some(512),
            tmpfs: Some(
                [("/tmp".to_string(), format!("size={}M", spec.tmpfs_size_mb))]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };

        let env: Vec<String> = spec
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            network_disabled: Some(!spec.network),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| SandboxError::StartFailed {
                reason: e.to_string(),
            })?;

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        let docker = self.docker().await?;
        docker
            .start_container::<String>(id, None)
            .await
            .map_err(|e| SandboxError::StartFailed {
                reason: format!("failed to start container: {}", e),
            })
    }

    async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        let docker = self.docker().await?;
        let options = bollard::container::WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error; it is still a clean exit.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::Crashed {
                reason: e.to_string(),
            }),
            None => Err(SandboxError::Crashed {
                reason: "wait stream ended without an exit status".to_string(),
            }),
        }
    }

    async fn logs(&self, id: &str, max_bytes: usize) -> Result<(Vec<u8>, bool), SandboxError> {
        let docker = self.docker().await?;
        let options = bollard::container::LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };

        let mut stream = docker.logs(id, Some(options));
        let mut output = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SandboxError::Runtime {
                reason: format!("failed to read container logs: {}", e),
            })?;
            let bytes = chunk.into_bytes();
            let room = max_bytes.saturating_sub(output.len());
            if bytes.len() > room {
                output.extend_from_slice(&bytes[..room]);
                truncated = true;
                break;
            }
            output.extend_from_slice(&bytes);
        }
        Ok((output, truncated))
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        let docker = self.docker().await?;
        let options = bollard::container::KillContainerOptions { signal: "SIGKILL" };
        match docker.kill_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 409: not running any more, which is what we wanted.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(SandboxError::Runtime {
                reason: format!("failed to kill container: {}", e),
            }),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let docker = self.docker().await?;
        let options = bollard::container::RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| SandboxError::Runtime {
                reason: format!("failed to remove container: {}", e),
            })
    }

    async fn list_managed(&self) -> Result<Vec<String>, SandboxError> {
        let docker = self.docker().await?;
        let filters = HashMap::from([("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)])]);
        let options = bollard::container::ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = docker
            .list_containers(Some(options))
            .await
            .map_err(|e| SandboxError::Runtime {
                reason: format!("failed to list containers: {}", e),
            })?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}
