//! Runs one tool invocation in a throwaway container.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::job::{ExecutionResult, ExitStatus};
use crate::sandbox::registry::{ToolConfig, ToolInvocation};
use crate::sandbox::runtime::{ContainerRuntime, ContainerSpec, JOB_LABEL, MANAGED_LABEL};

/// How the wait phase of a run ended.
enum WaitOutcome {
    Exited(i64),
    TimedOut,
}

/// Executes tools in isolated containers with a hard deadline.
///
/// The runner never touches job state. It returns an [`ExecutionResult`] or a
/// [`SandboxError`] and removes the container on every path.
pub struct SandboxRunner {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
}

impl SandboxRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Self {
        Self { runtime, config }
    }

    /// Render the container definition for a tool invocation.
    pub fn build_spec(
        &self,
        tool_name: &str,
        tool: &ToolConfig,
        invocation: &ToolInvocation,
    ) -> ContainerSpec {
        let command = tool.command.iter().map(|arg| invocation.render(arg)).collect();
        let environment = tool
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), invocation.render(v)))
            .collect();

        let labels = BTreeMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (JOB_LABEL.to_string(), invocation.job_id.to_string()),
        ]);

        let memory_mb = tool.memory_limit_mb.unwrap_or(self.config.memory_limit_mb);

        ContainerSpec {
            name: format!(
                "threatforge-{}-{}",
                sanitize_name(tool_name),
                invocation.job_id
            ),
            image: tool.image.clone(),
            command,
            environment,
            volumes: tool.volumes.clone(),
            labels,
            memory_bytes: (memory_mb * 1024 * 1024) as i64,
            nano_cpus: (self.config.cpu_limit * 1_000_000_000.0) as i64,
            tmpfs_size_mb: self.config.tmpfs_size_mb,
            network: tool.network,
        }
    }

    /// Run a tool to completion, timeout, or cancellation.
    ///
    /// A non-zero exit is a successful run. A timeout with partial output is
    /// a successful, truncated run; a timeout with no output is an error.
    /// Every runtime call is bounded, and cancellation is observed during
    /// create and start as well as while the tool runs.
    pub async fn execute(
        &self,
        tool_name: &str,
        tool: &ToolConfig,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let timeout = tool.timeout(self.config.default_timeout());
        let spec = self.build_spec(tool_name, tool, invocation);
        let started_at = Utc::now();

        let container_id = self.create(&spec, cancel).await?;
        tracing::info!(
            job_id = %invocation.job_id,
            tool = %tool_name,
            container_id = %container_id,
            timeout_secs = timeout.as_secs(),
            "Created tool container"
        );

        let result = self
            .run_container(&container_id, timeout, cancel)
            .await
            .map(|(output, exit, truncated)| ExecutionResult {
                container_id: container_id.clone(),
                output,
                exit,
                truncated,
                started_at,
                finished_at: Utc::now(),
            });

        self.teardown(&container_id).await;
        result
    }

    /// Create the container, giving up on cancel or when the create deadline
    /// passes. An abandoned create is cleaned up by container name.
    async fn create(
        &self,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> Result<String, SandboxError> {
        let deadline = self.config.create_timeout();
        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            created = tokio::time::timeout(deadline, self.runtime.create(spec)) => Some(created),
        };

        match created {
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                tracing::warn!(
                    container = %spec.name,
                    deadline_secs = deadline.as_secs(),
                    "Container create exceeded its deadline"
                );
                self.discard(&spec.name).await;
                Err(SandboxError::StartFailed {
                    reason: format!(
                        "container create did not finish within {}s",
                        deadline.as_secs()
                    ),
                })
            }
            None => {
                tracing::info!(container = %spec.name, "Cancelled during container create");
                self.discard(&spec.name).await;
                Err(SandboxError::Cancelled)
            }
        }
    }

    async fn run_container(
        &self,
        id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(String, ExitStatus, bool), SandboxError> {
        let start_deadline = self.config.start_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
            started = tokio::time::timeout(start_deadline, self.runtime.start(id)) => match started {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SandboxError::StartFailed {
                        reason: format!(
                            "container start did not finish within {}s",
                            start_deadline.as_secs()
                        ),
                    });
                }
            },
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.kill(id).await;
                return Err(SandboxError::Cancelled);
            }
            waited = tokio::time::timeout(timeout, self.runtime.wait(id)) => match waited {
                Ok(Ok(code)) => WaitOutcome::Exited(code),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::warn!(
                        container_id = %id,
                        timeout_secs = timeout.as_secs(),
                        "Tool exceeded its deadline, killing container"
                    );
                    self.kill(id).await;
                    WaitOutcome::TimedOut
                }
            },
        };

        match outcome {
            WaitOutcome::Exited(code) => {
                let (bytes, capped) = self.collect_logs(id).await?;
                if code != 0 {
                    tracing::info!(container_id = %id, exit_code = code, "Tool exited non-zero");
                }
                Ok((
                    String::from_utf8_lossy(&bytes).into_owned(),
                    ExitStatus::Exited(code),
                    capped,
                ))
            }
            WaitOutcome::TimedOut => {
                let bytes = match self.collect_logs(id).await {
                    Ok((bytes, _)) => bytes,
                    Err(e) => {
                        tracing::warn!(container_id = %id, error = %e, "Could not collect partial output");
                        Vec::new()
                    }
                };
                let output = String::from_utf8_lossy(&bytes).into_owned();
                if output.trim().is_empty() {
                    return Err(SandboxError::Timeout {
                        after_secs: timeout.as_secs(),
                    });
                }
                Ok((output, ExitStatus::TimedOut, true))
            }
        }
    }

    async fn collect_logs(&self, id: &str) -> Result<(Vec<u8>, bool), SandboxError> {
        let deadline = self.config.logs_timeout();
        tokio::time::timeout(deadline, self.runtime.logs(id, self.config.max_output_bytes))
            .await
            .map_err(|_| SandboxError::Runtime {
                reason: format!("collecting output did not finish within {}s", deadline.as_secs()),
            })?
    }

    async fn kill(&self, id: &str) {
        if let Err(e) = self.runtime.kill(id).await {
            tracing::warn!(container_id = %id, error = %e, "Failed to kill container");
        }
    }

    /// Remove a container whose create may or may not have gone through.
    async fn discard(&self, name: &str) {
        if let Err(e) = self.runtime.remove(name).await {
            tracing::debug!(container = %name, error = %e, "Nothing to discard");
        }
    }

    async fn teardown(&self, id: &str) {
        match self.runtime.remove(id).await {
            Ok(()) => tracing::debug!(container_id = %id, "Removed tool container"),
            Err(e) => {
                tracing::warn!(container_id = %id, error = %e, "Failed to remove container (may require manual cleanup)")
            }
        }
    }

    /// Remove managed containers left behind by a previous process.
    ///
    /// Returns how many were removed.
    pub async fn reap_orphans(&self) -> Result<usize, SandboxError> {
        let ids = self.runtime.list_managed().await?;
        let mut removed = 0;
        for id in ids {
            self.kill(&id).await;
            match self.runtime.remove(&id).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(container_id = %id, error = %e, "Failed to reap orphan"),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Reaped orphaned tool containers");
        }
        Ok(removed)
    }
}

/// Docker names allow `[a-zA-Z0-9][a-zA-Z0-9_.-]`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
