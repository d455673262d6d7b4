//! Container runtime abstraction.
//!
//! The runner only needs a handful of lifecycle operations. Keeping them
//! behind a trait lets the runner be exercised without a Docker daemon.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::SandboxError;
use crate::sandbox::registry::VolumeMount;

/// Label attached to every container the sandbox creates.
pub const MANAGED_LABEL: &str = "threatforge.managed";
/// Label carrying the owning job id.
pub const JOB_LABEL: &str = "threatforge.job_id";

/// Fully rendered container definition for one tool run.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub labels: BTreeMap<String, String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub tmpfs_size_mb: u64,
    /// When false the container runs with `network_mode = none`.
    pub network: bool,
}

/// Lifecycle operations the sandbox runner drives.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container. Returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    async fn start(&self, id: &str) -> Result<(), SandboxError>;

    /// Block until the container exits. Returns the exit code.
    async fn wait(&self, id: &str) -> Result<i64, SandboxError>;

    /// Snapshot of stdout and stderr produced so far, capped at `max_bytes`.
    /// The flag is true when output was dropped.
    async fn logs(&self, id: &str, max_bytes: usize) -> Result<(Vec<u8>, bool), SandboxError>;

    /// Forcibly stop the container (SIGKILL).
    async fn kill(&self, id: &str) -> Result<(), SandboxError>;

    /// Remove the container and its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<(), SandboxError>;

    /// Ids of all containers carrying [`MANAGED_LABEL`], running or not.
    async fn list_managed(&self) -> Result<Vec<String>, SandboxError>;
}
