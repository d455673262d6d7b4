//! Sandboxed tool execution.
//!
//! ```text
//! ToolRegistry ──► SandboxRunner ──► ContainerRuntime (Docker)
//!   (data)          render spec        create / start
//!                   enforce deadline   wait / logs / kill
//!                   always tear down   remove
//! ```

mod docker;
mod registry;
mod runner;
mod runtime;

pub use docker::{DockerRuntime, connect_docker};
pub use registry::{PLACEHOLDERS, ToolConfig, ToolInvocation, ToolRegistry, VolumeMount};
pub use runner::SandboxRunner;
pub use runtime::{ContainerRuntime, ContainerSpec, JOB_LABEL, MANAGED_LABEL};
