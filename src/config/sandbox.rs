use std::time::Duration;

use crate::config::helpers::{parse_bool_env, parse_optional_env};
use crate::error::ConfigError;

/// Docker sandbox configuration shared by every tool run.
///
/// Per-tool registry entries may override the timeout and memory limit.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Timeout used when a tool entry does not set one.
    pub default_timeout_secs: u64,
    /// Memory limit in megabytes.
    pub memory_limit_mb: u64,
    /// CPU limit in whole or fractional cores.
    pub cpu_limit: f64,
    /// Size of the `/tmp` tmpfs in megabytes.
    pub tmpfs_size_mb: u64,
    /// Cap on collected tool output. Anything past it is dropped and the
    /// result is marked truncated.
    pub max_output_bytes: usize,
    /// Whether to pull a tool image that is missing locally.
    pub auto_pull_image: bool,
    /// Deadline for pulling a missing image.
    pub pull_timeout_secs: u64,
    /// Deadline for creating and starting a container, on top of any pull.
    pub startup_timeout_secs: u64,
    /// Deadline for collecting output once the tool has stopped.
    pub logs_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 1800,
            memory_limit_mb: 2048,
            cpu_limit: 1.0,
            tmpfs_size_mb: 512,
            max_output_bytes: 4 * 1024 * 1024,
            auto_pull_image: true,
            pull_timeout_secs: 600,
            startup_timeout_secs: 60,
            logs_timeout_secs: 30,
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let cpu_limit: f64 = parse_optional_env("SANDBOX_CPU_LIMIT", defaults.cpu_limit)?;
        if cpu_limit <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_CPU_LIMIT".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            default_timeout_secs: parse_optional_env(
                "SANDBOX_TIMEOUT_SECS",
                defaults.default_timeout_secs,
            )?,
            memory_limit_mb: parse_optional_env(
                "SANDBOX_MEMORY_LIMIT_MB",
                defaults.memory_limit_mb,
            )?,
            cpu_limit,
            tmpfs_size_mb: parse_optional_env("SANDBOX_TMPFS_MB", defaults.tmpfs_size_mb)?,
            max_output_bytes: parse_optional_env(
                "SANDBOX_MAX_OUTPUT_BYTES",
                defaults.max_output_bytes,
            )?,
            auto_pull_image: parse_bool_env("SANDBOX_AUTO_PULL", defaults.auto_pull_image)?,
            pull_timeout_secs: parse_optional_env(
                "SANDBOX_PULL_TIMEOUT_SECS",
                defaults.pull_timeout_secs,
            )?
            .max(1),
            startup_timeout_secs: parse_optional_env(
                "SANDBOX_STARTUP_TIMEOUT_SECS",
                defaults.startup_timeout_secs,
            )?
            .max(1),
            logs_timeout_secs: parse_optional_env(
                "SANDBOX_LOGS_TIMEOUT_SECS",
                defaults.logs_timeout_secs,
            )?
            .max(1),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    /// Upper bound on `create`, which may include an image pull.
    pub fn create_timeout(&self) -> Duration {
        let pull = if self.auto_pull_image {
            self.pull_timeout()
        } else {
            Duration::ZERO
        };
        pull + self.start_timeout()
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn logs_timeout(&self) -> Duration {
        Duration::from_secs(self.logs_timeout_secs)
    }
}
