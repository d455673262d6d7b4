use std::time::Duration;

use crate::config::helpers::parse_optional_env;
use crate::error::ConfigError;

/// Worker pool and crash-recovery settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of jobs processed in parallel.
    pub concurrency: usize,
    /// How often a busy worker refreshes its lease on the job.
    pub heartbeat_interval: Duration,
    /// A running job whose lease is older than this has no live owner.
    pub stale_after: Duration,
    /// How often the recovery sweeper scans for orphaned jobs.
    pub sweep_interval: Duration,
    /// How long a persisted terminal job stays queryable in memory.
    pub retention: Duration,
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            heartbeat_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(15),
            retention: Duration::from_secs(30 * SECS_PER_DAY),
        }
    }
}

impl DispatcherConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let concurrency: usize = parse_optional_env("WORKER_CONCURRENCY", defaults.concurrency)?;
        let heartbeat_secs: u64 = parse_optional_env(
            "WORKER_HEARTBEAT_SECS",
            defaults.heartbeat_interval.as_secs(),
        )?;
        let stale_secs: u64 =
            parse_optional_env("WORKER_STALE_AFTER_SECS", defaults.stale_after.as_secs())?;
        let sweep_secs: u64 =
            parse_optional_env("WORKER_SWEEP_SECS", defaults.sweep_interval.as_secs())?;
        let retention_days: u64 = parse_optional_env(
            "WORKER_RETENTION_DAYS",
            defaults.retention.as_secs() / SECS_PER_DAY,
        )?;

        if stale_secs <= heartbeat_secs {
            return Err(ConfigError::InvalidValue {
                key: "WORKER_STALE_AFTER_SECS".to_string(),
                message: format!(
                    "must exceed WORKER_HEARTBEAT_SECS ({}s), got {}s",
                    heartbeat_secs, stale_secs
                ),
            });
        }

        Ok(Self {
            concurrency: concurrency.max(1),
            heartbeat_interval: Duration::from_secs(heartbeat_secs.max(1)),
            stale_after: Duration::from_secs(stale_secs),
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
            retention: Duration::from_secs(retention_days.saturating_mul(SECS_PER_DAY)),
        })
    }
}
