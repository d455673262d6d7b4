//! Configuration for threatforge.
//!
//! Everything comes from environment variables, with `./.env` loaded first
//! via dotenvy (which never overwrites variables already set). The tool
//! registry is a separate data file, see [`crate::sandbox::ToolRegistry`].

mod ai;
mod cost;
pub(crate) mod helpers;
mod sandbox;
mod worker;

use std::path::PathBuf;

use crate::error::ConfigError;

pub use self::ai::AiConfig;
pub use self::cost::CostConfig;
pub use self::sandbox::SandboxConfig;
pub use self::worker::DispatcherConfig;

use self::helpers::optional_env;

/// Main configuration for the orchestrator process.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub ai: AiConfig,
    pub cost: CostConfig,
    pub dispatcher: DispatcherConfig,
    /// Tool registry file (JSON or TOML). `None` uses the built-in tools.
    pub tools_path: Option<PathBuf>,
    /// JSON-lines file receiving finished job records.
    pub results_path: PathBuf,
}

impl Config {
    /// Load configuration from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::resolve()
    }

    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            sandbox: SandboxConfig::resolve()?,
            ai: AiConfig::resolve()?,
            cost: CostConfig::resolve()?,
            dispatcher: DispatcherConfig::resolve()?,
            tools_path: optional_env("TOOLS_CONFIG_PATH")?.map(PathBuf::from),
            results_path: optional_env("RESULTS_PATH")?
                .map(PathBuf::from)
                .unwrap_or_else(default_results_path),
        })
    }
}

/// `~/.threatforge/results.jsonl`, or `./results.jsonl` without a home dir.
pub fn default_results_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".threatforge"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("results.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_match_documented_budget() {
        let config = Config::default();
        assert_eq!(config.cost.per_job_ceiling, dec!(0.01));
        assert_eq!(config.ai.model, "llama3-8b-8192");
        assert_eq!(config.dispatcher.concurrency, 4);
        assert!(config.tools_path.is_none());
    }

    #[test]
    fn test_default_results_path_file_name() {
        assert!(default_results_path().ends_with("results.jsonl"));
    }
}
