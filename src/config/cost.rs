use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::helpers::parse_optional_env;
use crate::error::ConfigError;

/// Spend ceilings enforced by the cost ledger, in USD.
#[derive(Debug, Clone)]
pub struct CostConfig {
    /// Maximum AI spend for a single job.
    pub per_job_ceiling: Decimal,
    /// Maximum AI spend across all jobs in one accounting period (UTC day).
    pub aggregate_ceiling: Decimal,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            per_job_ceiling: dec!(0.01),
            aggregate_ceiling: dec!(5.00),
        }
    }
}

impl CostConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let per_job_ceiling: Decimal =
            parse_optional_env("COST_PER_JOB_CEILING", defaults.per_job_ceiling)?;
        let aggregate_ceiling: Decimal =
            parse_optional_env("COST_AGGREGATE_CEILING", defaults.aggregate_ceiling)?;

        if per_job_ceiling.is_sign_negative() || aggregate_ceiling.is_sign_negative() {
            return Err(ConfigError::InvalidValue {
                key: "COST_PER_JOB_CEILING / COST_AGGREGATE_CEILING".to_string(),
                message: "ceilings must not be negative".to_string(),
            });
        }

        Ok(Self {
            per_job_ceiling,
            aggregate_ceiling,
        })
    }
}
