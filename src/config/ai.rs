use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// AI analysis configuration.
///
/// Defaults target Groq's OpenAI-compatible endpoint. Any other
/// OpenAI-compatible service works by setting `AI_BASE_URL` and `AI_MODEL`.
#[derive(Debug, Clone)]
pub struct AiConfig {
    /// Whether the AI path is attempted at all. When false every job uses
    /// the fallback analyzer.
    pub enabled: bool,
    /// API key. `None` leaves the AI path permanently unhealthy.
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Hard deadline for one provider call.
    pub timeout_secs: u64,
    /// Upper bound on tool-output characters placed in the prompt.
    pub max_context_chars: usize,
    /// Conservative per-call charge used when the provider reports neither
    /// cost nor usage for an unknown model.
    pub fixed_cost_estimate: Decimal,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is let through.
    pub cooldown_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "llama3-8b-8192".to_string(),
            max_tokens: 4000,
            temperature: 0.1,
            timeout_secs: 30,
            max_context_chars: 8000,
            fixed_cost_estimate: dec!(0.002),
            failure_threshold: 3,
            cooldown_secs: 60,
        }
    }
}

impl AiConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_key = match optional_env("AI_API_KEY")? {
            Some(key) => Some(key),
            None => optional_env("GROQ_API_KEY")?,
        }
        .map(SecretString::from);

        let temperature: f32 = parse_optional_env("AI_TEMPERATURE", defaults.temperature)?;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::InvalidValue {
                key: "AI_TEMPERATURE".to_string(),
                message: format!("must be between 0.0 and 2.0, got {}", temperature),
            });
        }

        Ok(Self {
            enabled: parse_bool_env("AI_ENABLED", defaults.enabled)?,
            api_key,
            base_url: parse_string_env("AI_BASE_URL", defaults.base_url)?,
            model: parse_string_env("AI_MODEL", defaults.model)?,
            max_tokens: parse_optional_env("AI_MAX_TOKENS", defaults.max_tokens)?,
            temperature,
            timeout_secs: parse_optional_env("AI_TIMEOUT_SECS", defaults.timeout_secs)?,
            max_context_chars: parse_optional_env(
                "AI_MAX_CONTEXT_CHARS",
                defaults.max_context_chars,
            )?,
            fixed_cost_estimate: parse_optional_env(
                "AI_FIXED_COST_ESTIMATE",
                defaults.fixed_cost_estimate,
            )?,
            failure_threshold: parse_optional_env(
                "AI_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            )?,
            cooldown_secs: parse_optional_env("AI_COOLDOWN_SECS", defaults.cooldown_secs)?,
        })
    }
}
