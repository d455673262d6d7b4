//! LLM integration for the AI analysis pass.
//!
//! Talks to any OpenAI-compatible Chat Completions endpoint (Groq by default).

mod circuit;
pub mod costs;
mod openai_compat;
mod provider;

pub use circuit::{CircuitBreaker, CircuitState};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{CompletionRequest, CompletionResponse, LlmProvider};

use std::sync::Arc;

use crate::config::AiConfig;
use crate::error::LlmError;

/// Create the configured provider.
///
/// Returns `Ok(None)` when AI analysis is disabled or no API key is set; the
/// caller then runs with the fallback analyzer only.
pub fn create_llm_provider(config: &AiConfig) -> Result<Option<Arc<dyn LlmProvider>>, LlmError> {
    if !config.enabled {
        tracing::info!("AI analysis disabled, using rule-based analysis only");
        return Ok(None);
    }
    if config.api_key.is_none() {
        tracing::warn!("No AI_API_KEY or GROQ_API_KEY set, using rule-based analysis only");
        return Ok(None);
    }
    Ok(Some(Arc::new(OpenAiCompatProvider::new(config.clone())?)))
}
