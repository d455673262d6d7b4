use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::LlmError;

/// A single-turn completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Overrides the provider's configured model.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            model: None,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Completion result plus what the provider reported about usage.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Cost reported by the provider, when it reports one.
    pub billed_cost: Option<Decimal>,
}

/// Boundary to an external LLM service.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short provider label used in logs and cost entries.
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Per-token (input, output) price for the active model, if known.
    fn cost_per_token(&self) -> Option<(Decimal, Decimal)> {
        super::costs::model_cost(self.model_name())
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}
