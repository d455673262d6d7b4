use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::analysis::prompt::{SYSTEM_PROMPT, build_prompt};
use crate::analysis::{AiAnalysis, AiAnalyzer, AnalysisInput};
use crate::config::AiConfig;
use crate::error::AiError;
use crate::job::{Assessment, Provenance, Severity, Vulnerability};
use crate::llm::{CircuitBreaker, CircuitState, CompletionRequest, LlmProvider};

/// Confidence recorded when the model does not state one.
const DEFAULT_AI_CONFIDENCE: f32 = 0.85;

/// Rough chars-per-token ratio used for pre-call estimates.
const CHARS_PER_TOKEN: usize = 4;

/// [`AiAnalyzer`] on top of an [`LlmProvider`], guarded by a circuit breaker.
pub struct LlmAnalyzer {
    provider: Arc<dyn LlmProvider>,
    breaker: CircuitBreaker,
    timeout: Duration,
    max_tokens: u32,
    temperature: f32,
    max_context_chars: usize,
    fixed_cost_estimate: Decimal,
}

impl LlmAnalyzer {
    pub fn new(provider: Arc<dyn LlmProvider>, config: &AiConfig) -> Self {
        Self {
            provider,
            breaker: CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_secs(config.cooldown_secs),
            ),
            timeout: Duration::from_secs(config.timeout_secs),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_context_chars: config.max_context_chars,
            fixed_cost_estimate: config.fixed_cost_estimate,
        }
    }

    /// Billed cost, else usage priced by the model table, else the fixed estimate.
    fn actual_cost(
        &self,
        billed: Option<Decimal>,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Decimal {
        if let Some(cost) = billed {
            return cost;
        }
        if (input_tokens > 0 || output_tokens > 0)
            && let Some((input, output)) = self.provider.cost_per_token()
        {
            return input * Decimal::from(input_tokens) + output * Decimal::from(output_tokens);
        }
        self.fixed_cost_estimate
    }
}

#[async_trait]
impl AiAnalyzer for LlmAnalyzer {
    fn provider_name(&self) -> &str {
        self.provider.name()
    }

    fn healthy(&self) -> bool {
        self.breaker.state() != CircuitState::Open
    }

    fn estimate_cost(&self, input: &AnalysisInput) -> Decimal {
        let prompt_chars = input.output.chars().count().min(self.max_context_chars)
            + SYSTEM_PROMPT.len()
            + 1024;
        let prompt_tokens = (prompt_chars / CHARS_PER_TOKEN) as u32;
        match self.provider.cost_per_token() {
            Some((input_price, output_price)) => {
                let priced = input_price * Decimal::from(prompt_tokens)
                    + output_price * Decimal::from(self.max_tokens);
                priced.max(self.fixed_cost_estimate)
            }
            None => self.fixed_cost_estimate,
        }
    }

    async fn analyze(
        &self,
        input: &AnalysisInput,
        budget_remaining: Decimal,
    ) -> Result<AiAnalysis, AiError> {
        if !self.breaker.try_acquire() {
            return Err(AiError::Unhealthy);
        }

        let estimate = self.estimate_cost(input);
        if estimate > budget_remaining {
            self.breaker.release_probe();
            return Err(AiError::BudgetRejected {
                estimate,
                remaining: budget_remaining,
            });
        }

        let request = CompletionRequest::new(build_prompt(input, self.max_context_chars))
            .with_system(SYSTEM_PROMPT)
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature);

        tracing::debug!(job_id = %input.job_id, model = %self.provider.model_name(), "Calling AI provider");

        let response = match tokio::time::timeout(self.timeout, self.provider.complete(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.breaker.record_failure();
                return Err(AiError::Provider(e));
            }
            Err(_) => {
                self.breaker.record_failure();
                return Err(AiError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let assessment = match parse_assessment(&response.content, self.provider.model_name()) {
            Ok(assessment) => assessment,
            Err(e) => {
                self.breaker.record_failure();
                return Err(e);
            }
        };
        self.breaker.record_success();

        Ok(AiAnalysis {
            assessment,
            billed_cost: self.actual_cost(
                response.billed_cost,
                response.input_tokens,
                response.output_tokens,
            ),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawAssessment {
    vulnerabilities: Vec<RawVulnerability>,
    risk_score: i64,
    mitigations: Vec<RawMitigation>,
    summary: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct RawVulnerability {
    #[serde(default, alias = "vulnerability_type", alias = "type")]
    kind: Option<String>,
    description: String,
    severity: String,
    #[serde(default, alias = "cvss_score")]
    cvss: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMitigation {
    Text(String),
    Detailed {
        action: String,
        #[serde(default)]
        description: Option<String>,
    },
}

impl RawMitigation {
    fn into_step(self) -> String {
        match self {
            Self::Text(step) => step,
            Self::Detailed {
                action,
                description: Some(description),
            } if !description.is_empty() => format!("{}: {}", action, description),
            Self::Detailed { action, .. } => action,
        }
    }
}

/// Strip an optional Markdown code fence around the reply.
fn unfence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse a model reply into an [`Assessment`]. Missing fields, wrong types or
/// out-of-range values are all rejected.
pub(crate) fn parse_assessment(content: &str, model: &str) -> Result<Assessment, AiError> {
    let raw: RawAssessment =
        serde_json::from_str(unfence(content)).map_err(|e| AiError::InvalidResponse {
            reason: e.to_string(),
        })?;

    if !(1..=100).contains(&raw.risk_score) {
        return Err(AiError::InvalidResponse {
            reason: format!("risk_score {} outside 1..=100", raw.risk_score),
        });
    }

    let vulnerabilities = raw
        .vulnerabilities
        .into_iter()
        .map(|v| {
            let severity: Severity = v
                .severity
                .parse()
                .map_err(|reason| AiError::InvalidResponse { reason })?;
            Ok(Vulnerability {
                kind: v
                    .kind
                    .filter(|k| !k.trim().is_empty())
                    .unwrap_or_else(|| "unspecified".to_string()),
                description: v.description,
                severity,
                cvss: v.cvss,
            })
        })
        .collect::<Result<Vec<_>, AiError>>()?;

    let assessment = Assessment {
        vulnerabilities,
        risk_score: raw.risk_score as u8,
        confidence: raw.confidence.unwrap_or(DEFAULT_AI_CONFIDENCE),
        mitigations: raw
            .mitigations
            .into_iter()
            .map(RawMitigation::into_step)
            .filter(|m| !m.trim().is_empty())
            .collect(),
        summary: raw.summary,
        provenance: Provenance::Ai,
        model: model.to_string(),
    };

    assessment
        .validate()
        .map_err(|reason| AiError::InvalidResponse { reason })?;
    Ok(assessment)
}
