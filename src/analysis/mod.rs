//! Turning raw tool output into an [`Assessment`].
//!
//! Two analyzers share one output shape: the AI analyzer (cost-bounded, may
//! fail for many reasons) and the rule-based fallback (offline, always
//! available). Which one runs is decided by the orchestrator.

mod ai;
mod fallback;
mod prompt;

pub use ai::LlmAnalyzer;
pub use fallback::RuleBasedAnalyzer;
pub use prompt::{TRUNCATION_MARKER, truncate_middle};

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{AiError, FallbackFailure};
use crate::job::{Assessment, ExecutionResult, ExitStatus, Job, Severity};

/// Everything an analyzer may look at for one job.
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub job_id: Uuid,
    pub tool: String,
    pub target_description: String,
    pub severity: Severity,
    pub attack_vectors: u32,
    pub output: String,
    pub exit: ExitStatus,
    pub truncated: bool,
}

impl AnalysisInput {
    pub fn new(job: &Job, execution: &ExecutionResult) -> Self {
        Self {
            job_id: job.id,
            tool: job.tool.clone(),
            target_description: job.target_description.clone(),
            severity: job.severity,
            attack_vectors: job.attack_vectors,
            output: execution.output.clone(),
            exit: execution.exit,
            truncated: execution.truncated,
        }
    }
}

/// Successful AI analysis and what it cost.
#[derive(Debug, Clone)]
pub struct AiAnalysis {
    pub assessment: Assessment,
    pub billed_cost: Decimal,
}

/// AI-backed analysis. One provider call per `analyze`, never retried.
#[async_trait]
pub trait AiAnalyzer: Send + Sync {
    /// Label recorded on cost entries.
    fn provider_name(&self) -> &str;

    /// False while the circuit breaker is open.
    fn healthy(&self) -> bool;

    /// Amount to reserve before calling `analyze` for this input.
    fn estimate_cost(&self, input: &AnalysisInput) -> Decimal;

    async fn analyze(
        &self,
        input: &AnalysisInput,
        budget_remaining: Decimal,
    ) -> Result<AiAnalysis, AiError>;
}

/// Deterministic offline analysis.
pub trait FallbackAnalyzer: Send + Sync {
    fn analyze(&self, input: &AnalysisInput) -> Result<Assessment, FallbackFailure>;
}
