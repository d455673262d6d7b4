//! Error types for threatforge.
//!
//! Each pipeline stage owns its error enum. Sandbox errors drive the job to
//! `failed`, AI errors always route to the fallback analyzer, and only a
//! fallback failure is treated as a defect.

use rust_decimal::Decimal;
use uuid::Uuid;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised while loading or validating the tool registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read tool registry {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse tool registry {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Invalid tool '{tool}': {reason}")]
    InvalidTool { tool: String, reason: String },
}

/// Sandbox infrastructure failures. Fatal to the job, never retried.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Tool '{tool}' is not in the registry")]
    UnknownTool { tool: String },

    #[error("Container failed to start: {reason}")]
    StartFailed { reason: String },

    #[error("Container crashed: {reason}")]
    Crashed { reason: String },

    #[error("Tool timed out after {after_secs}s with no usable output")]
    Timeout { after_secs: u64 },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Container runtime error: {reason}")]
    Runtime { reason: String },
}

/// Provider-level errors from the LLM client.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited")]
    RateLimited { provider: String },

    #[error("Provider {provider} rejected credentials")]
    AuthFailed { provider: String },

    #[error("Provider {provider} returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Errors from the AI analysis path. Never fatal to a job.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("AI analyzer is unhealthy (circuit open)")]
    Unhealthy,

    #[error("AI budget rejected: estimated ${estimate} exceeds remaining ${remaining}")]
    BudgetRejected { estimate: Decimal, remaining: Decimal },

    #[error("AI call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error(transparent)]
    Provider(#[from] LlmError),

    #[error("AI response could not be parsed into an assessment: {reason}")]
    InvalidResponse { reason: String },
}

/// The fallback analyzer produced no valid assessment. Indicates a defect.
#[derive(Debug, thiserror::Error)]
#[error("Fallback analysis failed: {reason}")]
pub struct FallbackFailure {
    pub reason: String,
}

/// A commit exceeded the amount reserved for the job. Logged, not surfaced.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Job {job_id} committed ${actual} against a reservation of ${reserved}")]
pub struct CostLedgerViolation {
    pub job_id: Uuid,
    pub reserved: Decimal,
    pub actual: Decimal,
}

/// Rejections at submission time. Nothing is queued.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Unknown tool identifier '{0}'")]
    UnknownTool(String),

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    #[error("Job queue is closed")]
    QueueClosed,
}

/// Errors surfaced by orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },
}

/// Persistence collaborator failures.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
