//! Job aggregate and its lifecycle state machine.
//!
//! ```text
//!   pending ──► running ──► analyzing ──► completed
//!      │           │  │          │  │
//!      │           │  └► failed ◄┘  │
//!      └───────────┴──► cancelled ◄─┘
//! ```
//!
//! `running`/`analyzing` may also go back to `pending` once, through
//! [`Job::requeue`], when a worker is lost mid-job.

mod result;

pub use result::{Assessment, ExecutionResult, ExitStatus, Provenance, Vulnerability};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestratorError;

/// Bounds on the requested attack-vector count.
pub const MIN_ATTACK_VECTORS: u32 = 1;
pub const MAX_ATTACK_VECTORS: u32 = 100;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Analyzing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Forward transitions of the state machine. Recovery requeue is not
    /// included here; it goes through [`Job::requeue`].
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Analyzing)
                | (Running, Failed)
                | (Analyzing, Completed)
                | (Analyzing, Failed)
                | (Pending, Cancelled)
                | (Running, Cancelled)
                | (Analyzing, Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested attack severity. Ordered from least to most aggressive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "moderate" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!(
                "invalid severity '{}', expected one of: low, medium, high, critical",
                other
            )),
        }
    }
}

/// A job submission as received from the external API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub owner: String,
    pub tool: String,
    pub target_description: String,
    pub severity: Severity,
    pub attack_vectors: u32,
}

/// The root aggregate of one attack simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner: String,
    pub tool: String,
    pub target_description: String,
    pub severity: Severity,
    pub attack_vectors: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// How many times the job was requeued after losing its worker.
    pub recovery_attempts: u32,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: request.owner,
            tool: request.tool,
            target_description: request.target_description,
            severity: request.severity,
            attack_vectors: request.attack_vectors,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            failure_reason: None,
            recovery_attempts: 0,
        }
    }

    /// Apply a forward transition, stamping the matching timestamp.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), OrchestratorError> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match next {
            JobStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            JobStatus::Completed | JobStatus::Failed => {
                // Never earlier than started_at, even with a skewed wall clock.
                let started = self.started_at.unwrap_or(now);
                self.completed_at = Some(now.max(started));
            }
            JobStatus::Cancelled => self.cancelled_at = Some(now),
            JobStatus::Pending | JobStatus::Analyzing => {}
        }
        self.status = next;
        Ok(())
    }

    /// Mark the job failed with a human-readable reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), OrchestratorError> {
        self.transition(JobStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Put an orphaned `running`/`analyzing` job back in the queue.
    ///
    /// `started_at` keeps the first pickup time.
    pub fn requeue(&mut self) -> Result<(), OrchestratorError> {
        if !matches!(self.status, JobStatus::Running | JobStatus::Analyzing) {
            return Err(OrchestratorError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: JobStatus::Pending.to_string(),
            });
        }
        self.status = JobStatus::Pending;
        self.recovery_attempts += 1;
        Ok(())
    }
}

/// Validate a submission that does not depend on the tool registry.
pub fn validate_request(request: &JobRequest) -> Result<(), String> {
    if request.target_description.trim().is_empty() {
        return Err("target description must not be empty".to_string());
    }
    if !(MIN_ATTACK_VECTORS..=MAX_ATTACK_VECTORS).contains(&request.attack_vectors) {
        return Err(format!(
            "attack vector count must be between {} and {}, got {}",
            MIN_ATTACK_VECTORS, MAX_ATTACK_VECTORS, request.attack_vectors
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> JobRequest {
        JobRequest {
            owner: "user-1".to_string(),
            tool: "nmap".to_string(),
            target_description: "10.0.0.5".to_string(),
            severity: Severity::High,
            attack_vectors: 3,
        }
    }

    #[test]
    fn test_happy_path_timestamps() {
        let mut job = Job::new(request());
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());

        job.transition(JobStatus::Running).unwrap();
        let started = job.started_at.unwrap();
        job.transition(JobStatus::Analyzing).unwrap();
        assert!(job.completed_at.is_none());
        job.transition(JobStatus::Completed).unwrap();

        assert!(job.completed_at.unwrap() >= started);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut job = Job::new(request());
        job.transition(JobStatus::Cancelled).unwrap();
        assert!(job.cancelled_at.is_some());
        assert!(job.completed_at.is_none());

        let err = job.transition(JobStatus::Running).unwrap_err();
        assert!(err.to_string().contains("cancelled -> running"));
    }

    #[test]
    fn test_pending_cannot_skip_to_analyzing_or_fail() {
        let mut job = Job::new(request());
        assert!(job.transition(JobStatus::Analyzing).is_err());
        assert!(job.fail("nope").is_err());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_fail_records_reason_and_completed_at() {
        let mut job = Job::new(request());
        job.transition(JobStatus::Running).unwrap();
        job.fail("container failed to start").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.failure_reason.as_deref(),
            Some("container failed to start")
        );
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_requeue_keeps_started_at() {
        let mut job = Job::new(request());
        job.transition(JobStatus::Running).unwrap();
        let first_start = job.started_at;

        job.requeue().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.recovery_attempts, 1);

        job.transition(JobStatus::Running).unwrap();
        assert_eq!(job.started_at, first_start);
    }

    #[test]
    fn test_requeue_rejected_from_pending() {
        let mut job = Job::new(request());
        assert!(job.requeue().is_err());
    }

    #[test]
    fn test_severity_parse_and_order() {
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert!(Severity::Critical > Severity::Low);
        assert!("extreme".parse::<Severity>().is_err());
    }

    #[test]
    fn test_validate_request_bounds() {
        let mut req = request();
        assert!(validate_request(&req).is_ok());

        req.attack_vectors = 0;
        assert!(validate_request(&req).is_err());
        req.attack_vectors = 101;
        assert!(validate_request(&req).is_err());

        req.attack_vectors = 5;
        req.target_description = "   ".to_string();
        assert!(validate_request(&req).is_err());
    }
}
