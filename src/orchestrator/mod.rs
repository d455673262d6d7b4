//! Job lifecycle owner.
//!
//! ```text
//! submit ──► queue ──► Dispatcher worker ──► run_job
//!                                              │
//!             pending ─► running ─► analyzing ─► completed
//!                          │            │
//!                          └─► failed ◄─┘      (any non-terminal) ─► cancelled
//! ```
//!
//! The orchestrator is the only writer of job state. Sandbox, analyzers and
//! the ledger are collaborators it drives; finished jobs are handed to a
//! [`ResultSink`].

mod pipeline;
mod sink;
mod store;

pub use sink::{JobRecord, JsonLinesSink, MemorySink, ResultSink};
pub use store::{CancelOutcome, JobSnapshot, Recovery, RunHandle};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::analysis::{AiAnalyzer, FallbackAnalyzer};
use crate::cost::{CostLedger, CostSummary};
use crate::error::{OrchestratorError, SubmitError};
use crate::job::{Assessment, Job, JobRequest, JobStatus, validate_request};
use crate::sandbox::{SandboxRunner, ToolRegistry};

use self::store::JobStore;

/// Externally visible state of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub owner: String,
    pub tool: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// A cancel is waiting for the in-flight AI call to return.
    pub cancel_requested: bool,
    pub assessment: Option<Assessment>,
    pub cost: Option<CostSummary>,
}

/// Receiving half of the job queue, shared by the dispatcher's workers.
pub struct JobQueue {
    receiver: Mutex<mpsc::UnboundedReceiver<Uuid>>,
}

impl JobQueue {
    /// Wait for the next queued job id. `None` once every sender is gone.
    pub async fn next(&self) -> Option<Uuid> {
        self.receiver.lock().await.recv().await
    }
}

/// Collaborators the orchestrator drives.
pub struct OrchestratorParts {
    pub registry: Arc<ToolRegistry>,
    pub runner: Arc<SandboxRunner>,
    /// `None` runs every job through the fallback analyzer.
    pub ai: Option<Arc<dyn AiAnalyzer>>,
    pub fallback: Arc<dyn FallbackAnalyzer>,
    pub ledger: Arc<CostLedger>,
    pub sink: Arc<dyn ResultSink>,
}

pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    runner: Arc<SandboxRunner>,
    ai: Option<Arc<dyn AiAnalyzer>>,
    fallback: Arc<dyn FallbackAnalyzer>,
    ledger: Arc<CostLedger>,
    sink: Arc<dyn ResultSink>,
    store: JobStore,
    queue: mpsc::UnboundedSender<Uuid>,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> (Arc<Self>, Arc<JobQueue>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            registry: parts.registry,
            runner: parts.runner,
            ai: parts.ai,
            fallback: parts.fallback,
            ledger: parts.ledger,
            sink: parts.sink,
            store: JobStore::new(),
            queue: tx,
        });
        let queue = Arc::new(JobQueue {
            receiver: Mutex::new(rx),
        });
        (orchestrator, queue)
    }

    /// Validate and enqueue a new job.
    pub async fn submit(&self, request: JobRequest) -> Result<Uuid, SubmitError> {
        if !self.registry.contains(&request.tool) {
            return Err(SubmitError::UnknownTool(request.tool));
        }
        validate_request(&request).map_err(SubmitError::InvalidRequest)?;

        let job = Job::new(request);
        let id = job.id;
        let (owner, tool) = (job.owner.clone(), job.tool.clone());
        self.store.insert(job).await;

        if self.queue.send(id).is_err() {
            self.store.remove(id).await;
            return Err(SubmitError::QueueClosed);
        }

        tracing::info!(job_id = %id, owner = %owner, tool = %tool, "Job submitted");
        Ok(id)
    }

    pub async fn status(&self, id: Uuid) -> Option<JobStatusView> {
        let snapshot = self.store.snapshot(id).await?;
        let cost = {
            let record = self.ledger.record(id).await;
            if record.entries.is_empty() && record.reserved.is_zero() {
                None
            } else {
                Some(self.ledger.cost_summary(Some(id)).await)
            }
        };
        let job = snapshot.job;
        Some(JobStatusView {
            id: job.id,
            owner: job.owner,
            tool: job.tool,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            cancelled_at: job.cancelled_at,
            failure_reason: job.failure_reason,
            cancel_requested: snapshot.cancel_requested,
            assessment: snapshot.assessment,
            cost,
        })
    }

    /// Cancel a non-terminal job. An in-flight container is killed; a job in
    /// `analyzing` lets its AI call finish, is charged for it, and then ends
    /// `cancelled` with the result discarded.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, OrchestratorError> {
        let (outcome, previous) = self.store.cancel(id).await?;
        match outcome {
            CancelOutcome::Cancelled if previous == JobStatus::Analyzing => {
                tracing::info!(job_id = %id, "Cancel requested, waiting for AI call to return");
            }
            CancelOutcome::Cancelled => {
                tracing::info!(job_id = %id, from = %previous, "Job cancelled");
                // Nobody will run a queued job again; record it here.
                if previous == JobStatus::Pending {
                    self.persist(id).await;
                }
            }
            CancelOutcome::AlreadyTerminal => {
                tracing::debug!(job_id = %id, status = %previous, "Cancel ignored for terminal job");
            }
        }
        Ok(outcome)
    }

    /// Take a queued job for a run. `None` if it is no longer pending
    /// (cancelled while queued, or claimed elsewhere).
    pub async fn claim(&self, id: Uuid) -> Option<RunHandle> {
        self.store.claim(id).await
    }

    /// Refresh the lease of a run whose worker is still alive.
    pub async fn heartbeat(&self, run: &RunHandle) {
        self.store.heartbeat(run).await;
    }

    /// Drop the lease of a run whose task died.
    pub async fn release_lease(&self, run: &RunHandle) {
        self.store.release_lease(run).await;
    }

    /// Requeue (once) or fail in-flight jobs that lost their worker.
    pub async fn recover_stale(&self, stale_after: Duration) -> Vec<(Uuid, Recovery)> {
        let recovered = self.store.recover_stale(stale_after).await;
        for &(id, recovery) in &recovered {
            match recovery {
                Recovery::Requeued => {
                    tracing::warn!(job_id = %id, "Requeueing job after lost worker lease");
                    if self.queue.send(id).is_err() {
                        tracing::error!(job_id = %id, "Job queue closed, requeued job will not run");
                    }
                }
                Recovery::Failed => {
                    tracing::error!(job_id = %id, "Job failed after losing its worker twice");
                    self.persist(id).await;
                }
                Recovery::Cancelled => {
                    tracing::warn!(job_id = %id, "Lost worker of a job with a pending cancel");
                    self.persist(id).await;
                }
            }
        }
        recovered
    }

    /// Forget terminal jobs whose record reached the sink more than
    /// `retain_for` ago, together with their ledger entries.
    pub async fn prune_finished(&self, retain_for: Duration) -> Vec<Uuid> {
        let pruned = self.store.prune_persisted(retain_for).await;
        if !pruned.is_empty() {
            self.ledger.forget(&pruned).await;
            tracing::info!(count = pruned.len(), "Pruned finished jobs past retention");
        }
        pruned
    }

    /// Hand the job's final state to the sink. Failures are logged only.
    async fn persist(&self, id: Uuid) {
        if let Some(snapshot) = self.store.snapshot(id).await {
            self.persist_snapshot(snapshot).await;
        }
    }

    async fn persist_snapshot(&self, snapshot: JobSnapshot) {
        let id = snapshot.job.id;
        let record = JobRecord {
            cost: self.ledger.record(id).await,
            job: snapshot.job,
            execution: snapshot.execution,
            assessment: snapshot.assessment,
        };
        if let Err(e) = self.sink.persist(&record).await {
            tracing::error!(job_id = %id, error = %e, "Failed to persist job record");
        }
        self.store.mark_persisted(id).await;
    }
}
