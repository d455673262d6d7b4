//! In-memory job table.
//!
//! Every worker-side mutation carries the [`RunHandle`] obtained at claim
//! time. A handle from an earlier run of a requeued job no longer matches and
//! its writes are dropped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::job::{Assessment, ExecutionResult, Job, JobStatus};

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal,
}

/// Identity of one claimed run of a job.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub job: Job,
    pub epoch: u64,
    pub cancel: CancellationToken,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.job.id
    }
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    epoch: u64,
    lease: Option<Instant>,
    /// Cancel arrived during `analyzing`; the run settles it after the AI call.
    cancel_requested: bool,
    /// When the terminal record was handed to the sink.
    persisted_at: Option<Instant>,
    execution: Option<ExecutionResult>,
    assessment: Option<Assessment>,
}

impl JobEntry {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job: self.job.clone(),
            cancel_requested: self.cancel_requested,
            execution: self.execution.clone(),
            assessment: self.assessment.clone(),
        }
    }

    /// Move to `next`, unless a deferred cancel is pending, in which case the
    /// job ends `cancelled`. Returns the status actually reached.
    fn settle(&mut self, next: JobStatus) -> Result<JobStatus, OrchestratorError> {
        let next = if self.cancel_requested {
            JobStatus::Cancelled
        } else {
            next
        };
        self.job.transition(next)?;
        Ok(next)
    }
}

/// Snapshot of a job and its children.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job: Job,
    pub cancel_requested: bool,
    pub execution: Option<ExecutionResult>,
    pub assessment: Option<Assessment>,
}

/// What the sweeper did with a stale job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Requeued,
    Failed,
    /// A cancel was waiting on the lost run; it is applied instead of a retry.
    Cancelled,
}

#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: Job) {
        let entry = JobEntry {
            job,
            cancel: CancellationToken::new(),
            epoch: 0,
            lease: None,
            cancel_requested: false,
            persisted_at: None,
            execution: None,
            assessment: None,
        };
        self.jobs.write().await.insert(entry.job.id, entry);
    }

    pub async fn remove(&self, id: Uuid) {
        self.jobs.write().await.remove(&id);
    }

    pub async fn snapshot(&self, id: Uuid) -> Option<JobSnapshot> {
        self.jobs.read().await.get(&id).map(JobEntry::snapshot)
    }

    /// Snapshot only if `run` is still the job's current run.
    pub async fn snapshot_run(&self, run: &RunHandle) -> Option<JobSnapshot> {
        self.jobs
            .read()
            .await
            .get(&run.id())
            .filter(|e| e.epoch == run.epoch)
            .map(JobEntry::snapshot)
    }

    /// Move a pending job to `running` and hand out a fresh run handle.
    ///
    /// Returns `None` if the job is unknown or no longer pending (cancelled
    /// while queued, or already picked up).
    pub async fn claim(&self, id: Uuid) -> Option<RunHandle> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&id)?;
        if entry.job.status != JobStatus::Pending {
            return None;
        }
        entry.job.transition(JobStatus::Running).ok()?;
        entry.epoch += 1;
        entry.lease = Some(Instant::now());
        Some(RunHandle {
            job: entry.job.clone(),
            epoch: entry.epoch,
            cancel: entry.cancel.clone(),
        })
    }

    fn current<'a>(
        jobs: &'a mut HashMap<Uuid, JobEntry>,
        run: &RunHandle,
    ) -> Option<&'a mut JobEntry> {
        jobs.get_mut(&run.id()).filter(|e| e.epoch == run.epoch)
    }

    /// Record the sandbox result and enter `analyzing`.
    pub async fn begin_analysis(
        &self,
        run: &RunHandle,
        execution: ExecutionResult,
    ) -> Result<(), OrchestratorError> {
        let mut jobs = self.jobs.write().await;
        let entry = Self::current(&mut jobs, run).ok_or(OrchestratorError::JobNotFound {
            id: run.id(),
        })?;
        entry.job.transition(JobStatus::Analyzing)?;
        entry.execution = Some(execution);
        Ok(())
    }

    /// Store the assessment and complete the job. With a deferred cancel
    /// pending the assessment is dropped and the job ends `cancelled`.
    pub async fn complete(
        &self,
        run: &RunHandle,
        assessment: Assessment,
    ) -> Result<JobStatus, OrchestratorError> {
        let mut jobs = self.jobs.write().await;
        let entry = Self::current(&mut jobs, run).ok_or(OrchestratorError::JobNotFound {
            id: run.id(),
        })?;
        let reached = entry.settle(JobStatus::Completed)?;
        if reached == JobStatus::Completed {
            entry.assessment = Some(assessment);
        }
        Ok(reached)
    }

    pub async fn fail(&self, run: &RunHandle, reason: &str) -> Result<JobStatus, OrchestratorError> {
        let mut jobs = self.jobs.write().await;
        let entry = Self::current(&mut jobs, run).ok_or(OrchestratorError::JobNotFound {
            id: run.id(),
        })?;
        let reached = entry.settle(JobStatus::Failed)?;
        if reached == JobStatus::Failed {
            entry.job.failure_reason = Some(reason.to_string());
        }
        Ok(reached)
    }

    /// Make sure a run whose token fired ends up `cancelled`.
    pub async fn ensure_cancelled(&self, run: &RunHandle) {
        let mut jobs = self.jobs.write().await;
        if let Some(entry) = Self::current(&mut jobs, run)
            && !entry.job.status.is_terminal()
        {
            let _ = entry.job.transition(JobStatus::Cancelled);
        }
    }

    /// Explicit cancel. Fires the job's token so an in-flight container is
    /// killed and no further AI call is made.
    ///
    /// A job in `analyzing` stays there with the cancel recorded: its AI call
    /// finishes and is accounted for before the run moves it to `cancelled`.
    pub async fn cancel(&self, id: Uuid) -> Result<(CancelOutcome, JobStatus), OrchestratorError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(&id)
            .ok_or(OrchestratorError::JobNotFound { id })?;
        let previous = entry.job.status;
        if previous.is_terminal() {
            return Ok((CancelOutcome::AlreadyTerminal, previous));
        }
        if previous == JobStatus::Analyzing {
            entry.cancel_requested = true;
        } else {
            entry.job.transition(JobStatus::Cancelled)?;
            entry.lease = None;
        }
        entry.cancel.cancel();
        Ok((CancelOutcome::Cancelled, previous))
    }

    pub async fn heartbeat(&self, run: &RunHandle) {
        let mut jobs = self.jobs.write().await;
        if let Some(entry) = Self::current(&mut jobs, run)
            && matches!(entry.job.status, JobStatus::Running | JobStatus::Analyzing)
        {
            entry.lease = Some(Instant::now());
        }
    }

    pub async fn release_lease(&self, run: &RunHandle) {
        let mut jobs = self.jobs.write().await;
        if let Some(entry) = Self::current(&mut jobs, run) {
            entry.lease = None;
        }
    }

    /// Note that the job's terminal record reached the sink.
    pub async fn mark_persisted(&self, id: Uuid) {
        if let Some(entry) = self.jobs.write().await.get_mut(&id)
            && entry.job.status.is_terminal()
        {
            entry.persisted_at = Some(Instant::now());
        }
    }

    /// Drop terminal jobs whose record was persisted more than `retain_for`
    /// ago. Returns the removed ids.
    pub async fn prune_persisted(&self, retain_for: Duration) -> Vec<Uuid> {
        let now = Instant::now();
        let mut jobs = self.jobs.write().await;
        let expired: Vec<Uuid> = jobs
            .values()
            .filter(|e| e.job.status.is_terminal())
            .filter(|e| e.persisted_at.is_some_and(|at| now.duration_since(at) > retain_for))
            .map(|e| e.job.id)
            .collect();
        for id in &expired {
            jobs.remove(id);
        }
        expired
    }

    /// Requeue (once) or fail every in-flight job whose lease is missing or
    /// older than `stale_after`.
    pub async fn recover_stale(&self, stale_after: Duration) -> Vec<(Uuid, Recovery)> {
        let now = Instant::now();
        let mut jobs = self.jobs.write().await;
        let mut recovered = Vec::new();

        for entry in jobs.values_mut() {
            if !matches!(entry.job.status, JobStatus::Running | JobStatus::Analyzing) {
                continue;
            }
            let stale = match entry.lease {
                None => true,
                Some(at) => now.duration_since(at) > stale_after,
            };
            if !stale {
                continue;
            }

            // The previous run may still be alive; stop it and detach it.
            entry.cancel.cancel();
            entry.epoch += 1;
            entry.lease = None;

            let id = entry.job.id;
            if entry.cancel_requested {
                if entry.job.transition(JobStatus::Cancelled).is_ok() {
                    recovered.push((id, Recovery::Cancelled));
                }
            } else if entry.job.recovery_attempts == 0 && entry.job.requeue().is_ok() {
                entry.cancel = CancellationToken::new();
                entry.execution = None;
                recovered.push((id, Recovery::Requeued));
            } else if entry
                .job
                .fail("worker lease expired after recovery attempt")
                .is_ok()
            {
                recovered.push((id, Recovery::Failed));
            }
        }
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobRequest, Severity};

    fn job() -> Job {
        Job::new(JobRequest {
            owner: "owner-1".to_string(),
            tool: "nmap".to_string(),
            target_description: "lab".to_string(),
            severity: Severity::Low,
            attack_vectors: 1,
        })
    }

    #[tokio::test]
    async fn test_claim_only_once() {
        let store = JobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await;

        let run = store.claim(id).await.unwrap();
        assert_eq!(run.job.status, JobStatus::Running);
        assert!(run.job.started_at.is_some());
        assert!(store.claim(id).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_pending_then_claim_skips() {
        let store = JobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await;

        let (outcome, previous) = store.cancel(id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled);
        assert_eq!(previous, JobStatus::Pending);
        assert!(store.claim(id).await.is_none());

        let snapshot = store.snapshot(id).await.unwrap();
        assert!(snapshot.job.started_at.is_none());
        assert!(snapshot.job.completed_at.is_none());
        assert!(snapshot.job.cancelled_at.is_some());

        let (outcome, _) = store.cancel(id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::AlreadyTerminal);
    }

    #[tokio::test]
    async fn test_cancel_unknown() {
        let store = JobStore::new();
        assert!(matches!(
            store.cancel(Uuid::new_v4()).await,
            Err(OrchestratorError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_fires_run_token() {
        let store = JobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await;
        let run = store.claim(id).await.unwrap();

        store.cancel(id).await.unwrap();
        assert!(run.cancel.is_cancelled());
        assert!(store.fail(&run, "late").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_job_requeued_once_then_failed() {
        let store = JobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await;

        let first = store.claim(id).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            store.recover_stale(Duration::from_secs(60)).await,
            vec![(id, Recovery::Requeued)]
        );
        assert!(first.cancel.is_cancelled());

        let snapshot = store.snapshot(id).await.unwrap();
        assert_eq!(snapshot.job.status, JobStatus::Pending);
        assert_eq!(snapshot.job.started_at, first.job.started_at);

        // Writes from the detached first run are dropped.
        assert!(store.fail(&first, "stale writer").await.is_err());

        let second = store.claim(id).await.unwrap();
        assert!(!second.cancel.is_cancelled());
        assert_eq!(second.job.started_at, first.job.started_at);

        // The detached first run cannot touch the second run's lease.
        store.release_lease(&first).await;
        assert!(store.recover_stale(Duration::from_secs(60)).await.is_empty());
        assert!(store.snapshot_run(&first).await.is_none());
        assert!(store.snapshot_run(&second).await.is_some());

        store.release_lease(&second).await;
        assert_eq!(
            store.recover_stale(Duration::from_secs(60)).await,
            vec![(id, Recovery::Failed)]
        );
        let snapshot = store.snapshot(id).await.unwrap();
        assert_eq!(snapshot.job.status, JobStatus::Failed);
        assert!(snapshot.job.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_lease_fresh() {
        let store = JobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await;
        let run = store.claim(id).await.unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(30)).await;
            store.heartbeat(&run).await;
        }
        assert!(store.recover_stale(Duration::from_secs(60)).await.is_empty());
    }

    fn assessment() -> Assessment {
        Assessment {
            vulnerabilities: vec![],
            risk_score: 10,
            confidence: 0.7,
            mitigations: vec!["Close unused ports".to_string()],
            summary: "quiet host".to_string(),
            provenance: crate::job::Provenance::Fallback,
            model: "fallback_rules".to_string(),
        }
    }

    fn execution() -> ExecutionResult {
        ExecutionResult {
            container_id: "c1".to_string(),
            output: "22/tcp open ssh".to_string(),
            exit: crate::job::ExitStatus::Exited(0),
            truncated: false,
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_cancel_during_analysis_is_deferred_to_the_run() {
        let store = JobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await;
        let run = store.claim(id).await.unwrap();
        store.begin_analysis(&run, execution()).await.unwrap();

        let (outcome, previous) = store.cancel(id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled);
        assert_eq!(previous, JobStatus::Analyzing);
        assert!(run.cancel.is_cancelled());

        let snapshot = store.snapshot(id).await.unwrap();
        assert_eq!(snapshot.job.status, JobStatus::Analyzing);
        assert!(snapshot.cancel_requested);
        assert!(snapshot.job.cancelled_at.is_none());

        // The finished analysis is discarded in favour of the cancel.
        assert_eq!(
            store.complete(&run, assessment()).await.unwrap(),
            JobStatus::Cancelled
        );
        let snapshot = store.snapshot(id).await.unwrap();
        assert_eq!(snapshot.job.status, JobStatus::Cancelled);
        assert!(snapshot.assessment.is_none());
        assert!(snapshot.job.completed_at.is_none());
        assert!(snapshot.job.cancelled_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_job_with_pending_cancel_is_cancelled() {
        let store = JobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await;
        let run = store.claim(id).await.unwrap();
        store.begin_analysis(&run, execution()).await.unwrap();
        store.cancel(id).await.unwrap();
        store.release_lease(&run).await;

        assert_eq!(
            store.recover_stale(Duration::from_secs(60)).await,
            vec![(id, Recovery::Cancelled)]
        );
        assert_eq!(store.snapshot(id).await.unwrap().job.status, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_only_old_persisted_terminal_jobs() {
        let store = JobStore::new();
        let (done, running, unsaved) = (job(), job(), job());
        let (done_id, running_id, unsaved_id) = (done.id, running.id, unsaved.id);
        for job in [done, running, unsaved] {
            store.insert(job).await;
        }

        let run = store.claim(done_id).await.unwrap();
        store.fail(&run, "start failed").await.unwrap();
        store.mark_persisted(done_id).await;
        store.claim(running_id).await.unwrap();
        store.mark_persisted(running_id).await;
        store.cancel(unsaved_id).await.unwrap();

        let retain = Duration::from_secs(3600);
        assert!(store.prune_persisted(retain).await.is_empty());

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(store.prune_persisted(retain).await, vec![done_id]);
        assert!(store.snapshot(done_id).await.is_none());
        assert!(store.snapshot(running_id).await.is_some());
        assert!(store.snapshot(unsaved_id).await.is_some());
    }
}
