//! One job, end to end: sandbox, then analysis, then the sink.

use crate::analysis::{AiAnalyzer, AnalysisInput};
use crate::error::SandboxError;
use crate::job::Assessment;
use crate::job::JobStatus;
use crate::orchestrator::Orchestrator;
use crate::orchestrator::store::RunHandle;
use crate::sandbox::ToolInvocation;

/// How the analysis phase ended.
enum Analysis {
    Done(Assessment),
    Cancelled,
    Failed(String),
}

impl Orchestrator {
    /// Drive a claimed run to a terminal state and persist it.
    ///
    /// A run that lost its job to recovery (the job was requeued or failed
    /// under a newer epoch) neither releases the lease nor persists.
    pub async fn run_job(&self, run: RunHandle) {
        let id = run.id();
        tracing::info!(
            job_id = %id,
            tool = %run.job.tool,
            attempt = run.job.recovery_attempts + 1,
            "Job started"
        );

        self.drive(&run).await;

        self.store.release_lease(&run).await;
        match self.store.snapshot_run(&run).await {
            Some(snapshot) => {
                tracing::info!(job_id = %id, status = %snapshot.job.status, "Job finished");
                self.persist_snapshot(snapshot).await;
            }
            None => tracing::debug!(job_id = %id, "Run was superseded, not persisting"),
        }
    }

    async fn drive(&self, run: &RunHandle) {
        let id = run.id();
        let Some(tool) = self.registry.get(&run.job.tool) else {
            let e = SandboxError::UnknownTool {
                tool: run.job.tool.clone(),
            };
            tracing::error!(job_id = %id, error = %e, "Registry changed under a queued job");
            let _ = self.store.fail(run, &e.to_string()).await;
            return;
        };

        let invocation = ToolInvocation::from(&run.job);
        let execution = match self
            .runner
            .execute(&run.job.tool, tool, &invocation, &run.cancel)
            .await
        {
            Ok(execution) => execution,
            Err(SandboxError::Cancelled) => {
                self.store.ensure_cancelled(run).await;
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Sandbox run failed");
                let _ = self.store.fail(run, &e.to_string()).await;
                return;
            }
        };

        if run.cancel.is_cancelled() {
            self.store.ensure_cancelled(run).await;
            return;
        }

        let input = AnalysisInput::new(&run.job, &execution);
        if let Err(e) = self.store.begin_analysis(run, execution).await {
            tracing::debug!(job_id = %id, error = %e, "Job left running state during sandbox run");
            return;
        }

        match self.analyze(run, &input).await {
            Analysis::Done(assessment) => {
                let provenance = assessment.provenance;
                let risk = assessment.risk_score;
                match self.store.complete(run, assessment).await {
                    Ok(JobStatus::Completed) => tracing::info!(
                        job_id = %id,
                        provenance = %provenance,
                        risk_score = risk,
                        "Job completed"
                    ),
                    Ok(status) => {
                        tracing::info!(job_id = %id, status = %status, "Assessment discarded")
                    }
                    Err(e) => {
                        tracing::debug!(job_id = %id, error = %e, "Assessment discarded")
                    }
                }
            }
            Analysis::Cancelled => self.store.ensure_cancelled(run).await,
            Analysis::Failed(reason) => {
                let _ = self.store.fail(run, &reason).await;
            }
        }
    }

    /// AI first when healthy and affordable, otherwise (or on any AI error)
    /// the fallback.
    async fn analyze(&self, run: &RunHandle, input: &AnalysisInput) -> Analysis {
        let id = run.id();
        if run.cancel.is_cancelled() {
            return Analysis::Cancelled;
        }

        if let Some(ai) = &self.ai {
            match self.try_ai(run, ai.as_ref(), input).await {
                Some(Analysis::Done(assessment)) => return Analysis::Done(assessment),
                Some(Analysis::Cancelled) => return Analysis::Cancelled,
                Some(Analysis::Failed(_)) | None => {}
            }
        }

        if run.cancel.is_cancelled() {
            return Analysis::Cancelled;
        }

        match self.fallback.analyze(input) {
            Ok(assessment) => Analysis::Done(assessment),
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Fallback analysis failed, failing job");
                Analysis::Failed(e.to_string())
            }
        }
    }

    /// `None` means the AI path was skipped or failed and the fallback
    /// should run.
    async fn try_ai(
        &self,
        run: &RunHandle,
        ai: &dyn AiAnalyzer,
        input: &AnalysisInput,
    ) -> Option<Analysis> {
        let id = run.id();
        let provider = ai.provider_name();

        if !ai.healthy() {
            tracing::info!(job_id = %id, "AI analyzer unhealthy, using fallback");
            return None;
        }

        let remaining = self.ledger.remaining_for(id).await;
        let estimate = ai.estimate_cost(input);
        if !self.ledger.reserve(id, provider, estimate).await {
            tracing::info!(
                job_id = %id,
                estimate = %estimate,
                remaining = %remaining,
                "AI budget unavailable, using fallback"
            );
            return None;
        }

        // Last check before spending money.
        if run.cancel.is_cancelled() {
            self.ledger.release(id, provider).await;
            return Some(Analysis::Cancelled);
        }

        match ai.analyze(input, remaining).await {
            Ok(analysis) => {
                self.ledger.commit(id, provider, analysis.billed_cost).await;
                if run.cancel.is_cancelled() {
                    tracing::info!(
                        job_id = %id,
                        cost = %analysis.billed_cost,
                        "Job cancelled during AI call, discarding assessment"
                    );
                    return Some(Analysis::Cancelled);
                }
                Some(Analysis::Done(analysis.assessment))
            }
            Err(e) => {
                self.ledger.release(id, provider).await;
                tracing::warn!(job_id = %id, error = %e, "AI analysis failed, using fallback");
                if run.cancel.is_cancelled() {
                    return Some(Analysis::Cancelled);
                }
                Some(Analysis::Failed(e.to_string()))
            }
        }
    }
}
