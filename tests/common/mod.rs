//! Shared fakes for the pipeline integration tests.
//!
//! Nothing here talks to Docker or a real AI provider.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use threatforge::analysis::{
    AiAnalysis, AiAnalyzer, AnalysisInput, FallbackAnalyzer, RuleBasedAnalyzer,
};
use threatforge::config::{CostConfig, DispatcherConfig, SandboxConfig};
use threatforge::cost::CostLedger;
use threatforge::error::{AiError, FallbackFailure, LlmError, SandboxError};
use threatforge::llm::{CompletionRequest, CompletionResponse, LlmProvider};
use threatforge::job::{Assessment, JobRequest, JobStatus, Provenance, Severity};
use threatforge::orchestrator::{
    JobQueue, JobRecord, JobStatusView, MemorySink, Orchestrator, OrchestratorParts,
};
use threatforge::sandbox::{
    ContainerRuntime, ContainerSpec, SandboxRunner, ToolConfig, ToolRegistry,
};
use threatforge::worker::Dispatcher;

// ---------------------------------------------------------------------------
// Container runtime
// ---------------------------------------------------------------------------

pub struct FakeRuntime {
    pub run_for: Duration,
    pub exit_code: i64,
    pub output: &'static str,
    pub fail_create: bool,
    pub panic_on_create: bool,
    pub created: AtomicUsize,
    pub live: Mutex<HashSet<String>>,
    pub killed: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new(run_for: Duration, exit_code: i64, output: &'static str) -> Self {
        Self {
            run_for,
            exit_code,
            output,
            fail_create: false,
            panic_on_create: false,
            created: AtomicUsize::new(0),
            live: Mutex::new(HashSet::new()),
            killed: Mutex::new(Vec::new()),
        }
    }

    pub fn quick(output: &'static str) -> Self {
        Self::new(Duration::from_millis(100), 0, output)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn kill_count(&self) -> usize {
        self.killed.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        if self.panic_on_create {
            panic!("container runtime exploded");
        }
        if self.fail_create {
            return Err(SandboxError::StartFailed {
                reason: "image not found".to_string(),
            });
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().insert(spec.name.clone());
        Ok(spec.name.clone())
    }

    async fn start(&self, _id: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn wait(&self, _id: &str) -> Result<i64, SandboxError> {
        tokio::time::sleep(self.run_for).await;
        Ok(self.exit_code)
    }

    async fn logs(&self, _id: &str, max: usize) -> Result<(Vec<u8>, bool), SandboxError> {
        let bytes = self.output.as_bytes();
        Ok((bytes[..bytes.len().min(max)].to_vec(), bytes.len() > max))
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        self.killed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        self.live.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<String>, SandboxError> {
        Ok(self.live.lock().unwrap().iter().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Analyzers
// ---------------------------------------------------------------------------

pub enum AiBehavior {
    Succeed,
    /// Sleeps past its deadline, then reports a timeout.
    Timeout,
    /// Signals `entered`, then waits for `release` before succeeding.
    Block,
}

pub struct ScriptedAi {
    pub behavior: AiBehavior,
    pub cost: Decimal,
    pub estimate: Decimal,
    pub healthy: AtomicBool,
    pub calls: AtomicUsize,
    pub entered: Notify,
    pub release: Notify,
}

impl ScriptedAi {
    pub fn new(behavior: AiBehavior, cost: Decimal) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            cost,
            estimate: cost,
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn assessment() -> Assessment {
        Assessment {
            vulnerabilities: vec![],
            risk_score: 33,
            confidence: 0.85,
            mitigations: vec!["Patch the web tier".to_string()],
            summary: "Scripted AI assessment".to_string(),
            provenance: Provenance::Ai,
            model: "scripted".to_string(),
        }
    }
}

#[async_trait]
impl AiAnalyzer for ScriptedAi {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn estimate_cost(&self, _input: &AnalysisInput) -> Decimal {
        self.estimate
    }

    async fn analyze(
        &self,
        _input: &AnalysisInput,
        _budget_remaining: Decimal,
    ) -> Result<AiAnalysis, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            AiBehavior::Succeed => {}
            AiBehavior::Timeout => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                return Err(AiError::Timeout { secs: 30 });
            }
            AiBehavior::Block => {
                self.entered.notify_one();
                self.release.notified().await;
            }
        }
        Ok(AiAnalysis {
            assessment: Self::assessment(),
            billed_cost: self.cost,
        })
    }
}

/// Provider whose every call fails with a server error.
pub struct FailingProvider {
    pub calls: AtomicUsize,
}

impl FailingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    fn model_name(&self) -> &str {
        "llama3-8b-8192"
    }

    async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(LlmError::RequestFailed {
            provider: "failing".to_string(),
            reason: "HTTP 503".to_string(),
        })
    }
}

/// A fallback that never produces an assessment.
pub struct BrokenFallback;

impl FallbackAnalyzer for BrokenFallback {
    fn analyze(&self, _input: &AnalysisInput) -> Result<Assessment, FallbackFailure> {
        Err(FallbackFailure {
            reason: "rule table unavailable".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub runtime: Arc<FakeRuntime>,
    pub ledger: Arc<CostLedger>,
    pub sink: Arc<MemorySink>,
    concurrency: usize,
    retention: Duration,
    dispatcher: Option<Dispatcher>,
    queue: Option<Arc<JobQueue>>,
}

pub struct HarnessBuilder {
    runtime: FakeRuntime,
    ai: Option<Arc<dyn AiAnalyzer>>,
    fallback: Arc<dyn FallbackAnalyzer>,
    cost: CostConfig,
    tool_timeout_secs: Option<u64>,
    concurrency: usize,
    retention: Duration,
    start_dispatcher: bool,
}

impl HarnessBuilder {
    pub fn new(runtime: FakeRuntime) -> Self {
        Self {
            runtime,
            ai: None,
            fallback: Arc::new(RuleBasedAnalyzer::new()),
            cost: CostConfig::default(),
            tool_timeout_secs: None,
            concurrency: 2,
            retention: Duration::from_secs(24 * 60 * 60),
            start_dispatcher: true,
        }
    }

    pub fn ai(mut self, ai: Arc<dyn AiAnalyzer>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn FallbackAnalyzer>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn cost(mut self, per_job: Decimal, aggregate: Decimal) -> Self {
        self.cost = CostConfig {
            per_job_ceiling: per_job,
            aggregate_ceiling: aggregate,
        };
        self
    }

    pub fn tool_timeout(mut self, secs: u64) -> Self {
        self.tool_timeout_secs = Some(secs);
        self
    }

    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Leave the dispatcher stopped until [`Harness::start`].
    pub fn paused(mut self) -> Self {
        self.start_dispatcher = false;
        self
    }

    pub fn build(self) -> Harness {
        let tools = HashMap::from([(
            "nmap".to_string(),
            ToolConfig {
                image: "instrumentisto/nmap:latest".to_string(),
                command: vec!["-sV".to_string(), "{target}".to_string()],
                environment: BTreeMap::new(),
                volumes: vec![],
                timeout_secs: self.tool_timeout_secs,
                network: false,
                memory_limit_mb: None,
            },
        )]);
        let registry = Arc::new(ToolRegistry::new(tools).unwrap());

        let runtime = Arc::new(self.runtime);
        let runner = Arc::new(SandboxRunner::new(
            runtime.clone(),
            SandboxConfig {
                default_timeout_secs: 60,
                ..SandboxConfig::default()
            },
        ));
        let ledger = Arc::new(CostLedger::new(self.cost));
        let sink = Arc::new(MemorySink::new());

        let (orchestrator, queue) = Orchestrator::new(OrchestratorParts {
            registry,
            runner,
            ai: self.ai,
            fallback: self.fallback,
            ledger: ledger.clone(),
            sink: sink.clone(),
        });

        let mut harness = Harness {
            orchestrator,
            runtime,
            ledger,
            sink,
            concurrency: self.concurrency,
            retention: self.retention,
            dispatcher: None,
            queue: Some(queue),
        };
        if self.start_dispatcher {
            harness.start();
        }
        harness
    }
}

impl Harness {
    pub fn start(&mut self) {
        let Some(queue) = self.queue.take() else {
            return;
        };
        let config = DispatcherConfig {
            concurrency: self.concurrency,
            heartbeat_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(2),
            retention: self.retention,
        };
        self.dispatcher = Some(Dispatcher::spawn(
            self.orchestrator.clone(),
            queue,
            config,
            CancellationToken::new(),
        ));
    }

    pub async fn stop(mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown();
            dispatcher.join().await;
        }
    }

    pub async fn submit(&self, target: &str) -> Uuid {
        self.orchestrator
            .submit(request("nmap", target))
            .await
            .expect("submit")
    }

    pub async fn wait_terminal(&self, id: Uuid) -> JobStatusView {
        for _ in 0..10_000 {
            if let Some(view) = self.orchestrator.status(id).await
                && view.status.is_terminal()
            {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {} never reached a terminal state", id);
    }

    pub async fn wait_status(&self, id: Uuid, status: JobStatus) {
        for _ in 0..10_000 {
            if let Some(view) = self.orchestrator.status(id).await
                && view.status == status
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    /// Wait until the job's record reached the sink.
    pub async fn wait_record(&self, id: Uuid) -> JobRecord {
        for _ in 0..10_000 {
            if let Some(record) = self
                .sink
                .records()
                .await
                .into_iter()
                .find(|r| r.job.id == id)
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} was never persisted", id);
    }
}

pub fn request(tool: &str, target: &str) -> JobRequest {
    JobRequest {
        owner: "tester".to_string(),
        tool: tool.to_string(),
        target_description: target.to_string(),
        severity: Severity::Medium,
        attack_vectors: 3,
    }
}
