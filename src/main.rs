//! threatforge - main entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use threatforge::{
    analysis::{AiAnalyzer, LlmAnalyzer, RuleBasedAnalyzer},
    config::Config,
    cost::CostLedger,
    job::{JobRequest, Severity},
    llm::create_llm_provider,
    orchestrator::{JsonLinesSink, Orchestrator, OrchestratorParts},
    sandbox::{DockerRuntime, SandboxRunner, ToolRegistry},
    worker::Dispatcher,
};

#[derive(Parser, Debug)]
#[command(name = "threatforge")]
#[command(about = "Run attack simulations in sandboxed containers and analyze the results")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one simulation and print its final status as JSON
    Run {
        /// Tool identifier from the registry (see `threatforge tools`)
        #[arg(long)]
        tool: String,

        /// Free-text description of the target system
        #[arg(long)]
        target: String,

        /// low, medium, high or critical
        #[arg(long, default_value = "medium")]
        severity: Severity,

        /// Number of attack vectors to exercise (1-100)
        #[arg(long, default_value_t = 1)]
        vectors: u32,

        /// Owner reference recorded on the job
        #[arg(long, default_value = "cli")]
        owner: String,
    },

    /// List the tools in the registry
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("threatforge=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    let registry = Arc::new(ToolRegistry::load_or_builtin(config.tools_path.as_deref())?);

    match args.command {
        Command::Tools => {
            for name in registry.names() {
                if let Some(tool) = registry.get(&name) {
                    println!("{:<12} {}", name, tool.image);
                }
            }
            Ok(())
        }
        Command::Run {
            tool,
            target,
            severity,
            vectors,
            owner,
        } => {
            let request = JobRequest {
                owner,
                tool,
                target_description: target,
                severity,
                attack_vectors: vectors,
            };
            run(config, registry, request).await
        }
    }
}

async fn run(
    config: Config,
    registry: Arc<ToolRegistry>,
    request: JobRequest,
) -> anyhow::Result<()> {
    let runtime = Arc::new(DockerRuntime::new(
        config.sandbox.auto_pull_image,
        config.sandbox.pull_timeout(),
    ));
    let runner = Arc::new(SandboxRunner::new(runtime, config.sandbox.clone()));

    match runner.reap_orphans().await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Removed {} orphaned tool containers", n),
        Err(e) => tracing::warn!(error = %e, "Could not reap orphaned containers"),
    }

    let ai: Option<Arc<dyn AiAnalyzer>> = create_llm_provider(&config.ai)?
        .map(|provider| Arc::new(LlmAnalyzer::new(provider, &config.ai)) as Arc<dyn AiAnalyzer>);

    tracing::info!(results = %config.results_path.display(), "Writing job records");
    let (orchestrator, queue) = Orchestrator::new(OrchestratorParts {
        registry,
        runner,
        ai,
        fallback: Arc::new(RuleBasedAnalyzer::new()),
        ledger: Arc::new(CostLedger::new(config.cost.clone())),
        sink: Arc::new(JsonLinesSink::new(config.results_path.clone())),
    });

    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::spawn(
        Arc::clone(&orchestrator),
        queue,
        config.dispatcher.clone(),
        shutdown.clone(),
    );

    let id = orchestrator
        .submit(request)
        .await
        .context("job was rejected")?;

    let mut poll = tokio::time::interval(Duration::from_millis(500));
    let view = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(job_id = %id, "Interrupted, cancelling job");
                orchestrator.cancel(id).await?;
            }
            _ = poll.tick() => {}
        }
        if let Some(view) = orchestrator.status(id).await
            && view.status.is_terminal()
        {
            break view;
        }
    };

    dispatcher.shutdown();
    dispatcher.join().await;

    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
