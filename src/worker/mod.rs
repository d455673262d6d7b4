//! Bounded worker pool pulling jobs off the orchestrator queue.
//!
//! ```text
//! JobQueue ──► worker 1 ─┐
//!          ──► worker 2 ─┼─► spawn(run_job) + lease heartbeat
//!          ──► worker N ─┘
//! sweeper: every sweep_interval, requeue-once-then-fail stale jobs and
//!          prune finished jobs past retention
//! ```
//!
//! Each job runs in its own task so a panic is contained to that job; the
//! worker drops the lease and the sweeper takes it from there.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::orchestrator::{JobQueue, Orchestrator};

pub struct Dispatcher {
    workers: Vec<JoinHandle<()>>,
    sweeper: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Start `config.concurrency` workers and the recovery sweeper.
    pub fn spawn(
        orchestrator: Arc<Orchestrator>,
        queue: Arc<JobQueue>,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        tracing::info!(concurrency, "Starting job dispatcher");

        let workers = (0..concurrency)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&orchestrator),
                    Arc::clone(&queue),
                    config.heartbeat_interval,
                    shutdown.clone(),
                ))
            })
            .collect();

        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&orchestrator),
            config.clone(),
            shutdown.clone(),
        ));

        Self {
            workers,
            sweeper,
            shutdown,
        }
    }

    /// Stop taking new jobs. Jobs already running finish normally.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for all workers and the sweeper to exit.
    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
        let _ = self.sweeper.await;
        tracing::info!("Job dispatcher stopped");
    }
}

async fn worker_loop(
    worker: usize,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<JobQueue>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
) {
    tracing::debug!(worker, "Worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            id = queue.next() => id,
        };
        let Some(id) = next else {
            break;
        };
        run_supervised(&orchestrator, id, heartbeat_interval).await;
    }
    tracing::debug!(worker, "Worker exiting");
}

/// Run one job in its own task, heartbeating its lease until it ends.
async fn run_supervised(orchestrator: &Arc<Orchestrator>, id: Uuid, heartbeat_interval: Duration) {
    let Some(run) = orchestrator.claim(id).await else {
        tracing::debug!(job_id = %id, "Job no longer pending, skipping");
        return;
    };

    let job_orchestrator = Arc::clone(orchestrator);
    let job_run = run.clone();
    let mut task = tokio::spawn(async move { job_orchestrator.run_job(job_run).await });

    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = &mut task => {
                if let Err(e) = result {
                    if e.is_panic() {
                        tracing::error!(job_id = %id, "Job task panicked, leaving it to recovery");
                    } else {
                        tracing::warn!(job_id = %id, error = %e, "Job task aborted");
                    }
                    orchestrator.release_lease(&run).await;
                }
                break;
            }
            _ = heartbeat.tick() => orchestrator.heartbeat(&run).await,
        }
    }
}

async fn sweep_loop(
    orchestrator: Arc<Orchestrator>,
    config: DispatcherConfig,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.sweep_interval) => {
                let recovered = orchestrator.recover_stale(config.stale_after).await;
                if !recovered.is_empty() {
                    tracing::info!(count = recovered.len(), "Recovery sweep handled stale jobs");
                }
                orchestrator.prune_finished(config.retention).await;
            }
        }
    }
}
