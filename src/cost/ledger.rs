use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::CostConfig;
use crate::error::CostLedgerViolation;

/// What happened to a ledger entry's amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostOutcome {
    /// Billed spend, counted against both ceilings.
    Committed,
    /// A reservation handed back unused.
    Released,
    /// A reservation refused; no call was made.
    Rejected,
}

/// One per-call ledger line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    pub at: DateTime<Utc>,
    pub amount: Decimal,
    pub provider: String,
    pub outcome: CostOutcome,
}

/// Cost view of a single job, handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub job_id: Uuid,
    pub committed: Decimal,
    pub reserved: Decimal,
    pub ceiling: Decimal,
    pub entries: Vec<CostEntry>,
}

/// Totals for one job or for the whole accounting period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub committed: Decimal,
    pub reserved: Decimal,
    pub ceiling: Decimal,
    pub remaining: Decimal,
    pub calls: usize,
    pub period_start: NaiveDate,
}

#[derive(Debug, Default)]
struct JobCost {
    committed: Decimal,
    reserved: Decimal,
    entries: Vec<CostEntry>,
}

impl JobCost {
    fn calls(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome == CostOutcome::Committed)
            .count()
    }
}

struct LedgerState {
    jobs: HashMap<Uuid, JobCost>,
    /// Committed spend in the current period.
    period_committed: Decimal,
    /// Outstanding reservations, across periods.
    outstanding: Decimal,
    period_calls: usize,
    /// Day boundary (midnight UTC) for resetting the aggregate counter.
    period_start: NaiveDate,
}

impl LedgerState {
    fn roll_period(&mut self, today: NaiveDate) {
        if today != self.period_start {
            tracing::info!(
                previous = %self.period_start,
                spent = %self.period_committed,
                "Cost ledger: aggregate counter reset for {}",
                today
            );
            self.period_committed = Decimal::ZERO;
            self.period_calls = 0;
            self.period_start = today;
        }
    }
}

/// Serialized per-job and aggregate AI spend tracking.
///
/// All decisions go through one mutex, so concurrent reservations can never
/// jointly pass the aggregate ceiling. Designed to be shared via
/// `Arc<CostLedger>`.
pub struct CostLedger {
    config: CostConfig,
    state: Mutex<LedgerState>,
}

impl CostLedger {
    pub fn new(config: CostConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LedgerState {
                jobs: HashMap::new(),
                period_committed: Decimal::ZERO,
                outstanding: Decimal::ZERO,
                period_calls: 0,
                period_start: Utc::now().date_naive(),
            }),
        }
    }

    /// Try to set aside `amount` for an upcoming call.
    ///
    /// Succeeds only if the job stays within its ceiling and the period stays
    /// within the aggregate ceiling, counting outstanding reservations.
    pub async fn reserve(&self, job_id: Uuid, provider: &str, amount: Decimal) -> bool {
        let mut state = self.state.lock().await;
        state.roll_period(Utc::now().date_naive());

        let amount = amount.max(Decimal::ZERO);
        let job = state.jobs.entry(job_id).or_default();
        let job_total = job.committed + job.reserved + amount;
        let job_ok = job_total <= self.config.per_job_ceiling;

        let aggregate_total = state.period_committed + state.outstanding + amount;
        let aggregate_ok = aggregate_total <= self.config.aggregate_ceiling;

        let job = state.jobs.entry(job_id).or_default();
        if !(job_ok && aggregate_ok) {
            job.entries.push(CostEntry {
                at: Utc::now(),
                amount,
                provider: provider.to_string(),
                outcome: CostOutcome::Rejected,
            });
            tracing::info!(
                job_id = %job_id,
                amount = %amount,
                job_ok,
                aggregate_ok,
                "Cost ledger rejected reservation"
            );
            return false;
        }

        job.reserved += amount;
        state.outstanding += amount;
        true
    }

    /// Convert the job's reservation into billed spend of `actual`.
    ///
    /// Spend above the reservation is recorded anyway (the call already
    /// happened) and reported as a violation.
    pub async fn commit(
        &self,
        job_id: Uuid,
        provider: &str,
        actual: Decimal,
    ) -> Option<CostLedgerViolation> {
        let mut state = self.state.lock().await;
        state.roll_period(Utc::now().date_naive());

        let actual = actual.max(Decimal::ZERO);
        let job = state.jobs.entry(job_id).or_default();
        let reserved = job.reserved;
        job.reserved = Decimal::ZERO;
        job.committed += actual;
        job.entries.push(CostEntry {
            at: Utc::now(),
            amount: actual,
            provider: provider.to_string(),
            outcome: CostOutcome::Committed,
        });

        state.outstanding = (state.outstanding - reserved).max(Decimal::ZERO);
        state.period_committed += actual;
        state.period_calls += 1;

        let violation = (actual > reserved).then(|| CostLedgerViolation {
            job_id,
            reserved,
            actual,
        });
        if let Some(ref v) = violation {
            tracing::warn!(job_id = %job_id, overage = %(actual - reserved), "{}", v);
        }

        let limit = self.config.aggregate_ceiling;
        if limit > Decimal::ZERO {
            let spent = state.period_committed;
            if spent >= limit {
                tracing::warn!("Aggregate AI cost limit reached: ${} of ${}", spent, limit);
            } else if spent >= limit * dec!(0.8) {
                tracing::warn!(
                    "Approaching aggregate AI cost limit: ${} of ${} ({}%)",
                    spent,
                    limit,
                    (spent * dec!(100) / limit).trunc()
                );
            }
        }

        violation
    }

    /// Hand back the job's outstanding reservation without spending it.
    pub async fn release(&self, job_id: Uuid, provider: &str) {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return;
        };
        let reserved = job.reserved;
        if reserved.is_zero() {
            return;
        }
        job.reserved = Decimal::ZERO;
        job.entries.push(CostEntry {
            at: Utc::now(),
            amount: reserved,
            provider: provider.to_string(),
            outcome: CostOutcome::Released,
        });
        state.outstanding = (state.outstanding - reserved).max(Decimal::ZERO);
    }

    /// Budget the job could still reserve under its own ceiling.
    pub async fn remaining_for(&self, job_id: Uuid) -> Decimal {
        let state = self.state.lock().await;
        let used = state
            .jobs
            .get(&job_id)
            .map(|j| j.committed + j.reserved)
            .unwrap_or(Decimal::ZERO);
        (self.config.per_job_ceiling - used).max(Decimal::ZERO)
    }

    /// Summary for one job, or for the current period when `job_id` is `None`.
    pub async fn cost_summary(&self, job_id: Option<Uuid>) -> CostSummary {
        let mut state = self.state.lock().await;
        state.roll_period(Utc::now().date_naive());
        let period_start = state.period_start;

        match job_id {
            Some(id) => {
                let (committed, reserved, calls) = state
                    .jobs
                    .get(&id)
                    .map(|j| (j.committed, j.reserved, j.calls()))
                    .unwrap_or((Decimal::ZERO, Decimal::ZERO, 0));
                let ceiling = self.config.per_job_ceiling;
                CostSummary {
                    committed,
                    reserved,
                    ceiling,
                    remaining: (ceiling - committed - reserved).max(Decimal::ZERO),
                    calls,
                    period_start,
                }
            }
            None => {
                let ceiling = self.config.aggregate_ceiling;
                CostSummary {
                    committed: state.period_committed,
                    reserved: state.outstanding,
                    ceiling,
                    remaining: (ceiling - state.period_committed - state.outstanding)
                        .max(Decimal::ZERO),
                    calls: state.period_calls,
                    period_start,
                }
            }
        }
    }

    /// Full cost record for a job (empty if it never touched the ledger).
    pub async fn record(&self, job_id: Uuid) -> CostRecord {
        let state = self.state.lock().await;
        let (committed, reserved, entries) = state
            .jobs
            .get(&job_id)
            .map(|j| (j.committed, j.reserved, j.entries.clone()))
            .unwrap_or_default();
        CostRecord {
            job_id,
            committed,
            reserved,
            ceiling: self.config.per_job_ceiling,
            entries,
        }
    }

    /// Drop the per-job records of jobs that have left the system. Period
    /// totals are unaffected; a leftover reservation is returned.
    pub async fn forget(&self, job_ids: &[Uuid]) {
        let mut state = self.state.lock().await;
        let mut returned = Decimal::ZERO;
        for id in job_ids {
            if let Some(job) = state.jobs.remove(id) {
                returned += job.reserved;
            }
        }
        state.outstanding = (state.outstanding - returned).max(Decimal::ZERO);
    }

    /// Start a new accounting period now. Per-job records are kept.
    pub async fn reset_period(&self) {
        let mut state = self.state.lock().await;
        state.period_committed = Decimal::ZERO;
        state.period_calls = 0;
        state.period_start = Utc::now().date_naive();
        tracing::info!("Cost ledger: aggregate counter reset on request");
    }
}
