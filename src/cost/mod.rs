//! AI spend accounting.
//!
//! The [`CostLedger`] is the single gate in front of every AI call: a call is
//! only issued after `reserve` succeeds, and its billed amount is reconciled
//! afterwards with `commit` (or handed back with `release`).

mod ledger;

pub use ledger::{CostEntry, CostLedger, CostOutcome, CostRecord, CostSummary};
