//! threatforge: sandboxed attack-simulation jobs with cost-bounded AI analysis.
//!
//! A job names a tool from the [`sandbox::ToolRegistry`], runs it in an
//! isolated container, and ends with an [`job::Assessment`] produced either by
//! the AI analyzer (when healthy and within budget) or by the deterministic
//! rule-based fallback.

pub mod analysis;
pub mod config;
pub mod cost;
pub mod error;
pub mod job;
pub mod llm;
pub mod orchestrator;
pub mod sandbox;
pub mod worker;
