//! Consecutive-failure circuit breaker for the AI provider.
//!
//! State is lock-free (atomics only). After `failure_threshold` consecutive
//! failures the circuit opens; once `cooldown` has elapsed a single probe is
//! let through (half-open). A successful probe closes the circuit, a failed
//! one re-opens it for another cooldown.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    /// Consecutive failures. Reset to 0 on success.
    failure_count: AtomicU32,
    /// Nanoseconds since `epoch` when the circuit opened; 0 means closed.
    opened_at_nanos: AtomicU64,
    /// Set while the half-open probe is outstanding.
    probe_in_flight: AtomicBool,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            failure_count: AtomicU32::new(0),
            opened_at_nanos: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub fn state(&self) -> CircuitState {
        let opened = self.opened_at_nanos.load(Ordering::Relaxed);
        if opened == 0 {
            return CircuitState::Closed;
        }
        let cooldown = self.cooldown.as_nanos() as u64;
        if self.now_nanos().saturating_sub(opened) < cooldown {
            CircuitState::Open
        } else {
            CircuitState::HalfOpen
        }
    }

    /// Whether a call may be attempted right now. In half-open state only the
    /// first caller gets `true` until that probe reports back.
    pub fn try_acquire(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self
                .probe_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok(),
        }
    }

    pub fn record_success(&self) {
        if self.opened_at_nanos.load(Ordering::Relaxed) != 0 {
            tracing::info!("AI circuit closed after successful probe");
        }
        self.failure_count.store(0, Ordering::Relaxed);
        self.opened_at_nanos.store(0, Ordering::Relaxed);
        self.probe_in_flight.store(false, Ordering::Release);
    }

    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        let was_probe = self.probe_in_flight.swap(false, Ordering::AcqRel);
        if was_probe || failures >= self.failure_threshold {
            // Ensure 0 remains a safe "closed" sentinel.
            self.opened_at_nanos
                .store(self.now_nanos().max(1), Ordering::Relaxed);
            tracing::warn!(
                failures,
                cooldown_secs = self.cooldown.as_secs(),
                "AI circuit opened"
            );
        }
    }

    /// Give back a probe slot without an outcome (e.g. the call was never
    /// issued because of a budget rejection).
    pub fn release_probe(&self) {
        self.probe_in_flight.store(false, Ordering::Release);
    }
}
