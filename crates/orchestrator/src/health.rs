//! Storage health tracking.
//!
//! The kernel has no silent in-memory fallback: when the store fails
//! repeatedly the circuit opens and callers receive explicit
//! `StorageUnavailable` errors until the cooldown elapses.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Consecutive-failure circuit breaker for the task store.
#[derive(Debug)]
pub struct StoreCircuit {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitState>,
}

impl Default for StoreCircuit {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

impl StoreCircuit {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(CircuitState::default()),
        }
    }

    /// Whether calls should be rejected without touching the store.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Cooldown elapsed; let the next call test the store.
                state.open_until = None;
                state.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold {
            state.open_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "task store circuit opened"
            );
        }
    }
}
