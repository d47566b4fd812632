//! Cycle metrics for the supervision loops.
//!
//! Thread-safe counters shared by cloned handles; each loop records
//! its ticks and command outcomes, and the supervisor logs a summary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Aggregated counters for the agent instance.
#[derive(Clone, Debug, Default)]
pub struct AgentMetrics {
    ticks: Arc<AtomicU64>,
    commands_executed: Arc<AtomicU64>,
    commands_failed: Arc<AtomicU64>,
    transient_errors: Arc<AtomicU64>,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one loop tick of any kind.
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a command whose side effect completed.
    pub fn record_command_executed(&self) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a command whose side effect reported failure.
    pub fn record_command_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a transient remote store error.
    pub fn record_transient_error(&self) {
        self.transient_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn commands_executed(&self) -> u64 {
        self.commands_executed.load(Ordering::Relaxed)
    }

    pub fn commands_failed(&self) -> u64 {
        self.commands_failed.load(Ordering::Relaxed)
    }

    pub fn transient_errors(&self) -> u64 {
        self.transient_errors.load(Ordering::Relaxed)
    }

    /// One-line summary for periodic supervisor logging.
    pub fn summary(&self) -> String {
        format!(
            "ticks={} executed={} failed={} transient_errors={}",
            self.ticks(),
            self.commands_executed(),
            self.commands_failed(),
            self.transient_errors()
        )
    }
}
