//! Process health snapshots for the device heartbeat.
//!
//! Collects CPU usage, memory consumption, and uptime of the agent
//! process; the supervisor folds a snapshot into every heartbeat row.

use std::time::Instant;

use sysinfo::{Pid, System};

/// Snapshot of current agent process health.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub cpu_percent: f32,
    pub memory_mb: i64,
    pub uptime_secs: i64,
}

/// Tracks agent process health over time.
#[derive(Debug)]
pub struct HealthMonitor {
    system: System,
    process_pid: Pid,
    start_time: Instant,
}

impl HealthMonitor {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        let process_pid = Pid::from_u32(std::process::id());

        Self {
            system,
            process_pid,
            start_time: Instant::now(),
        }
    }

    /// Returns a fresh snapshot for the agent process.
    pub fn snapshot(&mut self) -> HealthSnapshot {
        self.system.refresh_process(self.process_pid);

        let (cpu_percent, memory_mb) = self
            .system
            .process(self.process_pid)
            .map(|process| (process.cpu_usage(), process.memory() as i64 / 1024 / 1024))
            .unwrap_or((0.0, 0));

        HealthSnapshot {
            cpu_percent,
            memory_mb,
            uptime_secs: self.start_time.elapsed().as_secs() as i64,
        }
    }

    /// Returns true while the agent is within its resource budget.
    pub fn is_healthy(&mut self) -> bool {
        let snapshot = self.snapshot();
        snapshot.cpu_percent < 85.0 && snapshot.memory_mb < 512
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
