//! Loop supervision and liveness.
//!
//! Spawns the command pollers and the reconciler, watches their join
//! handles, and respawns any loop that dies unexpectedly. Respawning
//! is unconditionally safe: remote state is durable, the reconciler
//! snapshot re-derives itself on the first tick, and the command
//! ledgers are shared handles that survive respawns. The supervisor
//! also announces the device heartbeat to the backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::apps::DesktopApp;
use crate::command::{CommandKind, CommandLedger, Heartbeat};
use crate::foreground::ForegroundGuard;
use crate::health::HealthMonitor;
use crate::metrics::AgentMetrics;
use crate::platform::DevicePlatform;
use crate::poller::{CommandAction, CommandPoller, PollerTiming};
use crate::reboot::{RebootManager, SideEffectError};
use crate::reconciler::{ReconcilerTiming, StateReconciler};
use crate::remote::RemoteStore;
use crate::surface::WorkspaceSurface;

/// How often the supervisor inspects its loops.
const SUPERVISION_CHECK: Duration = Duration::from_secs(5);
/// Heartbeats are sent every this many supervision checks.
const HEARTBEAT_EVERY_CHECKS: u32 = 12;

/// Pacing knobs handed down from configuration.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorTiming {
    pub reboot: PollerTiming,
    pub restart: PollerTiming,
    pub reconcile: ReconcilerTiming,
    pub restart_delay: Duration,
}

/// Executes the device reboot chain for a reboot command.
pub struct RebootAction {
    manager: Arc<RebootManager>,
}

impl RebootAction {
    pub fn new(manager: Arc<RebootManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl CommandAction for RebootAction {
    async fn run(&self) -> Result<(), SideEffectError> {
        self.manager.reboot().await
    }
}

/// Restarts the designated application for a restart command.
///
/// Without a designated application the command is still consumed (the
/// poller marked it before calling here) and the attempt is reported
/// as failed, so a misconfigured device never loops on one command.
pub struct RestartAppAction {
    platform: Arc<dyn DevicePlatform>,
    target: Option<DesktopApp>,
}

impl RestartAppAction {
    pub fn new(platform: Arc<dyn DevicePlatform>, target: Option<DesktopApp>) -> Self {
        Self { platform, target }
    }
}

#[async_trait]
impl CommandAction for RestartAppAction {
    async fn run(&self) -> Result<(), SideEffectError> {
        let target = self.target.as_ref().ok_or_else(|| {
            SideEffectError::Failed("no designated application configured".into())
        })?;

        if self.platform.restart(target).await {
            Ok(())
        } else {
            Err(SideEffectError::Failed(format!(
                "restart of '{}' did not complete",
                target.id
            )))
        }
    }
}

pub struct ServiceSupervisor {
    device_id: String,
    store: Arc<dyn RemoteStore>,
    platform: Arc<dyn DevicePlatform>,
    surface: Arc<dyn WorkspaceSurface>,
    reboot_manager: Arc<RebootManager>,
    target: Option<DesktopApp>,
    /// Binaries allowed in the foreground besides the target.
    allowed_binaries: Vec<String>,
    reboot_ledger: CommandLedger,
    restart_ledger: CommandLedger,
    metrics: AgentMetrics,
    health: HealthMonitor,
    timing: SupervisorTiming,
}

impl ServiceSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: impl Into<String>,
        store: Arc<dyn RemoteStore>,
        platform: Arc<dyn DevicePlatform>,
        surface: Arc<dyn WorkspaceSurface>,
        target: Option<DesktopApp>,
        allowed_binaries: Vec<String>,
        timing: SupervisorTiming,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            store,
            platform,
            surface,
            reboot_manager: Arc::new(RebootManager::new()),
            target,
            allowed_binaries,
            reboot_ledger: CommandLedger::new(),
            restart_ledger: CommandLedger::new(),
            metrics: AgentMetrics::new(),
            health: HealthMonitor::new(),
            timing,
        }
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.metrics.clone()
    }

    /// Supervise until the stop flag is raised.
    pub async fn run(mut self, stop: Arc<AtomicBool>) {
        info!("[Supervisor] starting supervision loops");

        let mut reboot_task = self.spawn_reboot_poller(&stop);
        let mut restart_task = self.spawn_restart_poller(&stop);
        let mut reconcile_task = self.spawn_reconciler(&stop);

        self.announce().await;

        let mut check = tokio::time::interval(SUPERVISION_CHECK);
        let mut checks: u32 = 0;

        loop {
            check.tick().await;
            if stop.load(Ordering::Relaxed) {
                break;
            }
            checks = checks.wrapping_add(1);

            if reboot_task.is_finished() {
                warn!("[Supervisor] ⚠️ reboot poller terminated unexpectedly, restarting");
                tokio::time::sleep(self.timing.restart_delay).await;
                reboot_task = self.spawn_reboot_poller(&stop);
                self.announce().await;
            }
            if restart_task.is_finished() {
                warn!("[Supervisor] ⚠️ restart poller terminated unexpectedly, restarting");
                tokio::time::sleep(self.timing.restart_delay).await;
                restart_task = self.spawn_restart_poller(&stop);
                self.announce().await;
            }
            if reconcile_task.is_finished() {
                warn!("[Supervisor] ⚠️ reconciler terminated unexpectedly, restarting");
                tokio::time::sleep(self.timing.restart_delay).await;
                reconcile_task = self.spawn_reconciler(&stop);
                self.announce().await;
            }

            if checks % HEARTBEAT_EVERY_CHECKS == 0 {
                self.announce().await;
                info!("[Supervisor] {}", self.metrics.summary());
            }
        }

        info!("[Supervisor] stop requested, waiting for loops to finish");
        let _ = tokio::join!(reboot_task, restart_task, reconcile_task);
        info!("[Supervisor] all loops stopped");
    }

    fn spawn_reboot_poller(&self, stop: &Arc<AtomicBool>) -> JoinHandle<()> {
        let poller = CommandPoller::new(
            self.device_id.clone(),
            CommandKind::Reboot,
            self.store.clone(),
            self.reboot_ledger.clone(),
            Arc::new(RebootAction::new(self.reboot_manager.clone())),
            self.metrics.clone(),
            self.timing.reboot,
        );
        tokio::spawn(poller.run(stop.clone()))
    }

    fn spawn_restart_poller(&self, stop: &Arc<AtomicBool>) -> JoinHandle<()> {
        let poller = CommandPoller::new(
            self.device_id.clone(),
            CommandKind::RestartApp,
            self.store.clone(),
            self.restart_ledger.clone(),
            Arc::new(RestartAppAction::new(
                self.platform.clone(),
                self.target.clone(),
            )),
            self.metrics.clone(),
            self.timing.restart,
        );
        tokio::spawn(poller.run(stop.clone()))
    }

    fn spawn_reconciler(&self, stop: &Arc<AtomicBool>) -> JoinHandle<()> {
        let guard = ForegroundGuard::new(
            self.platform.clone(),
            self.target.clone(),
            self.allowed_binaries.clone(),
        );
        let reconciler = StateReconciler::new(
            self.device_id.clone(),
            self.store.clone(),
            self.platform.clone(),
            self.surface.clone(),
            guard,
            self.metrics.clone(),
            self.timing.reconcile,
        );
        tokio::spawn(reconciler.run(stop.clone()))
    }

    /// Upsert the device heartbeat with current process health.
    async fn announce(&mut self) {
        let snapshot = self.health.snapshot();
        if !self.health.is_healthy() {
            warn!(
                "[Supervisor] agent over resource budget: cpu {:.1}%, mem {} MB",
                snapshot.cpu_percent, snapshot.memory_mb
            );
        }

        let beat = Heartbeat {
            device_id: self.device_id.clone(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            last_seen: Utc::now(),
            cpu_percent: snapshot.cpu_percent,
            memory_mb: snapshot.memory_mb,
            uptime_secs: snapshot.uptime_secs,
        };

        match self.store.upsert_heartbeat(&beat).await {
            Ok(()) => info!("[Supervisor] heartbeat announced for {}", self.device_id),
            Err(err) => {
                // heartbeats are best-effort; the next cycle retries
                self.metrics.record_transient_error();
                warn!("[Supervisor] heartbeat failed: {}", err);
            }
        }
    }
}
