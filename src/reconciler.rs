//! Desired-state reconciliation for the supervised device.
//!
//! Each tick reads the remote `(active, kiosk)` flags, applies
//! transition actions for whichever flag changed since the last
//! applied pair, then runs the steady-state enforcement policy for the
//! current flags. Transition actions fire once per change; the
//! steady-state policy runs every tick because focus can drift between
//! ticks without any flag changing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::foreground::ForegroundGuard;
use crate::metrics::AgentMetrics;
use crate::platform::DevicePlatform;
use crate::remote::{DeviceFlag, RemoteStore};
use crate::surface::WorkspaceSurface;

/// Last-applied flag pair. `None` is the no-prior-state sentinel that
/// forces one full transition pass on the first tick after a restart;
/// re-applying transition actions is harmless because they are
/// idempotent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ReconcilerSnapshot {
    active: Option<bool>,
    kiosk: Option<bool>,
}

/// Pacing for the reconciler loop.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerTiming {
    pub interval: Duration,
    pub error_retry: Duration,
}

pub struct StateReconciler {
    device_id: String,
    store: Arc<dyn RemoteStore>,
    platform: Arc<dyn DevicePlatform>,
    surface: Arc<dyn WorkspaceSurface>,
    guard: ForegroundGuard,
    metrics: AgentMetrics,
    timing: ReconcilerTiming,
    snapshot: ReconcilerSnapshot,
}

impl StateReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: impl Into<String>,
        store: Arc<dyn RemoteStore>,
        platform: Arc<dyn DevicePlatform>,
        surface: Arc<dyn WorkspaceSurface>,
        guard: ForegroundGuard,
        metrics: AgentMetrics,
        timing: ReconcilerTiming,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            store,
            platform,
            surface,
            guard,
            metrics,
            timing,
            snapshot: ReconcilerSnapshot::default(),
        }
    }

    /// Run until the stop flag is raised.
    pub async fn run(mut self, stop: Arc<AtomicBool>) {
        info!(
            "[Reconciler] loop started (interval {:?})",
            self.timing.interval
        );

        while !stop.load(Ordering::Relaxed) {
            let delay = self.tick().await;
            tokio::time::sleep(delay).await;
        }

        info!("[Reconciler] loop stopped");
    }

    /// One reconciliation cycle. Returns the delay before the next
    /// tick.
    ///
    /// A failed flag read is treated as "no change": nothing is
    /// applied this tick and the read is retried after the backoff
    /// delay.
    pub async fn tick(&mut self) -> Duration {
        self.metrics.record_tick();

        let active = match self.read_flag(DeviceFlag::Active).await {
            Some(active) => active,
            None => return self.timing.error_retry,
        };
        let kiosk = match self.read_flag(DeviceFlag::Kiosk).await {
            Some(kiosk) => kiosk,
            None => return self.timing.error_retry,
        };

        self.apply_transitions(active, kiosk).await;
        self.enforce_steady_state(active, kiosk).await;

        self.timing.interval
    }

    /// A missing device row reads as `false`: an unprovisioned device
    /// is unrestricted.
    async fn read_flag(&self, flag: DeviceFlag) -> Option<bool> {
        match self.store.fetch_flag(&self.device_id, flag).await {
            Ok(value) => Some(value.unwrap_or(false)),
            Err(err) => {
                self.metrics.record_transient_error();
                warn!("[Reconciler] {} flag read failed: {}", flag.column(), err);
                None
            }
        }
    }

    /// Apply per-flag transition actions, then update the snapshot.
    ///
    /// Only the delta is acted on; re-running the full target-state
    /// logic every tick would fight user interaction on the surface.
    async fn apply_transitions(&mut self, active: bool, kiosk: bool) {
        if self.snapshot.active != Some(active) {
            if active {
                info!("[Reconciler] 🔒 active raised, restricting to approved apps");
                self.surface.start_app_blocking();
                self.surface.show_grid();
            } else {
                info!("[Reconciler] 🔓 active cleared, lifting restrictions");
                self.surface.stop_app_blocking();
                self.surface.hide_grid();
            }
        }

        if self.snapshot.kiosk != Some(kiosk) {
            if kiosk {
                info!("[Reconciler] 🔒 kiosk raised, pinning designated app");
                self.surface.set_pinned(true);
                // the steady-state pass below forces the designated app
                // to foreground within this same tick
            } else {
                info!("[Reconciler] 🔓 kiosk cleared");
                self.surface.set_pinned(false);
            }
        }

        self.snapshot = ReconcilerSnapshot {
            active: Some(active),
            kiosk: Some(kiosk),
        };
    }

    /// Enforcement that must run every tick, transition or not.
    ///
    /// Kiosk re-affirms the designated app in the foreground. Active
    /// without kiosk only evicts unauthorized foreground apps and
    /// re-shows the grid; it never auto-launches the designated app.
    async fn enforce_steady_state(&mut self, active: bool, kiosk: bool) {
        if kiosk {
            self.guard.ensure_foreground().await;
        } else if active {
            match self.platform.foreground_binary().await {
                Ok(Some(binary)) if !self.guard.is_allowed(&binary) => {
                    warn!(
                        "[Reconciler] ⚠️ unauthorized app in foreground: {}",
                        binary
                    );
                    if !self.platform.kill(&binary).await {
                        debug!("[Reconciler] could not stop {}", binary);
                    }
                    self.surface.show_grid();
                }
                Ok(_) => {}
                Err(err) => debug!("[Reconciler] foreground query failed: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::DesktopApp;
    use crate::command::{CommandKind, Heartbeat, PendingCommand};
    use crate::platform::PlatformError;
    use crate::remote::RemoteError;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn target_app() -> DesktopApp {
        DesktopApp {
            id: "pinned.desktop".into(),
            name: "Pinned App".into(),
            exec: "pinned-app".into(),
            keywords: vec![],
            generic_name: String::new(),
            path: PathBuf::from("/usr/share/applications/pinned.desktop"),
        }
    }

    struct FlagStore {
        active: Mutex<bool>,
        kiosk: Mutex<bool>,
        fail_reads: Mutex<bool>,
    }

    impl FlagStore {
        fn with_flags(active: bool, kiosk: bool) -> Arc<Self> {
            Arc::new(Self {
                active: Mutex::new(active),
                kiosk: Mutex::new(kiosk),
                fail_reads: Mutex::new(false),
            })
        }

        fn set_flags(&self, active: bool, kiosk: bool) {
            *self.active.lock().unwrap() = active;
            *self.kiosk.lock().unwrap() = kiosk;
        }

        fn fail_reads(&self, fail: bool) {
            *self.fail_reads.lock().unwrap() = fail;
        }
    }

    #[async_trait]
    impl RemoteStore for FlagStore {
        async fn fetch_pending_command(
            &self,
            _device_id: &str,
            _kind: CommandKind,
        ) -> Result<Option<PendingCommand>, RemoteError> {
            Ok(None)
        }

        async fn mark_executed(&self, _command_id: &str) -> Result<bool, RemoteError> {
            Ok(false)
        }

        async fn delete_command(&self, _command_id: &str) -> Result<bool, RemoteError> {
            Ok(false)
        }

        async fn fetch_flag(
            &self,
            _device_id: &str,
            flag: DeviceFlag,
        ) -> Result<Option<bool>, RemoteError> {
            if *self.fail_reads.lock().unwrap() {
                return Err(RemoteError::Transient("unreachable".into()));
            }
            let value = match flag {
                DeviceFlag::Active => *self.active.lock().unwrap(),
                DeviceFlag::Kiosk => *self.kiosk.lock().unwrap(),
            };
            Ok(Some(value))
        }

        async fn upsert_heartbeat(&self, _beat: &Heartbeat) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSurface {
        events: Mutex<Vec<String>>,
    }

    impl RecordingSurface {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: &str) {
            self.events.lock().unwrap().push(event.to_string());
        }
    }

    impl WorkspaceSurface for RecordingSurface {
        fn start_app_blocking(&self) {
            self.push("blocking_on");
        }

        fn stop_app_blocking(&self) {
            self.push("blocking_off");
        }

        fn show_grid(&self) {
            self.push("show_grid");
        }

        fn hide_grid(&self) {
            self.push("hide_grid");
        }

        fn set_pinned(&self, pinned: bool) {
            self.push(if pinned { "pin_on" } else { "pin_off" });
        }
    }

    struct RecordingPlatform {
        foreground: Mutex<Option<String>>,
        launches: Mutex<Vec<String>>,
        kills: Mutex<Vec<String>>,
    }

    impl RecordingPlatform {
        fn showing(binary: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                foreground: Mutex::new(binary.map(String::from)),
                launches: Mutex::new(Vec::new()),
                kills: Mutex::new(Vec::new()),
            })
        }

        fn launches(&self) -> Vec<String> {
            self.launches.lock().unwrap().clone()
        }

        fn kills(&self) -> Vec<String> {
            self.kills.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DevicePlatform for RecordingPlatform {
        async fn foreground_binary(&self) -> Result<Option<String>, PlatformError> {
            Ok(self.foreground.lock().unwrap().clone())
        }

        async fn launch(&self, app: &DesktopApp) -> bool {
            self.launches.lock().unwrap().push(app.binary_name());
            true
        }

        async fn kill(&self, binary: &str) -> bool {
            self.kills.lock().unwrap().push(binary.to_string());
            true
        }

        async fn restart(&self, _app: &DesktopApp) -> bool {
            true
        }
    }

    fn reconciler(
        store: Arc<FlagStore>,
        platform: Arc<RecordingPlatform>,
        surface: Arc<RecordingSurface>,
    ) -> StateReconciler {
        let guard = ForegroundGuard::new(
            platform.clone(),
            Some(target_app()),
            vec!["kiosk-grid".into()],
        )
        .with_settle(Duration::from_millis(1));

        StateReconciler::new(
            "device-1",
            store,
            platform,
            surface,
            guard,
            AgentMetrics::new(),
            ReconcilerTiming {
                interval: Duration::from_millis(10),
                error_retry: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test]
    async fn first_tick_applies_full_transition_pass() {
        let store = FlagStore::with_flags(true, true);
        let platform = RecordingPlatform::showing(Some("pinned-app"));
        let surface = Arc::new(RecordingSurface::default());
        let mut reconciler = reconciler(store, platform, surface.clone());

        reconciler.tick().await;

        assert_eq!(
            surface.events(),
            vec!["blocking_on", "show_grid", "pin_on"]
        );
    }

    #[tokio::test]
    async fn unchanged_flags_produce_no_transition_actions() {
        let store = FlagStore::with_flags(true, true);
        let platform = RecordingPlatform::showing(Some("pinned-app"));
        let surface = Arc::new(RecordingSurface::default());
        let mut reconciler = reconciler(store, platform.clone(), surface.clone());

        reconciler.tick().await;
        let after_first = surface.events().len();

        reconciler.tick().await;

        // no new transition actions, but the steady-state foreground
        // check still ran (target already focused, so no launch)
        assert_eq!(surface.events().len(), after_first);
        assert!(platform.launches().is_empty());
    }

    #[tokio::test]
    async fn kiosk_steady_state_reaffirms_foreground_every_tick() {
        let store = FlagStore::with_flags(false, true);
        let platform = RecordingPlatform::showing(Some("solitaire"));
        let surface = Arc::new(RecordingSurface::default());
        let mut reconciler = reconciler(store, platform.clone(), surface);

        reconciler.tick().await;
        reconciler.tick().await;

        assert_eq!(platform.launches(), vec!["pinned-app", "pinned-app"]);
    }

    #[tokio::test]
    async fn kiosk_flip_off_keeps_active_enforcement() {
        let store = FlagStore::with_flags(true, true);
        let platform = RecordingPlatform::showing(Some("pinned-app"));
        let surface = Arc::new(RecordingSurface::default());
        let mut reconciler = reconciler(store.clone(), platform.clone(), surface.clone());

        reconciler.tick().await;
        store.set_flags(true, false);
        *platform.foreground.lock().unwrap() = Some("solitaire".to_string());

        reconciler.tick().await;

        let events = surface.events();
        // pinning cleared exactly once, blocking never lifted
        assert_eq!(events.iter().filter(|e| *e == "pin_off").count(), 1);
        assert!(!events.contains(&"blocking_off".to_string()));
        // unauthorized app evicted, grid re-shown, no auto-launch
        assert_eq!(platform.kills(), vec!["solitaire"]);
        assert!(platform.launches().is_empty());
    }

    #[tokio::test]
    async fn active_only_never_launches_designated_app() {
        let store = FlagStore::with_flags(true, false);
        let platform = RecordingPlatform::showing(Some("solitaire"));
        let surface = Arc::new(RecordingSurface::default());
        let mut reconciler = reconciler(store, platform.clone(), surface.clone());

        reconciler.tick().await;

        assert_eq!(platform.kills(), vec!["solitaire"]);
        assert!(platform.launches().is_empty());
        assert!(surface.events().contains(&"show_grid".to_string()));
    }

    #[tokio::test]
    async fn active_only_leaves_authorized_foreground_alone() {
        let store = FlagStore::with_flags(true, false);
        let platform = RecordingPlatform::showing(Some("pinned-app"));
        let surface = Arc::new(RecordingSurface::default());
        let mut reconciler = reconciler(store, platform.clone(), surface.clone());

        reconciler.tick().await;

        assert!(platform.kills().is_empty());
        assert!(platform.launches().is_empty());
    }

    #[tokio::test]
    async fn read_failure_applies_nothing_and_backs_off() {
        let store = FlagStore::with_flags(true, true);
        store.fail_reads(true);
        let platform = RecordingPlatform::showing(Some("solitaire"));
        let surface = Arc::new(RecordingSurface::default());
        let mut reconciler = reconciler(store.clone(), platform.clone(), surface.clone());

        let delay = reconciler.tick().await;

        assert_eq!(delay, Duration::from_millis(50));
        assert!(surface.events().is_empty());
        assert!(platform.launches().is_empty());

        // recovery on the next tick
        store.fail_reads(false);
        reconciler.tick().await;
        assert!(!surface.events().is_empty());
    }

    #[tokio::test]
    async fn restarted_reconciler_reapplies_transitions_once() {
        let store = FlagStore::with_flags(true, false);
        let platform = RecordingPlatform::showing(Some("pinned-app"));
        let surface = Arc::new(RecordingSurface::default());

        let mut first = reconciler(store.clone(), platform.clone(), surface.clone());
        first.tick().await;
        drop(first);

        // fresh snapshot forces one full transition pass, then settles
        let mut second = reconciler(store, platform, surface.clone());
        second.tick().await;
        let after_restart_pass = surface.events().len();
        second.tick().await;

        assert_eq!(
            surface.events().iter().filter(|e| *e == "blocking_on").count(),
            2
        );
        assert_eq!(surface.events().len(), after_restart_pass);
    }

    #[tokio::test]
    async fn deactivation_lifts_restrictions() {
        let store = FlagStore::with_flags(true, false);
        let platform = RecordingPlatform::showing(Some("pinned-app"));
        let surface = Arc::new(RecordingSurface::default());
        let mut reconciler = reconciler(store.clone(), platform.clone(), surface.clone());

        reconciler.tick().await;
        store.set_flags(false, false);
        *platform.foreground.lock().unwrap() = Some("solitaire".to_string());

        reconciler.tick().await;

        let events = surface.events();
        assert!(events.contains(&"blocking_off".to_string()));
        assert!(events.contains(&"hide_grid".to_string()));
        // with both flags down, nothing is enforced
        assert!(platform.kills().is_empty());
        assert!(platform.launches().is_empty());
    }
}
