//! Periodic command polling with at-most-once execution.
//!
//! One poller instance runs per command kind. The backend delivers
//! commands at least once; the mark-before-act write plus the
//! in-process ledger make the side effect fire at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::command::{CommandKind, CommandLedger, PendingCommand};
use crate::metrics::AgentMetrics;
use crate::reboot::SideEffectError;
use crate::remote::RemoteStore;

/// Side effect executed for a delivered command.
#[async_trait]
pub trait CommandAction: Send + Sync {
    async fn run(&self) -> Result<(), SideEffectError>;
}

/// Re-entrancy state for one command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Executing,
}

/// Pacing for one poller instance.
#[derive(Debug, Clone, Copy)]
pub struct PollerTiming {
    /// Normal polling cadence.
    pub interval: Duration,
    /// Cadence after a transient remote failure.
    pub error_retry: Duration,
    /// Delay before re-checking that a marked command disappeared.
    pub settle_delay: Duration,
    /// Delay after execution before accepting the next command.
    pub cooldown: Duration,
}

pub struct CommandPoller {
    device_id: String,
    kind: CommandKind,
    store: Arc<dyn RemoteStore>,
    ledger: CommandLedger,
    action: Arc<dyn CommandAction>,
    metrics: AgentMetrics,
    timing: PollerTiming,
    state: PollerState,
}

impl CommandPoller {
    pub fn new(
        device_id: impl Into<String>,
        kind: CommandKind,
        store: Arc<dyn RemoteStore>,
        ledger: CommandLedger,
        action: Arc<dyn CommandAction>,
        metrics: AgentMetrics,
        timing: PollerTiming,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            store,
            ledger,
            action,
            metrics,
            timing,
            state: PollerState::Idle,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Run until the stop flag is raised.
    ///
    /// The flag is observed at the top of each cycle; in-flight remote
    /// calls always complete so a command is never left executed but
    /// unmarked.
    pub async fn run(mut self, stop: Arc<AtomicBool>) {
        info!(
            "[Poller] {} loop started (interval {:?})",
            self.kind, self.timing.interval
        );

        while !stop.load(Ordering::Relaxed) {
            let delay = self.tick().await;
            tokio::time::sleep(delay).await;
        }

        info!("[Poller] {} loop stopped", self.kind);
    }

    /// One polling cycle. Returns the delay before the next tick.
    pub async fn tick(&mut self) -> Duration {
        self.metrics.record_tick();

        if self.state == PollerState::Executing {
            // A previous cycle never returned to Idle. Overlapping
            // executions of the same kind are not allowed; heal the
            // state only once the backend shows nothing pending.
            match self
                .store
                .fetch_pending_command(&self.device_id, self.kind)
                .await
            {
                Ok(None) => {
                    warn!(
                        "[Poller] {} state stuck Executing with no pending command, resetting",
                        self.kind
                    );
                    self.state = PollerState::Idle;
                }
                Ok(Some(_)) => {
                    debug!("[Poller] {} execution in flight, skipping tick", self.kind)
                }
                Err(err) => {
                    self.metrics.record_transient_error();
                    debug!("[Poller] {} stuck-state check failed: {}", self.kind, err);
                }
            }
            return self.timing.interval;
        }

        let command = match self
            .store
            .fetch_pending_command(&self.device_id, self.kind)
            .await
        {
            Ok(Some(command)) => command,
            Ok(None) => {
                debug!("[Poller] no pending {} command", self.kind);
                return self.timing.interval;
            }
            Err(err) => {
                self.metrics.record_transient_error();
                warn!("[Poller] {} fetch failed: {}", self.kind, err);
                return self.timing.error_retry;
            }
        };

        if self.ledger.is_processed(&command.id).await {
            debug!(
                "[Poller] {} command {} already processed this session",
                self.kind, command.id
            );
            return self.timing.interval;
        }

        info!("[Poller] {} command {} received", self.kind, command.id);
        self.state = PollerState::Executing;

        // Mark executed BEFORE acting. The side effect may kill this
        // process before a post-act write could land; a lost side
        // effect needs a fresh command, a doubled one cannot be undone.
        if !self.mark_or_discard(&command).await {
            self.state = PollerState::Idle;
            return self.timing.error_retry;
        }

        self.ledger.mark_processed(&command.id).await;

        self.repair_stale_visibility(&command).await;

        match self.action.run().await {
            Ok(()) => {
                self.metrics.record_command_executed();
                info!("[Poller] ✅ {} command {} executed", self.kind, command.id);
            }
            Err(err) => {
                // The command is already marked executed; a fresh
                // command must be issued to retry the side effect.
                self.metrics.record_command_failed();
                error!(
                    "[Poller] ❌ {} command {} side effect failed: {}",
                    self.kind, command.id, err
                );
            }
        }

        tokio::time::sleep(self.timing.cooldown).await;
        self.state = PollerState::Idle;
        self.timing.interval
    }

    /// Mark the command executed, falling back to deletion so it does
    /// not stay visible forever. False means neither write landed and
    /// the tick must abort without executing; the same command is
    /// re-evaluated on the next tick.
    async fn mark_or_discard(&self, command: &PendingCommand) -> bool {
        match self.store.mark_executed(&command.id).await {
            Ok(true) => {
                debug!("[Poller] command {} marked executed", command.id);
                return true;
            }
            Ok(false) => {
                warn!(
                    "[Poller] command {} did not match during mark, trying delete",
                    command.id
                );
            }
            Err(err) => {
                self.metrics.record_transient_error();
                warn!(
                    "[Poller] marking command {} failed ({}), trying delete",
                    command.id, err
                );
            }
        }

        match self.store.delete_command(&command.id).await {
            Ok(true) => {
                warn!("[Poller] command {} deleted as mark fallback", command.id);
                true
            }
            Ok(false) => {
                warn!(
                    "[Poller] command {} neither marked nor deleted, aborting tick",
                    command.id
                );
                false
            }
            Err(err) => {
                self.metrics.record_transient_error();
                warn!(
                    "[Poller] delete fallback for command {} failed ({}), aborting tick",
                    command.id, err
                );
                false
            }
        }
    }

    /// Read-after-write lag can leave a marked command visible; re-check
    /// after a settle delay and delete it if it still shows.
    async fn repair_stale_visibility(&self, command: &PendingCommand) {
        tokio::time::sleep(self.timing.settle_delay).await;

        match self
            .store
            .fetch_pending_command(&self.device_id, self.kind)
            .await
        {
            Ok(Some(stale)) if stale.id == command.id => {
                warn!(
                    "[Poller] command {} still visible after marking, deleting",
                    command.id
                );
                if let Err(err) = self.store.delete_command(&command.id).await {
                    warn!("[Poller] stale-visibility delete failed: {}", err);
                }
            }
            Ok(_) => {}
            Err(err) => debug!("[Poller] settle re-check failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{DeviceFlag, RemoteError};
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    fn pending(id: &str, kind: CommandKind) -> PendingCommand {
        PendingCommand {
            id: id.to_string(),
            device_id: "device-1".to_string(),
            kind,
            executed: false,
            created_at: Some(Utc::now()),
            executed_at: None,
        }
    }

    fn test_timing() -> PollerTiming {
        PollerTiming {
            interval: Duration::from_millis(10),
            error_retry: Duration::from_millis(50),
            settle_delay: Duration::from_millis(1),
            cooldown: Duration::from_millis(1),
        }
    }

    /// Remote store stub. With `lag` set the command stays visible even
    /// after a successful mark or delete, simulating read-after-write
    /// anomalies in the backend.
    struct ScriptedStore {
        command: Mutex<Option<PendingCommand>>,
        lag: bool,
        mark_results: Mutex<VecDeque<Result<bool, RemoteError>>>,
        delete_results: Mutex<VecDeque<Result<bool, RemoteError>>>,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedStore {
        fn with_command(command: PendingCommand, lag: bool) -> Arc<Self> {
            Arc::new(Self {
                command: Mutex::new(Some(command)),
                lag,
                mark_results: Mutex::new(VecDeque::new()),
                delete_results: Mutex::new(VecDeque::new()),
                events: Arc::new(Mutex::new(Vec::new())),
            })
        }

        fn script_mark(&self, results: Vec<Result<bool, RemoteError>>) {
            *self.mark_results.lock().unwrap() = results.into();
        }

        fn script_delete(&self, results: Vec<Result<bool, RemoteError>>) {
            *self.delete_results.lock().unwrap() = results.into();
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push_event(&self, event: &str) {
            self.events.lock().unwrap().push(event.to_string());
        }
    }

    #[async_trait]
    impl RemoteStore for ScriptedStore {
        async fn fetch_pending_command(
            &self,
            _device_id: &str,
            _kind: CommandKind,
        ) -> Result<Option<PendingCommand>, RemoteError> {
            self.push_event("fetch");
            Ok(self.command.lock().unwrap().clone())
        }

        async fn mark_executed(&self, _command_id: &str) -> Result<bool, RemoteError> {
            self.push_event("mark");
            let scripted = self.mark_results.lock().unwrap().pop_front();
            let result = scripted.unwrap_or(Ok(true));
            if matches!(result, Ok(true)) && !self.lag {
                *self.command.lock().unwrap() = None;
            }
            result
        }

        async fn delete_command(&self, _command_id: &str) -> Result<bool, RemoteError> {
            self.push_event("delete");
            let scripted = self.delete_results.lock().unwrap().pop_front();
            let result = scripted.unwrap_or(Ok(true));
            if matches!(result, Ok(true)) && !self.lag {
                *self.command.lock().unwrap() = None;
            }
            result
        }

        async fn fetch_flag(
            &self,
            _device_id: &str,
            _flag: DeviceFlag,
        ) -> Result<Option<bool>, RemoteError> {
            Ok(None)
        }

        async fn upsert_heartbeat(
            &self,
            _beat: &crate::command::Heartbeat,
        ) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    struct CountingAction {
        runs: AtomicU64,
        fail: bool,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl CountingAction {
        fn new(events: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicU64::new(0),
                fail: false,
                events: events.clone(),
            })
        }

        fn failing(events: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicU64::new(0),
                fail: true,
                events: events.clone(),
            })
        }

        fn runs(&self) -> u64 {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CommandAction for CountingAction {
        async fn run(&self) -> Result<(), SideEffectError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push("execute".to_string());
            if self.fail {
                Err(SideEffectError::Failed("scripted failure".into()))
            } else {
                Ok(())
            }
        }
    }

    fn poller(
        store: Arc<ScriptedStore>,
        ledger: CommandLedger,
        action: Arc<CountingAction>,
    ) -> CommandPoller {
        CommandPoller::new(
            "device-1",
            CommandKind::RestartApp,
            store,
            ledger,
            action,
            AgentMetrics::new(),
            test_timing(),
        )
    }

    #[tokio::test]
    async fn lagged_reads_execute_at_most_once() {
        // the store keeps showing the command after it was marked
        let store = ScriptedStore::with_command(pending("cmd-1", CommandKind::RestartApp), true);
        let action = CountingAction::new(&store.events);
        let mut poller = poller(store.clone(), CommandLedger::new(), action.clone());

        poller.tick().await;
        poller.tick().await;
        poller.tick().await;

        assert_eq!(action.runs(), 1);
    }

    #[tokio::test]
    async fn mark_precedes_execution() {
        let store = ScriptedStore::with_command(pending("cmd-1", CommandKind::RestartApp), false);
        let action = CountingAction::new(&store.events);
        let mut poller = poller(store.clone(), CommandLedger::new(), action.clone());

        poller.tick().await;

        let events = store.events();
        let mark_at = events.iter().position(|e| e == "mark");
        let execute_at = events.iter().position(|e| e == "execute");
        assert!(mark_at.is_some());
        assert!(execute_at.is_some());
        assert!(mark_at < execute_at, "mark must precede execute: {events:?}");
        assert_eq!(action.runs(), 1);
    }

    #[tokio::test]
    async fn mark_and_delete_failure_aborts_without_executing() {
        let store = ScriptedStore::with_command(pending("cmd-1", CommandKind::RestartApp), true);
        store.script_mark(vec![Err(RemoteError::Transient("down".into()))]);
        store.script_delete(vec![Err(RemoteError::Transient("down".into()))]);
        let action = CountingAction::new(&store.events);
        let mut poller = poller(store.clone(), CommandLedger::new(), action.clone());

        let delay = poller.tick().await;

        assert_eq!(action.runs(), 0);
        assert_eq!(delay, test_timing().error_retry);
        assert_eq!(poller.state(), PollerState::Idle);

        // next tick re-evaluates the same command and can complete
        poller.tick().await;
        assert_eq!(action.runs(), 1);
    }

    #[tokio::test]
    async fn mark_failure_falls_back_to_delete() {
        let store = ScriptedStore::with_command(pending("cmd-1", CommandKind::RestartApp), false);
        store.script_mark(vec![Err(RemoteError::Transient("down".into()))]);
        let action = CountingAction::new(&store.events);
        let mut poller = poller(store.clone(), CommandLedger::new(), action.clone());

        poller.tick().await;

        assert_eq!(action.runs(), 1);
        let events = store.events();
        assert!(events.contains(&"delete".to_string()));
    }

    #[tokio::test]
    async fn stale_visibility_is_repaired_with_delete() {
        // lag keeps the marked command visible at the settle re-check
        let store = ScriptedStore::with_command(pending("cmd-1", CommandKind::RestartApp), true);
        let action = CountingAction::new(&store.events);
        let mut poller = poller(store.clone(), CommandLedger::new(), action.clone());

        poller.tick().await;

        let events = store.events();
        let mark_at = events.iter().position(|e| e == "mark").unwrap();
        let delete_at = events.iter().position(|e| e == "delete").unwrap();
        assert!(delete_at > mark_at);
        assert_eq!(action.runs(), 1);
    }

    #[tokio::test]
    async fn rebuilt_poller_with_shared_ledger_never_reexecutes() {
        let store = ScriptedStore::with_command(pending("cmd-1", CommandKind::RestartApp), true);
        let ledger = CommandLedger::new();
        let action = CountingAction::new(&store.events);

        let mut first = poller(store.clone(), ledger.clone(), action.clone());
        first.tick().await;
        assert_eq!(action.runs(), 1);
        drop(first);

        // supervisor respawn: fresh poller, same ledger, lagged store
        let mut second = poller(store.clone(), ledger, action.clone());
        second.tick().await;
        second.tick().await;

        assert_eq!(action.runs(), 1);
    }

    #[tokio::test]
    async fn side_effect_failure_is_not_requeued() {
        let store = ScriptedStore::with_command(pending("cmd-1", CommandKind::RestartApp), false);
        let action = CountingAction::failing(&store.events);
        let metrics = AgentMetrics::new();
        let mut poller = CommandPoller::new(
            "device-1",
            CommandKind::RestartApp,
            store.clone(),
            CommandLedger::new(),
            action.clone(),
            metrics.clone(),
            test_timing(),
        );

        poller.tick().await;
        poller.tick().await;

        assert_eq!(action.runs(), 1);
        assert_eq!(metrics.commands_failed(), 1);
        assert_eq!(metrics.commands_executed(), 0);
    }

    #[tokio::test]
    async fn stuck_executing_state_self_heals() {
        let store = ScriptedStore::with_command(pending("cmd-1", CommandKind::RestartApp), false);
        *store.command.lock().unwrap() = None;
        let action = CountingAction::new(&store.events);
        let mut poller = poller(store.clone(), CommandLedger::new(), action.clone());
        poller.state = PollerState::Executing;

        poller.tick().await;

        assert_eq!(poller.state(), PollerState::Idle);
        assert_eq!(action.runs(), 0);
    }

    #[tokio::test]
    async fn executing_state_skips_while_command_pending() {
        let store = ScriptedStore::with_command(pending("cmd-1", CommandKind::RestartApp), false);
        let action = CountingAction::new(&store.events);
        let mut poller = poller(store.clone(), CommandLedger::new(), action.clone());
        poller.state = PollerState::Executing;

        poller.tick().await;

        assert_eq!(poller.state(), PollerState::Executing);
        assert_eq!(action.runs(), 0);
    }

    #[tokio::test]
    async fn fetch_error_backs_off() {
        struct FailingStore;

        #[async_trait]
        impl RemoteStore for FailingStore {
            async fn fetch_pending_command(
                &self,
                _device_id: &str,
                _kind: CommandKind,
            ) -> Result<Option<PendingCommand>, RemoteError> {
                Err(RemoteError::Transient("unreachable".into()))
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
                _flag: DeviceFlag,
            ) -> Result<Option<bool>, RemoteError> {
                Ok(None)
            }

            async fn upsert_heartbeat(
                &self,
                _beat: &crate::command::Heartbeat,
            ) -> Result<(), RemoteError> {
                Ok(())
            }
        }

        let events = Arc::new(Mutex::new(Vec::new()));
        let action = CountingAction::new(&events);
        let metrics = AgentMetrics::new();
        let mut poller = CommandPoller::new(
            "device-1",
            CommandKind::Reboot,
            Arc::new(FailingStore),
            CommandLedger::new(),
            action.clone(),
            metrics.clone(),
            test_timing(),
        );

        let delay = poller.tick().await;

        assert_eq!(delay, test_timing().error_retry);
        assert_eq!(metrics.transient_errors(), 1);
        assert_eq!(action.runs(), 0);
    }
}
