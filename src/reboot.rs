//! Elevated device reboot through an ordered strategy chain.
//!
//! The host may grant reboot rights through the service manager, a
//! sudoers entry, or not at all. Strategies are tried first-to-last;
//! the first success wins. A permission-denied outcome triggers one
//! privilege re-request per process lifetime, then counts as a failed
//! attempt.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Failure modes of a command side effect.
#[derive(Debug, thiserror::Error)]
pub enum SideEffectError {
    #[error("side effect failed: {0}")]
    Failed(String),
    #[error("missing privilege: {0}")]
    PermissionMissing(String),
}

/// One way of asking the host to reboot.
#[async_trait]
pub trait RebootStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn attempt(&self) -> Result<(), SideEffectError>;
}

/// Reboot through the service manager (needs a polkit grant).
struct SystemctlReboot;

#[async_trait]
impl RebootStrategy for SystemctlReboot {
    fn name(&self) -> &'static str {
        "systemctl"
    }

    async fn attempt(&self) -> Result<(), SideEffectError> {
        run_reboot_command("systemctl", &["reboot"]).await
    }
}

/// Reboot through non-interactive sudo (needs a sudoers entry).
struct SudoReboot;

#[async_trait]
impl RebootStrategy for SudoReboot {
    fn name(&self) -> &'static str {
        "sudo"
    }

    async fn attempt(&self) -> Result<(), SideEffectError> {
        run_reboot_command("sudo", &["-n", "reboot"]).await
    }
}

/// Raw reboot invocation, last resort.
struct RawReboot;

#[async_trait]
impl RebootStrategy for RawReboot {
    fn name(&self) -> &'static str {
        "reboot"
    }

    async fn attempt(&self) -> Result<(), SideEffectError> {
        run_reboot_command("reboot", &[]).await
    }
}

async fn run_reboot_command(program: &str, args: &[&str]) -> Result<(), SideEffectError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|err| SideEffectError::Failed(format!("{program} failed to run: {err}")))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if is_permission_denial(&stderr) {
        Err(SideEffectError::PermissionMissing(format!(
            "{program}: {stderr}"
        )))
    } else {
        Err(SideEffectError::Failed(format!(
            "{program} exited {}: {stderr}",
            output.status
        )))
    }
}

fn is_permission_denial(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("denied")
        || lowered.contains("permission")
        || lowered.contains("authentication")
        || lowered.contains("password is required")
        || lowered.contains("must be superuser")
        || lowered.contains("not permitted")
}

/// Tries reboot strategies in order; first success wins.
pub struct RebootManager {
    strategies: Vec<Box<dyn RebootStrategy>>,
    privilege_requested: AtomicBool,
}

impl RebootManager {
    pub fn new() -> Self {
        Self::with_strategies(vec![
            Box::new(SystemctlReboot),
            Box::new(SudoReboot),
            Box::new(RawReboot),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn RebootStrategy>>) -> Self {
        Self {
            strategies,
            privilege_requested: AtomicBool::new(false),
        }
    }

    /// Ask the host to reboot.
    ///
    /// Returns Ok as soon as one strategy reports success; the last
    /// error otherwise.
    pub async fn reboot(&self) -> Result<(), SideEffectError> {
        let mut last_error: Option<SideEffectError> = None;

        for strategy in &self.strategies {
            info!("[Reboot] attempting strategy '{}'", strategy.name());
            match strategy.attempt().await {
                Ok(()) => {
                    info!("[Reboot] ✅ reboot dispatched via '{}'", strategy.name());
                    return Ok(());
                }
                Err(SideEffectError::PermissionMissing(detail)) => {
                    self.request_privilege_once(strategy.name(), &detail);
                    last_error = Some(SideEffectError::PermissionMissing(detail));
                }
                Err(err) => {
                    warn!("[Reboot] strategy '{}' failed: {}", strategy.name(), err);
                    last_error = Some(err);
                }
            }
        }

        error!("[Reboot] ❌ all reboot strategies exhausted");
        Err(last_error
            .unwrap_or_else(|| SideEffectError::Failed("no reboot strategy available".into())))
    }

    pub fn privilege_requested(&self) -> bool {
        self.privilege_requested.load(Ordering::Relaxed)
    }

    fn request_privilege_once(&self, strategy: &str, detail: &str) {
        if !self.privilege_requested.swap(true, Ordering::SeqCst) {
            warn!("[Reboot] ⚠️ privilege missing for '{}': {}", strategy, detail);
            warn!(
                "[Reboot] grant the agent reboot rights via a polkit rule or a sudoers entry for 'reboot'"
            );
        }
    }
}

impl Default for RebootManager {
    fn default() -> Self {
        Self::new()
    }
}
