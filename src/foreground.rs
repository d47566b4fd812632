//! Foreground enforcement for the designated application.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::apps::DesktopApp;
use crate::platform::DevicePlatform;

/// Delay before relaunching, so a transient focus change can settle.
const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

/// Re-affirms that the designated application owns the screen.
///
/// Runs serialized inside the reconciler tick; never concurrent with
/// itself.
pub struct ForegroundGuard {
    platform: Arc<dyn DevicePlatform>,
    target: Option<DesktopApp>,
    target_binary: Option<String>,
    /// Binaries allowed in the foreground besides the target (the
    /// agent's own surface).
    allowed: Vec<String>,
    settle: Duration,
}

impl ForegroundGuard {
    pub fn new(
        platform: Arc<dyn DevicePlatform>,
        target: Option<DesktopApp>,
        allowed: Vec<String>,
    ) -> Self {
        let target_binary = target.as_ref().map(|app| app.binary_name());
        Self {
            platform,
            target,
            target_binary,
            allowed,
            settle: DEFAULT_SETTLE,
        }
    }

    #[cfg(test)]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Ensure the designated app is foreground, relaunching it when an
    /// unauthorized app (or nothing) holds focus. Returns true when
    /// the target already held focus or a relaunch was dispatched.
    pub async fn ensure_foreground(&self) -> bool {
        let target = match &self.target {
            Some(target) => target,
            None => {
                debug!("[Foreground] no designated app configured, nothing to enforce");
                return false;
            }
        };

        let current = match self.platform.foreground_binary().await {
            Ok(current) => current,
            Err(err) => {
                warn!("[Foreground] foreground query failed: {}", err);
                return false;
            }
        };

        if let Some(binary) = &current {
            if self.is_allowed(binary) {
                debug!("[Foreground] '{}' already in foreground", binary);
                return true;
            }
            warn!("[Foreground] ⚠️ unauthorized app in foreground: {}", binary);
        } else {
            debug!("[Foreground] nothing focused, bringing designated app up");
        }

        tokio::time::sleep(self.settle).await;
        self.platform.launch(target).await
    }

    pub fn is_allowed(&self, binary: &str) -> bool {
        self.target_binary.as_deref() == Some(binary)
            || self.allowed.iter().any(|allowed| allowed == binary)
    }
}
