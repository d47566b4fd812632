//! Host platform capabilities consumed by the supervision loops.
//!
//! Foreground queries and process control are external capabilities;
//! the loops only depend on the `DevicePlatform` trait so tests can
//! substitute scripted implementations.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::apps::{self, DesktopApp};

/// Settle delay between killing an application and relaunching it.
const RESTART_SETTLE: Duration = Duration::from_secs(2);
/// Shorter settle when the kill did not report success.
const RESTART_SETTLE_UNKILLED: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("platform query failed: {0}")]
    Query(String),
}

/// Process-level capabilities of the host device.
#[async_trait]
pub trait DevicePlatform: Send + Sync {
    /// Binary name of the application owning the focused window, or
    /// `None` when nothing is focused.
    async fn foreground_binary(&self) -> Result<Option<String>, PlatformError>;

    /// Launch an application; true when a launch was dispatched.
    async fn launch(&self, app: &DesktopApp) -> bool;

    /// Best-effort kill of all processes for a binary.
    async fn kill(&self, binary: &str) -> bool;

    /// Restart an application: kill, settle, relaunch.
    async fn restart(&self, app: &DesktopApp) -> bool;
}

/// X11 implementation backed by xdotool, /proc, and pkill.
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DevicePlatform for LinuxPlatform {
    async fn foreground_binary(&self) -> Result<Option<String>, PlatformError> {
        let output = Command::new("xdotool")
            .args(["getactivewindow", "getwindowpid"])
            .output()
            .await
            .map_err(|err| PlatformError::Query(format!("xdotool failed to run: {err}")))?;

        if !output.status.success() {
            // no focused window is a normal state, not an error
            debug!("[Platform] no active window reported");
            return Ok(None);
        }

        let pid = match parse_window_pid(&String::from_utf8_lossy(&output.stdout)) {
            Some(pid) => pid,
            None => return Ok(None),
        };

        let comm = tokio::fs::read_to_string(format!("/proc/{pid}/comm"))
            .await
            .map_err(|err| PlatformError::Query(format!("reading /proc/{pid}/comm: {err}")))?;

        Ok(Some(comm.trim().to_string()))
    }

    async fn launch(&self, app: &DesktopApp) -> bool {
        apps::launch(app).await
    }

    async fn kill(&self, binary: &str) -> bool {
        match Command::new("pkill").args(["-x", binary]).status().await {
            Ok(status) => {
                debug!("[Platform] pkill -x {} exited {}", binary, status);
                status.success()
            }
            Err(err) => {
                warn!("[Platform] pkill unavailable: {}", err);
                false
            }
        }
    }

    async fn restart(&self, app: &DesktopApp) -> bool {
        let binary = app.binary_name();
        let killed = self.kill(&binary).await;

        // let the old process tree die before the relaunch
        let settle = if killed {
            RESTART_SETTLE
        } else {
            RESTART_SETTLE_UNKILLED
        };
        tokio::time::sleep(settle).await;

        self.launch(app).await
    }
}

fn parse_window_pid(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok()
}
