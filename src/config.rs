//! Agent configuration.
//!
//! A TOML file supplies the remote endpoint, the designated
//! application, and the polling cadences. Lookup order: the
//! `KIOSK_AGENT_CONFIG` environment variable, the system path, then
//! the user config dir.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

pub const CONFIG_ENV: &str = "KIOSK_AGENT_CONFIG";
const SYSTEM_CONFIG_PATH: &str = "/etc/kiosk-agent/config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub remote: RemoteConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub surface: SurfaceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the remote store, without the REST path suffix.
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    /// Free-form identifier of the designated application; resolved
    /// against the installed-app index at startup.
    pub designated_app: Option<String>,
    /// Directory holding the derived device identity. Defaults to the
    /// user data dir.
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub reboot_interval_secs: u64,
    pub reboot_error_retry_secs: u64,
    pub restart_interval_secs: u64,
    pub restart_error_retry_secs: u64,
    pub reconcile_interval_secs: u64,
    pub reconcile_error_retry_secs: u64,
    /// Delay before re-checking that a marked command stopped being
    /// visible in the remote store.
    pub settle_delay_secs: u64,
    /// Delay after executing a command before accepting the next one
    /// of the same kind.
    pub cooldown_secs: u64,
    pub supervisor_restart_delay_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            reboot_interval_secs: 30,
            reboot_error_retry_secs: 60,
            restart_interval_secs: 30,
            restart_error_retry_secs: 60,
            reconcile_interval_secs: 5,
            reconcile_error_retry_secs: 10,
            settle_delay_secs: 2,
            cooldown_secs: 5,
            supervisor_restart_delay_secs: 2,
        }
    }
}

impl PollConfig {
    pub fn reboot_interval(&self) -> Duration {
        Duration::from_secs(self.reboot_interval_secs)
    }

    pub fn reboot_error_retry(&self) -> Duration {
        Duration::from_secs(self.reboot_error_retry_secs)
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_secs)
    }

    pub fn restart_error_retry(&self) -> Duration {
        Duration::from_secs(self.restart_error_retry_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn reconcile_error_retry(&self) -> Duration {
        Duration::from_secs(self.reconcile_error_retry_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn supervisor_restart_delay(&self) -> Duration {
        Duration::from_secs(self.supervisor_restart_delay_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    /// Command spawned to present the approved-apps grid surface.
    pub grid_command: Option<String>,
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        let path = Self::locate().context("no configuration file found")?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;

        info!("[Config] loaded {}", path.display());
        Ok(config)
    }

    fn locate() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }

        let system = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system.exists() {
            return Some(system);
        }

        dirs::config_dir()
            .map(|dir| dir.join("kiosk-agent").join("config.toml"))
            .filter(|path| path.exists())
    }

    /// Directory for locally persisted agent state (the device id).
    pub fn state_dir(&self) -> PathBuf {
        self.device.state_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("kiosk-agent"))
                .unwrap_or_else(|| PathBuf::from("/var/lib/kiosk-agent"))
        })
    }
}
