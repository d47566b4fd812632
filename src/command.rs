//! Command and device wire types, plus the per-lifetime command ledger.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Kind of one-shot command an operator can queue for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Reboot,
    RestartApp,
}

impl CommandKind {
    /// Wire value used in remote store filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Reboot => "reboot",
            CommandKind::RestartApp => "restart_app",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending command row from the remote `commands` table.
///
/// The remote store owns the record; the agent only flips `executed`
/// (never back) and may delete the row as a fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCommand {
    pub id: String,
    pub device_id: String,
    pub kind: CommandKind,
    #[serde(default)]
    pub executed: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
}

/// Device heartbeat row upserted into the remote `devices` table.
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub device_id: String,
    pub hostname: String,
    pub agent_version: String,
    pub last_seen: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_mb: i64,
    pub uptime_secs: i64,
}

/// Command ids already acted on during this process lifetime.
///
/// Cloned handles share one set, so a supervisor respawn of a poller
/// loop keeps the ids processed by the previous incarnation. This only
/// defends against read-after-write lag within a session; the durable
/// guarantee is the mark-before-act write in the poller.
#[derive(Clone, Default)]
pub struct CommandLedger {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl CommandLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the id was already acted on this session.
    pub async fn is_processed(&self, id: &str) -> bool {
        self.inner.lock().await.contains(id)
    }

    /// Records an id as acted on.
    pub async fn mark_processed(&self, id: &str) {
        self.inner.lock().await.insert(id.to_string());
    }

    /// Number of ids recorded this session.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
