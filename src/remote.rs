//! Typed accessor over the remote device-state store.
//!
//! Thin wrapper around the backend's PostgREST-style interface: fetch
//! one pending command, read device flags, mark/delete commands, and
//! upsert the device heartbeat. No retry or idempotency logic lives
//! here; callers retry at their own cadence, which bounds backend load.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde_json::json;
use tracing::debug;

use crate::command::{CommandKind, Heartbeat, PendingCommand};

/// Errors surfaced by remote store calls.
///
/// "No matching record" is not an error; those paths return `None` or
/// `false` instead.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Network or backend hiccup; the caller retries on its next tick.
    #[error("transient remote error: {0}")]
    Transient(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        RemoteError::Transient(err.to_string())
    }
}

/// Per-device boolean flags stored in the `devices` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFlag {
    Active,
    Kiosk,
}

impl DeviceFlag {
    pub fn column(&self) -> &'static str {
        match self {
            DeviceFlag::Active => "active",
            DeviceFlag::Kiosk => "kiosk",
        }
    }
}

/// Contract for reads and writes against the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch one pending, unexecuted command of the given kind.
    async fn fetch_pending_command(
        &self,
        device_id: &str,
        kind: CommandKind,
    ) -> Result<Option<PendingCommand>, RemoteError>;

    /// Mark a command executed. Returns false when no row matched.
    async fn mark_executed(&self, command_id: &str) -> Result<bool, RemoteError>;

    /// Delete a command. Returns false when no row matched.
    async fn delete_command(&self, command_id: &str) -> Result<bool, RemoteError>;

    /// Read one device flag. Returns `None` when the device row is
    /// missing.
    async fn fetch_flag(
        &self,
        device_id: &str,
        flag: DeviceFlag,
    ) -> Result<Option<bool>, RemoteError>;

    /// Insert or update the device heartbeat row.
    async fn upsert_heartbeat(&self, beat: &Heartbeat) -> Result<(), RemoteError>;
}

/// reqwest-backed client for the production backend.
pub struct RemoteStateClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RemoteStateClient {
    /// Remote calls must never stall a loop past its tick.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

fn check_backend(status: StatusCode) -> Result<(), RemoteError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(RemoteError::Transient(format!("backend returned {status}")))
    }
}

#[async_trait]
impl RemoteStore for RemoteStateClient {
    async fn fetch_pending_command(
        &self,
        device_id: &str,
        kind: CommandKind,
    ) -> Result<Option<PendingCommand>, RemoteError> {
        let response = self
            .authed(self.http.get(self.table_url("commands")))
            .query(&[
                ("device_id", format!("eq.{device_id}")),
                ("kind", format!("eq.{}", kind.as_str())),
                ("executed", "eq.false".to_string()),
                ("order", "created_at.asc".to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;

        check_backend(response.status())?;

        let mut rows: Vec<PendingCommand> = response.json().await?;
        if rows.is_empty() {
            debug!("[Remote] no pending {} command for {}", kind, device_id);
            Ok(None)
        } else {
            Ok(Some(rows.remove(0)))
        }
    }

    async fn mark_executed(&self, command_id: &str) -> Result<bool, RemoteError> {
        let response = self
            .authed(self.http.patch(self.table_url("commands")))
            .query(&[("id", format!("eq.{command_id}"))])
            .header("Prefer", "return=representation")
            .json(&json!({
                "executed": true,
                "executed_at": Utc::now(),
            }))
            .send()
            .await?;

        check_backend(response.status())?;

        let rows: Vec<serde_json::Value> = response.json().await?;
        Ok(!rows.is_empty())
    }

    async fn delete_command(&self, command_id: &str) -> Result<bool, RemoteError> {
        let response = self
            .authed(self.http.delete(self.table_url("commands")))
            .query(&[("id", format!("eq.{command_id}"))])
            .header("Prefer", "return=representation")
            .send()
            .await?;

        check_backend(response.status())?;

        let rows: Vec<serde_json::Value> = response.json().await?;
        Ok(!rows.is_empty())
    }

    async fn fetch_flag(
        &self,
        device_id: &str,
        flag: DeviceFlag,
    ) -> Result<Option<bool>, RemoteError> {
        let response = self
            .authed(self.http.get(self.table_url("devices")))
            .query(&[
                ("device_id", format!("eq.{device_id}")),
                ("select", flag.column().to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;

        check_backend(response.status())?;

        let rows: Vec<serde_json::Value> = response.json().await?;
        Ok(rows
            .first()
            .and_then(|row| row.get(flag.column()))
            .and_then(|value| value.as_bool()))
    }

    async fn upsert_heartbeat(&self, beat: &Heartbeat) -> Result<(), RemoteError> {
        let response = self
            .authed(self.http.post(self.table_url("devices")))
            .query(&[("on_conflict", "device_id")])
            .header("Prefer", "resolution=merge-duplicates")
            .json(beat)
            .send()
            .await?;

        check_backend(response.status())?;
        Ok(())
    }
}
