//! Stable device identity derivation.
//!
//! The identity is the foreign key for every remote lookup, so it must
//! stay identical across process restarts and, best-effort, across
//! reinstalls on the same hardware. A previously persisted identity
//! always wins; otherwise a deterministic seed is hashed and persisted
//! for future runs.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

const IDENTITY_FILE: &str = "device-id";
const MACHINE_ID_PATH: &str = "/etc/machine-id";
const IDENTITY_HEX_LEN: usize = 32;

/// Load the persisted device identity, deriving and persisting one on
/// first run.
pub fn load_or_derive(state_dir: &Path) -> Result<String> {
    let path = state_dir.join(IDENTITY_FILE);

    if let Ok(existing) = fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            debug!("[Identity] loaded device id from {}", path.display());
            return Ok(existing.to_string());
        }
    }

    let seed = identity_seed(MACHINE_ID_PATH);
    let id = digest_seed(&seed);

    fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
    fs::write(&path, &id)
        .with_context(|| format!("failed to persist device id to {}", path.display()))?;

    info!(
        "[Identity] derived device id {} ({} seed)",
        id,
        seed.split(':').next().unwrap_or("unknown")
    );

    Ok(id)
}

/// Builds the deterministic identity seed.
///
/// The machine id survives reinstalls of this software, so it is the
/// preferred seed. The hardware fallback is weaker (hostnames can be
/// reused) but still deterministic; the random last resort relies on
/// the persisted file for stability.
fn identity_seed(machine_id_path: &str) -> String {
    if let Ok(machine_id) = fs::read_to_string(machine_id_path) {
        let machine_id = machine_id.trim();
        if !machine_id.is_empty() {
            return format!("mid:{machine_id}");
        }
    }

    if let Ok(host) = hostname::get() {
        if let Ok(host) = host.into_string() {
            if !host.is_empty() {
                warn!("[Identity] machine id unavailable, using hardware seed");
                return format!("hw:{}|{}", host.to_lowercase(), std::env::consts::ARCH);
            }
        }
    }

    warn!("[Identity] no stable hardware seed available, generating a random identity");
    format!("uuid:{}", uuid::Uuid::new_v4())
}

fn digest_seed(seed: &str) -> String {
    let hash = blake3::hash(seed.as_bytes());
    let hex = hash.to_hex();
    hex.as_str()[..IDENTITY_HEX_LEN].to_string()
}
