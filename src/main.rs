//! kiosk-agent: remote supervision agent for fixed-purpose devices.
//!
//! Polls the fleet backend for desired state and one-shot commands,
//! reconciles the local device against it, and keeps its own loops
//! alive until the host asks it to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiosk_agent::apps::AppCatalog;
use kiosk_agent::config::AgentConfig;
use kiosk_agent::identity;
use kiosk_agent::platform::{DevicePlatform, LinuxPlatform};
use kiosk_agent::poller::PollerTiming;
use kiosk_agent::reconciler::ReconcilerTiming;
use kiosk_agent::remote::{RemoteStateClient, RemoteStore};
use kiosk_agent::supervisor::{ServiceSupervisor, SupervisorTiming};
use kiosk_agent::surface::ShellSurface;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("kiosk-agent v{} starting", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load().context("failed to load configuration")?;

    let device_id = identity::load_or_derive(&config.state_dir())
        .context("failed to establish device identity")?;
    info!("[Agent] device id: {}", device_id);

    let store: Arc<dyn RemoteStore> = Arc::new(
        RemoteStateClient::new(&config.remote.base_url, &config.remote.api_key)
            .context("failed to build remote store client")?,
    );

    let catalog = AppCatalog::new();
    let target = config
        .device
        .designated_app
        .as_deref()
        .and_then(|query| catalog.resolve(query).cloned());

    match (config.device.designated_app.as_deref(), &target) {
        (Some(query), Some(app)) => {
            info!(
                "[Agent] designated app '{}' resolved to '{}' ({})",
                query, app.name, app.id
            );
        }
        (Some(query), None) => {
            warn!(
                "[Agent] designated app '{}' not found among installed applications; \
                 restart and kiosk enforcement degrade to logged no-ops",
                query
            );
        }
        (None, _) => {
            warn!(
                "[Agent] no designated app configured; restart and kiosk enforcement \
                 are inactive until one is set"
            );
        }
    }

    let platform: Arc<dyn DevicePlatform> = Arc::new(LinuxPlatform::new());
    let surface = Arc::new(ShellSurface::new(config.surface.grid_command.clone()));

    // The agent's own surface may legitimately hold the foreground.
    let allowed_binaries: Vec<String> = surface.grid_binary().into_iter().collect();

    let timing = SupervisorTiming {
        reboot: PollerTiming {
            interval: config.poll.reboot_interval(),
            error_retry: config.poll.reboot_error_retry(),
            settle_delay: config.poll.settle_delay(),
            cooldown: config.poll.cooldown(),
        },
        restart: PollerTiming {
            interval: config.poll.restart_interval(),
            error_retry: config.poll.restart_error_retry(),
            settle_delay: config.poll.settle_delay(),
            cooldown: config.poll.cooldown(),
        },
        reconcile: ReconcilerTiming {
            interval: config.poll.reconcile_interval(),
            error_retry: config.poll.reconcile_error_retry(),
        },
        restart_delay: config.poll.supervisor_restart_delay(),
    };

    let supervisor = ServiceSupervisor::new(
        device_id,
        store,
        platform,
        surface,
        target,
        allowed_binaries,
        timing,
    );

    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("[Agent] shutdown requested");
            stop_signal.store(true, Ordering::Relaxed);
        }
    });

    supervisor.run(stop).await;

    info!("[Agent] stopped");
    Ok(())
}
