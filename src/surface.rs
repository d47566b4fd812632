//! Workspace surface collaborator and lifecycle policy.
//!
//! The approved-apps grid and the screen-pinning chrome live in an
//! external surface process. The reconciler drives it through the
//! `WorkspaceSurface` trait, and the surface routes the host's
//! back/home/pause/destroy affordances through the pure
//! `lifecycle_directive` policy below.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

/// Actions the reconciler can ask of the surface.
pub trait WorkspaceSurface: Send + Sync {
    /// Begin restricting the device to the approved set of apps.
    fn start_app_blocking(&self);
    /// Lift the restriction.
    fn stop_app_blocking(&self);
    /// Present the approved-apps grid.
    fn show_grid(&self);
    /// Dismiss the approved-apps grid.
    fn hide_grid(&self);
    /// Toggle the full-screen pin on the focused window.
    fn set_pinned(&self, pinned: bool);
}

/// Host affordances the surface must route through the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    BackPressed,
    HomePressed,
    PauseRequested,
    DestroyRequested,
}

/// What the surface should do in response to an affordance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceDirective {
    /// Let the host proceed with its default behavior.
    Allow,
    /// Re-show the approved-apps grid.
    ShowGrid,
    /// Re-open the designated application.
    ReopenPinnedApp,
    /// Re-create the surface the host tore down.
    RecreateSurface,
}

/// Affordance policy while supervision is engaged.
///
/// With neither flag set the host behaves normally. While engaged the
/// surface refuses dismissal; kiosk escalates the home/back/pause
/// affordances to re-open the pinned app, active-only re-shows the
/// grid instead.
pub fn lifecycle_directive(event: LifecycleEvent, active: bool, kiosk: bool) -> SurfaceDirective {
    if !active && !kiosk {
        return SurfaceDirective::Allow;
    }

    match event {
        LifecycleEvent::DestroyRequested => SurfaceDirective::RecreateSurface,
        LifecycleEvent::BackPressed
        | LifecycleEvent::HomePressed
        | LifecycleEvent::PauseRequested => {
            if kiosk {
                SurfaceDirective::ReopenPinnedApp
            } else {
                SurfaceDirective::ShowGrid
            }
        }
    }
}

/// Command-driven surface for hosts where the grid is a separate
/// process and pinning goes through the window manager.
pub struct ShellSurface {
    grid_command: Option<String>,
    blocking: AtomicBool,
}

impl ShellSurface {
    pub fn new(grid_command: Option<String>) -> Self {
        Self {
            grid_command,
            blocking: AtomicBool::new(false),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Relaxed)
    }

    /// First token of the grid command, for foreground allow-listing.
    pub fn grid_binary(&self) -> Option<String> {
        self.grid_command
            .as_deref()
            .and_then(|cmd| cmd.split_whitespace().next())
            .map(|binary| binary.rsplit('/').next().unwrap_or(binary).to_string())
    }

    fn spawn_detached(command: &str) {
        // spawn and forget; the surface process outlives this call
        let shell_cmd = format!("nohup {command} >/dev/null 2>&1 &");
        if let Err(err) = Command::new("sh").args(["-c", &shell_cmd]).spawn() {
            warn!("[Surface] failed to spawn '{}': {}", command, err);
        }
    }
}

impl WorkspaceSurface for ShellSurface {
    fn start_app_blocking(&self) {
        self.blocking.store(true, Ordering::Relaxed);
        info!("[Surface] 🔒 app blocking engaged");
    }

    fn stop_app_blocking(&self) {
        self.blocking.store(false, Ordering::Relaxed);
        info!("[Surface] 🔓 app blocking lifted");
    }

    fn show_grid(&self) {
        match &self.grid_command {
            Some(command) => {
                debug!("[Surface] showing approved-apps grid");
                Self::spawn_detached(command);
            }
            None => debug!("[Surface] no grid surface configured"),
        }
    }

    fn hide_grid(&self) {
        if let Some(binary) = self.grid_binary() {
            debug!("[Surface] dismissing approved-apps grid");
            if let Err(err) = Command::new("pkill").args(["-x", binary.as_str()]).spawn() {
                warn!("[Surface] failed to dismiss grid: {}", err);
            }
        }
    }

    fn set_pinned(&self, pinned: bool) {
        let toggle = if pinned { "add" } else { "remove" };
        let spec = format!("{toggle},fullscreen,above");
        info!(
            "[Surface] {} screen pinning",
            if pinned { "engaging" } else { "clearing" }
        );
        if let Err(err) = Command::new("wmctrl")
            .args(["-r", ":ACTIVE:", "-b", spec.as_str()])
            .spawn()
        {
            warn!("[Surface] wmctrl unavailable: {}", err);
        }
    }
}
