/*!
 * Kiosk Agent Library
 *
 * Core modules for remote device supervision: desired-state
 * reconciliation, idempotent command execution, and loop liveness.
 */

pub mod apps;
pub mod command;
pub mod config;
pub mod foreground;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod platform;
pub mod poller;
pub mod reboot;
pub mod reconciler;
pub mod remote;
pub mod supervisor;
pub mod surface;

// Re-export commonly used types
pub use command::{CommandKind, CommandLedger, PendingCommand};
pub use poller::{CommandPoller, PollerState};
pub use reconciler::StateReconciler;
pub use remote::{RemoteStateClient, RemoteStore};
pub use supervisor::ServiceSupervisor;
