//! Local data sources behind the dashboard panels
//!
//! File-backed sources (checkpoints, handoffs, history, spawn state) read
//! project or config files; derived sources (alerts, metrics, routing) are
//! pure functions over an agent snapshot. All of them run as refresh fetches.

pub mod alerts;
pub mod checkpoint;
pub mod handoff;
pub mod history;
pub mod metrics;
pub mod routing;
pub mod spawn;

pub use alerts::{compute_alerts, Alert, AlertContext, AlertKind, Severity};
pub use checkpoint::{load_checkpoints, CheckpointHealth, CheckpointStatus};
pub use handoff::{load_handoffs, HandoffStatus};
pub use history::{load_history, HistoryEntry};
pub use metrics::{compute_metrics, MetricsSnapshot};
pub use routing::RoutingScore;
pub use spawn::{load_spawn_state, SpawnState};
