//! Per-pane agent state
//!
//! Created the first time an agent-typed pane is enumerated, mutated only
//! when the dashboard applies a fetch completion, and dropped the first tick
//! after the pane disappears.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::panes::{AgentType, Pane, PaneId};
use crate::status::{display_state, AgentErrorKind, AgentStatus, ContextUsage, StatusKind};

/// A marker that reappears within this window is the same compaction
pub const COMPACTION_COOLDOWN: Duration = Duration::from_secs(60);

/// How long rotation flags stay set
pub const ROTATION_TTL: Duration = Duration::from_secs(30);

/// Working without new output for this long is a stall
pub const STALL_AFTER: Duration = Duration::from_secs(5 * 60);

/// Context usage thresholds for health
pub const CONTEXT_WARNING_PERCENT: f64 = 85.0;
pub const CONTEXT_ERROR_PERCENT: f64 = 95.0;

/// Restarts within an hour before health degrades
const RESTART_WARNING_COUNT: usize = 3;

const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    /// Restart timestamps, pruned to the last hour
    #[serde(skip)]
    restarts: VecDeque<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    /// Whether the agent process has been seen in the foreground
    #[serde(skip)]
    seen_running: bool,
    #[serde(skip)]
    was_shell: bool,
}

impl Health {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: HealthStatus::Ok,
            issues: Vec::new(),
            restarts: VecDeque::new(),
            started_at: now,
            seen_running: false,
            was_shell: false,
        }
    }

    pub fn restarts_last_hour(&self) -> usize {
        self.restarts.len()
    }

    pub fn uptime_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.started_at).num_seconds().max(0) as u64
    }

    /// Track the pane's foreground command; a shell → agent edge is a restart
    fn observe_command(&mut self, is_shell: bool, now: DateTime<Utc>) -> bool {
        let restarted = self.was_shell && !is_shell && self.seen_running;
        if restarted {
            self.restarts.push_back(now);
            self.started_at = now;
        }
        if !is_shell {
            self.seen_running = true;
        }
        self.was_shell = is_shell;
        self.prune(now);
        restarted
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(first) = self.restarts.front() {
            if elapsed(*first, now) > HOUR {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }
}

fn elapsed(earlier: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}

/// Recovery nudge owed to a pane after a fresh compaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAction {
    pub pane_id: PaneId,
    pub title: String,
    pub detected_at: DateTime<Utc>,
}

/// What changed when a status was applied
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub previous: StatusKind,
    pub current: StatusKind,
    pub recovery: Option<RecoveryAction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentState {
    pub pane_id: PaneId,
    pub title: String,
    pub agent_type: AgentType,
    /// Display index, refreshed on every migration
    pub index: u32,
    /// Detector classification before the compaction overlay
    pub raw_state: StatusKind,
    pub error_kind: Option<AgentErrorKind>,
    pub context: ContextUsage,
    pub token_velocity: f64,
    pub last_output: String,
    pub last_output_changed_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_compaction: Option<DateTime<Utc>>,
    pub recovery_sent: bool,
    #[serde(skip)]
    compaction_marker_visible: bool,
    pub is_rotating: bool,
    pub rotated_at: Option<DateTime<Utc>>,
    pub health: Health,
    pub updated_at: Option<DateTime<Utc>>,
    /// Capture time of the text behind the current status
    #[serde(skip)]
    status_captured_at: Option<DateTime<Utc>>,
}

impl AgentState {
    pub fn new(pane: &Pane, now: DateTime<Utc>) -> Self {
        let mut health = Health::new(now);
        health.observe_command(pane.runs_shell(), now);
        Self {
            pane_id: pane.id.clone(),
            title: pane.title.clone(),
            agent_type: pane.agent_type,
            index: pane.index,
            raw_state: StatusKind::Unknown,
            error_kind: None,
            context: ContextUsage::default(),
            token_velocity: 0.0,
            last_output: String::new(),
            last_output_changed_at: None,
            last_activity: pane.last_activity,
            last_compaction: None,
            recovery_sent: false,
            compaction_marker_visible: false,
            is_rotating: false,
            rotated_at: None,
            health,
            updated_at: None,
            status_captured_at: None,
        }
    }

    /// State shown to the user, with the compaction overlay
    pub fn state(&self) -> StatusKind {
        display_state(self.raw_state, self.last_compaction.is_some())
    }

    /// Refresh pane metadata from a new enumeration
    pub fn observe_pane(&mut self, pane: &Pane, now: DateTime<Utc>) {
        self.index = pane.index;
        self.title = pane.title.clone();
        self.last_activity = pane.last_activity;
        if self.health.observe_command(pane.runs_shell(), now) {
            tracing::info!(pane_id = %self.pane_id, "Agent restart detected");
        }
        self.evaluate_health(now);
    }

    /// The current status came from a later capture than `status`
    pub fn is_newer_than(&self, status: &AgentStatus) -> bool {
        matches!(
            (self.status_captured_at, status.captured_at),
            (Some(current), Some(incoming)) if incoming < current
        )
    }

    /// Apply one detector result
    pub fn apply_status(&mut self, status: &AgentStatus, now: DateTime<Utc>) -> StatusChange {
        let previous = self.state();
        if status.captured_at.is_some() {
            self.status_captured_at = status.captured_at;
        }

        let mut recovery = None;
        if status.compaction_detected && !self.compaction_marker_visible {
            let recent = self
                .last_compaction
                .is_some_and(|t| elapsed(t, now) < COMPACTION_COOLDOWN);
            if !recent {
                self.last_compaction = Some(now);
                self.recovery_sent = false;
                recovery = Some(RecoveryAction {
                    pane_id: self.pane_id.clone(),
                    title: self.title.clone(),
                    detected_at: now,
                });
            }
        }
        self.compaction_marker_visible = status.compaction_detected;

        if status.last_output != self.last_output {
            self.last_output_changed_at = Some(now);
            self.last_output = status.last_output.clone();
        }
        self.raw_state = status.state;
        self.error_kind = status.error_kind;
        self.context = status.context.clone();
        self.token_velocity = status.token_velocity;
        self.updated_at = Some(now);
        self.evaluate_health(now);

        StatusChange {
            previous,
            current: self.state(),
            recovery,
        }
    }

    pub fn mark_recovery_sent(&mut self) {
        self.recovery_sent = true;
    }

    pub fn mark_rotated(&mut self, now: DateTime<Utc>) {
        self.is_rotating = true;
        self.rotated_at = Some(now);
    }

    /// Clear rotation flags once they have been shown long enough
    pub fn expire_rotation(&mut self, now: DateTime<Utc>) {
        if let Some(at) = self.rotated_at {
            if elapsed(at, now) >= ROTATION_TTL {
                self.is_rotating = false;
                self.rotated_at = None;
            }
        }
    }

    /// Working with no new output past the stall threshold
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.raw_state == StatusKind::Working
            && self
                .last_output_changed_at
                .is_some_and(|t| elapsed(t, now) > STALL_AFTER)
    }

    fn evaluate_health(&mut self, now: DateTime<Utc>) {
        self.health.prune(now);
        let mut issues = Vec::new();
        let mut status = HealthStatus::Ok;
        let mut raise = |level: HealthStatus, issue: String| {
            status = status.max(level);
            issues.push(issue);
        };

        match self.raw_state {
            StatusKind::Error => raise(
                HealthStatus::Error,
                format!(
                    "error: {}",
                    self.error_kind.map_or("unknown", AgentErrorKind::as_str)
                ),
            ),
            StatusKind::RateLimited => raise(HealthStatus::Warning, "rate limited".to_string()),
            _ => {}
        }

        let pct = self.context.usage_percent;
        if self.context.tokens_limit > 0 {
            if pct > CONTEXT_ERROR_PERCENT {
                raise(HealthStatus::Error, format!("context {pct:.0}% used"));
            } else if pct > CONTEXT_WARNING_PERCENT {
                raise(HealthStatus::Warning, format!("context {pct:.0}% used"));
            }
        }

        if self.is_stalled(now) {
            raise(HealthStatus::Warning, "no output for 5m while working".to_string());
        }

        let restarts = self.health.restarts_last_hour();
        if restarts >= RESTART_WARNING_COUNT {
            raise(HealthStatus::Warning, format!("{restarts} restarts in the last hour"));
        }

        if self.health.was_shell && self.health.seen_running {
            raise(HealthStatus::Warning, "agent exited to shell".to_string());
        }

        self.health.status = status;
        self.health.issues = issues;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn pane(cmd: &str) -> Pane {
        Pane {
            id: "%1".into(),
            index: 0,
            title: "proj__cc_1".into(),
            agent_type: AgentType::Claude,
            variant: None,
            command: cmd.into(),
            width: 80,
            height: 24,
            last_activity: None,
        }
    }

    fn status(state: StatusKind, compaction: bool, pct: f64) -> AgentStatus {
        AgentStatus {
            pane_id: "%1".into(),
            state,
            error_kind: None,
            compaction_detected: compaction,
            context: ContextUsage {
                tokens_used: 0,
                tokens_limit: 200_000,
                usage_percent: pct,
                model_name: Some("sonnet".into()),
            },
            token_velocity: 0.0,
            last_output: "out".into(),
            analyzed_at: t(0),
            captured_at: None,
        }
    }

    #[test]
    fn test_compaction_fires_once_per_sighting() {
        let mut a = AgentState::new(&pane("node"), t(0));

        let first = a.apply_status(&status(StatusKind::Idle, true, 100.0), t(1));
        assert!(first.recovery.is_some());
        assert_eq!(a.state(), StatusKind::Compacted);
        assert_eq!(a.last_compaction, Some(t(1)));
        assert!(!a.recovery_sent);
        a.mark_recovery_sent();

        // Same marker still on screen
        let second = a.apply_status(&status(StatusKind::Idle, true, 100.0), t(20));
        assert!(second.recovery.is_none());
        assert!(a.recovery_sent);

        // Marker scrolls away and reappears within the cooldown
        a.apply_status(&status(StatusKind::Working, false, 10.0), t(30));
        let third = a.apply_status(&status(StatusKind::Idle, true, 100.0), t(40));
        assert!(third.recovery.is_none());

        // A later compaction is a new detection
        a.apply_status(&status(StatusKind::Working, false, 10.0), t(200));
        let fourth = a.apply_status(&status(StatusKind::Idle, true, 100.0), t(300));
        assert!(fourth.recovery.is_some());
        assert!(!a.recovery_sent);
    }

    #[test]
    fn test_error_overrides_compacted() {
        let mut a = AgentState::new(&pane("node"), t(0));
        a.apply_status(&status(StatusKind::Idle, true, 100.0), t(1));
        let change = a.apply_status(&status(StatusKind::Error, false, 10.0), t(2));
        assert_eq!(change.previous, StatusKind::Compacted);
        assert_eq!(change.current, StatusKind::Error);
        assert_eq!(a.health.status, HealthStatus::Error);
    }

    #[test]
    fn test_context_pressure_health() {
        let mut a = AgentState::new(&pane("node"), t(0));
        a.apply_status(&status(StatusKind::Working, false, 90.0), t(1));
        assert_eq!(a.health.status, HealthStatus::Warning);
        a.apply_status(&status(StatusKind::Working, false, 97.0), t(2));
        assert_eq!(a.health.status, HealthStatus::Error);
    }

    #[test]
    fn test_restart_detection() {
        let mut a = AgentState::new(&pane("node"), t(0));
        a.observe_pane(&pane("zsh"), t(10));
        assert!(a.health.issues.iter().any(|i| i.contains("exited")));
        a.observe_pane(&pane("node"), t(20));
        assert_eq!(a.health.restarts_last_hour(), 1);
        assert_eq!(a.health.started_at, t(20));
        assert_eq!(a.health.status, HealthStatus::Ok);
    }

    #[test]
    fn test_rotation_expires() {
        let mut a = AgentState::new(&pane("node"), t(0));
        a.mark_rotated(t(0));
        a.expire_rotation(t(10));
        assert!(a.is_rotating);
        a.expire_rotation(t(31));
        assert!(!a.is_rotating);
        assert!(a.rotated_at.is_none());
    }

    #[test]
    fn test_stall_detection() {
        let mut a = AgentState::new(&pane("node"), t(0));
        a.apply_status(&status(StatusKind::Working, false, 10.0), t(0));
        assert!(!a.is_stalled(t(60)));
        assert!(a.is_stalled(t(400)));
    }
}
