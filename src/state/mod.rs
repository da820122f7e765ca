//! View-model store
//!
//! Single-writer aggregate of everything the dashboard shows. Only the update
//! loop mutates it, and only by applying fetch completions or user actions.
//!
//! Key patterns:
//! - Derived state is keyed by `PaneId`; indices are display only
//! - `migrate_panes` runs on every pane list and is idempotent
//! - Counters are recomputed after each completion pass, never patched

pub mod agent;
pub mod counters;
pub mod panels;
pub mod snapshot;
pub mod timeline;

pub use agent::{AgentState, HealthStatus, RecoveryAction};
pub use counters::Counters;
pub use panels::PanelState;
pub use snapshot::AgentSnapshot;
pub use timeline::Timeline;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::beads::BeadsSummary;
use crate::capture::{CaptureScheduler, CapturedPane};
use crate::errors::{ErrorKind, NtmError};
use crate::mail::{InboxSummary, MailStatus};
use crate::panes::{Pane, PaneId};
use crate::sources::{
    Alert, CheckpointStatus, HandoffStatus, HistoryEntry, MetricsSnapshot, RoutingScore, SpawnState,
};
use crate::status::{AgentStatus, StatusKind};
use crate::tools::{CassContext, DcgStatus, FileChange, ScanReport};

/// Lines kept per pane in the preview cache
const PREVIEW_LINES: usize = 40;

/// Per-source panel data
#[derive(Debug, Default)]
pub struct Panels {
    pub alerts: PanelState<Vec<Alert>>,
    pub beads: PanelState<BeadsSummary>,
    pub metrics: PanelState<MetricsSnapshot>,
    pub routing: PanelState<Vec<RoutingScore>>,
    pub history: PanelState<Vec<HistoryEntry>>,
    pub file_changes: PanelState<Vec<FileChange>>,
    pub cass: PanelState<CassContext>,
    pub code_scan: PanelState<ScanReport>,
    pub dcg: PanelState<DcgStatus>,
    pub checkpoint: PanelState<CheckpointStatus>,
    pub handoff: PanelState<HandoffStatus>,
    pub mail_status: PanelState<MailStatus>,
    pub mail_inbox: PanelState<Vec<InboxSummary>>,
    pub spawn: PanelState<Option<SpawnState>>,
    /// Status detection pass errors (data lives on the agents)
    pub status: PanelState<()>,
}

/// What one pane-list migration changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    pub added: Vec<PaneId>,
    pub removed: Vec<PaneId>,
    /// (vanished id, replacement id) under the same title
    pub rotated: Vec<(PaneId, PaneId)>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.rotated.is_empty()
    }
}

/// A state change applied from detector output
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub pane_id: PaneId,
    pub previous: StatusKind,
    pub current: StatusKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPass {
    pub transitions: Vec<Transition>,
    pub recoveries: Vec<RecoveryAction>,
}

/// Input for one pane in a bulk status detection
#[derive(Debug, Clone)]
pub struct StatusSample {
    pub pane_id: PaneId,
    pub title: String,
    pub agent_type: crate::panes::AgentType,
    pub text: String,
    pub last_activity: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DashboardState {
    pub session: String,
    pub panes: Vec<Pane>,
    pub agents: HashMap<PaneId, AgentState>,
    /// Last captured text per pane
    pub outputs: HashMap<PaneId, CapturedPane>,
    /// Rendered preview lines per pane, rebuilt on capture
    pub previews: HashMap<PaneId, Vec<String>>,
    /// Agent Mail names from the session registry
    pub agent_names: HashMap<PaneId, String>,
    pub timeline: Timeline,
    pub capture: CaptureScheduler,
    pub selected: Option<PaneId>,
    pub cursor: usize,
    pub session_error: Option<NtmError>,
    pub session_updated_at: Option<DateTime<Utc>>,
    pub panels: Panels,
    pub counters: Counters,
}

impl DashboardState {
    pub fn new(session: impl Into<String>, capture: CaptureScheduler, timeline: Timeline) -> Self {
        Self {
            session: session.into(),
            panes: Vec::new(),
            agents: HashMap::new(),
            outputs: HashMap::new(),
            previews: HashMap::new(),
            agent_names: HashMap::new(),
            timeline,
            capture,
            selected: None,
            cursor: 0,
            session_error: None,
            session_updated_at: None,
            panels: Panels::default(),
            counters: Counters::default(),
        }
    }

    /// Re-key derived state onto a new pane list
    ///
    /// Surviving ids keep their state under the new index; vanished ids lose
    /// state and caches in this call; new agent panes get fresh state. A new
    /// id that reuses a vanished agent's title is flagged as rotated.
    pub fn migrate_panes(&mut self, panes: Vec<Pane>, now: DateTime<Utc>) -> MigrationReport {
        let mut report = MigrationReport::default();
        let agent_ids: HashSet<&str> = panes
            .iter()
            .filter(|p| p.is_agent())
            .map(|p| p.id.as_str())
            .collect();

        let mut vanished: Vec<PaneId> = self
            .agents
            .keys()
            .filter(|id| !agent_ids.contains(id.as_str()))
            .cloned()
            .collect();
        vanished.sort();

        let mut vanished_titles: HashMap<String, PaneId> = HashMap::new();
        for id in &vanished {
            if let Some(agent) = self.agents.remove(id) {
                vanished_titles.insert(agent.title, id.clone());
            }
            self.timeline.stop(id, now);
            tracing::debug!(pane_id = %id, "Pane vanished, dropping state");
        }
        report.removed = vanished;

        for pane in panes.iter().filter(|p| p.is_agent()) {
            if let Some(agent) = self.agents.get_mut(&pane.id) {
                agent.observe_pane(pane, now);
                agent.expire_rotation(now);
                continue;
            }
            let mut agent = AgentState::new(pane, now);
            if let Some(old) = vanished_titles.remove(&pane.title) {
                agent.mark_rotated(now);
                tracing::info!(old = %old, new = %pane.id, title = %pane.title, "Agent rotated to new pane");
                report.rotated.push((old, pane.id.clone()));
            }
            report.added.push(pane.id.clone());
            self.agents.insert(pane.id.clone(), agent);
        }

        let live: HashSet<&str> = panes.iter().map(|p| p.id.as_str()).collect();
        self.outputs.retain(|id, _| live.contains(id.as_str()));
        self.previews.retain(|id, _| live.contains(id.as_str()));
        self.agent_names.retain(|id, _| live.contains(id.as_str()));
        self.capture.retain(&live);

        self.panes = panes;
        self.reanchor_selection();
        report
    }

    /// Keep the selected id if it survived, else clamp the cursor
    fn reanchor_selection(&mut self) {
        if self.panes.is_empty() {
            self.selected = None;
            self.cursor = 0;
            return;
        }
        if let Some(pos) = self
            .selected
            .as_ref()
            .and_then(|id| self.panes.iter().position(|p| &p.id == id))
        {
            self.cursor = pos;
            return;
        }
        self.cursor = self.cursor.min(self.panes.len() - 1);
        self.selected = Some(self.panes[self.cursor].id.clone());
    }

    /// Apply a session fetch: panes, captures and their statuses
    pub fn apply_session(
        &mut self,
        panes: Vec<Pane>,
        captured: Vec<CapturedPane>,
        next_cursor: usize,
        statuses: &[AgentStatus],
        now: DateTime<Utc>,
    ) -> (MigrationReport, StatusPass) {
        let report = self.migrate_panes(panes, now);
        self.capture.apply(next_cursor, &captured);
        for c in captured {
            if !self.panes.iter().any(|p| p.id == c.pane_id) {
                continue;
            }
            self.previews.insert(c.pane_id.clone(), preview_lines(&c.text));
            self.outputs.insert(c.pane_id.clone(), c);
        }
        let pass = self.apply_statuses(statuses, now);
        self.session_error = None;
        self.session_updated_at = Some(now);
        (report, pass)
    }

    /// Session fetch failed
    ///
    /// A missing session empties the view; transport trouble keeps the last
    /// pane list on screen under the banner.
    pub fn fail_session(&mut self, err: NtmError, now: DateTime<Utc>) -> MigrationReport {
        let report = match err.kind() {
            ErrorKind::Canceled => return MigrationReport::default(),
            ErrorKind::SessionNotFound | ErrorKind::Unavailable => self.migrate_panes(Vec::new(), now),
            _ => MigrationReport::default(),
        };
        self.session_error = Some(err);
        report
    }

    /// Apply detector results for panes that still exist
    pub fn apply_statuses(&mut self, statuses: &[AgentStatus], now: DateTime<Utc>) -> StatusPass {
        let mut pass = StatusPass::default();
        for status in statuses {
            let Some(agent) = self.agents.get_mut(&status.pane_id) else {
                continue;
            };
            if agent.is_newer_than(status) {
                tracing::trace!(pane_id = %status.pane_id, "Skipping status from an older capture");
                continue;
            }
            let change = agent.apply_status(status, now);
            self.timeline.record(&status.pane_id, change.current, now);
            if change.previous != change.current {
                pass.transitions.push(Transition {
                    pane_id: status.pane_id.clone(),
                    previous: change.previous,
                    current: change.current,
                });
            }
            if let Some(recovery) = change.recovery {
                pass.recoveries.push(recovery);
            }
        }
        pass
    }

    pub fn mark_recovery_sent(&mut self, pane_id: &str, now: DateTime<Utc>) {
        if let Some(agent) = self.agents.get_mut(pane_id) {
            agent.mark_recovery_sent();
            self.timeline
                .marker(pane_id, timeline::MarkerKind::Prompt, "compaction recovery sent", now);
        }
    }

    /// Inputs for a bulk status pass over the output cache
    pub fn status_samples(&self) -> Vec<StatusSample> {
        let mut samples: Vec<StatusSample> = self
            .agents
            .values()
            .filter_map(|a| {
                self.outputs.get(&a.pane_id).map(|out| StatusSample {
                    pane_id: a.pane_id.clone(),
                    title: a.title.clone(),
                    agent_type: a.agent_type,
                    text: out.text.clone(),
                    last_activity: a.last_activity,
                    captured_at: out.captured_at,
                })
            })
            .collect();
        samples.sort_by(|a, b| a.pane_id.cmp(&b.pane_id));
        samples
    }

    /// Agent snapshots in display order
    pub fn snapshots(&self, now: DateTime<Utc>) -> Vec<AgentSnapshot> {
        let mut snaps: Vec<AgentSnapshot> = self
            .agents
            .values()
            .map(|a| AgentSnapshot::from_state(a, self.agent_names.get(&a.pane_id).cloned(), now))
            .collect();
        snaps.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.pane_id.cmp(&b.pane_id)));
        snaps
    }

    pub fn rotating(&self) -> Vec<PaneId> {
        let mut ids: Vec<PaneId> = self
            .agents
            .values()
            .filter(|a| a.is_rotating)
            .map(|a| a.pane_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn selected_pane(&self) -> Option<&Pane> {
        let id = self.selected.as_ref()?;
        self.panes.iter().find(|p| &p.id == id)
    }

    pub fn selected_agent(&self) -> Option<&AgentState> {
        self.agents.get(self.selected.as_ref()?)
    }

    pub fn select_next(&mut self) {
        if self.panes.is_empty() {
            return;
        }
        self.cursor = (self.cursor + 1) % self.panes.len();
        self.selected = Some(self.panes[self.cursor].id.clone());
    }

    pub fn select_prev(&mut self) {
        if self.panes.is_empty() {
            return;
        }
        self.cursor = if self.cursor == 0 {
            self.panes.len() - 1
        } else {
            self.cursor - 1
        };
        self.selected = Some(self.panes[self.cursor].id.clone());
    }

    pub fn recompute_counters(&mut self, now: DateTime<Utc>) {
        let mut c = Counters::default();
        for a in self.agents.values() {
            *c.by_type.entry(a.agent_type).or_default() += 1;
            *c.by_state.entry(a.state()).or_default() += 1;
        }
        if let Some(alerts) = &self.panels.alerts.data {
            for alert in alerts {
                *c.alerts.entry(alert.severity).or_default() += 1;
            }
        }
        c.checkpoint = self.panels.checkpoint.data.as_ref().map(|s| s.health(now));
        if let Some(beads) = &self.panels.beads.data {
            c.beads_ready = beads.counts.ready as usize;
            c.beads_in_progress = beads.counts.in_progress as usize;
            c.beads_blocked = beads.counts.blocked as usize;
        }
        if let Some(mail) = &self.panels.mail_status.data {
            c.mail_connected = mail.connected && self.panels.mail_status.error.is_none();
            c.mail_conflicts = mail.conflicts;
        }
        if let Some(inbox) = &self.panels.mail_inbox.data {
            c.mail_unread = inbox.iter().map(|s| s.unread).sum();
            c.mail_urgent = inbox.iter().map(|s| s.urgent).sum();
        }
        self.counters = c;
    }
}

/// Last lines of captured text, trailing blanks trimmed
fn preview_lines(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let end = lines.iter().rposition(|l| !l.is_empty()).map_or(0, |i| i + 1);
    let start = end.saturating_sub(PREVIEW_LINES);
    lines[start..end].iter().map(|l| (*l).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panes::AgentType;
    use crate::status::ContextUsage;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn pane(id: &str, index: u32) -> Pane {
        Pane {
            id: id.into(),
            index,
            title: format!("proj__cc_{}", id.trim_start_matches('%')),
            agent_type: AgentType::Claude,
            variant: None,
            command: "node".into(),
            width: 80,
            height: 24,
            last_activity: None,
        }
    }

    fn status(pane_id: &str, state: StatusKind) -> AgentStatus {
        AgentStatus {
            pane_id: pane_id.into(),
            state,
            error_kind: None,
            compaction_detected: false,
            context: ContextUsage::default(),
            token_velocity: 0.0,
            last_output: String::new(),
            analyzed_at: t(0),
            captured_at: None,
        }
    }

    fn captured(pane_id: &str, text: &str) -> CapturedPane {
        CapturedPane {
            pane_id: pane_id.into(),
            text: text.into(),
            last_activity: None,
            captured_at: t(1),
        }
    }

    fn store() -> DashboardState {
        DashboardState::new("main", CaptureScheduler::default(), Timeline::default())
    }

    #[test]
    fn test_pane_identity_migration() {
        let mut s = store();
        s.apply_session(
            vec![pane("%1", 0), pane("%2", 1)],
            vec![captured("%1", "a"), captured("%2", "b")],
            0,
            &[status("%1", StatusKind::Working), status("%2", StatusKind::Idle)],
            t(1),
        );
        s.selected = Some("%2".into());
        s.cursor = 1;

        let report = s.migrate_panes(vec![pane("%2", 0), pane("%3", 1)], t(2));

        let mut keys: Vec<&str> = s.agents.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["%2", "%3"]);
        assert_eq!(s.agents["%2"].state(), StatusKind::Idle);
        assert_eq!(s.agents["%2"].index, 0);
        assert!(!s.outputs.contains_key("%1"));
        assert!(!s.previews.contains_key("%1"));
        assert_eq!(report.removed, vec!["%1"]);
        assert_eq!(report.added, vec!["%3"]);
        // Selection follows the id, not the index
        assert_eq!(s.selected.as_deref(), Some("%2"));
        assert_eq!(s.cursor, 0);
    }

    #[test]
    fn test_migration_is_idempotent() {
        let mut s = store();
        let panes = vec![pane("%1", 0), pane("%2", 1)];
        s.migrate_panes(panes.clone(), t(1));
        s.apply_statuses(&[status("%1", StatusKind::Working)], t(1));
        let before: Vec<(String, StatusKind, u32)> = {
            let mut v: Vec<_> = s.agents.values().map(|a| (a.pane_id.clone(), a.state(), a.index)).collect();
            v.sort();
            v
        };
        let timeline_len = s.timeline.len();

        let report = s.migrate_panes(panes, t(1));
        assert!(report.is_empty());
        let mut after: Vec<_> = s.agents.values().map(|a| (a.pane_id.clone(), a.state(), a.index)).collect();
        after.sort();
        assert_eq!(before, after);
        assert_eq!(s.timeline.len(), timeline_len);
    }

    #[test]
    fn test_vanished_selection_clamps() {
        let mut s = store();
        s.migrate_panes(vec![pane("%1", 0), pane("%2", 1), pane("%3", 2)], t(1));
        s.selected = Some("%3".into());
        s.cursor = 2;
        s.migrate_panes(vec![pane("%1", 0)], t(2));
        assert_eq!(s.cursor, 0);
        assert_eq!(s.selected.as_deref(), Some("%1"));
    }

    #[test]
    fn test_rotation_under_same_title() {
        let mut s = store();
        s.migrate_panes(vec![pane("%1", 0)], t(1));
        let mut replacement = pane("%9", 0);
        replacement.title = "proj__cc_1".into();
        let report = s.migrate_panes(vec![replacement], t(2));
        assert_eq!(report.rotated, vec![("%1".to_string(), "%9".to_string())]);
        assert!(s.agents["%9"].is_rotating);
        assert_eq!(s.rotating(), vec!["%9"]);
    }

    #[test]
    fn test_timeline_only_on_transitions() {
        let mut s = store();
        s.migrate_panes(vec![pane("%1", 0)], t(0));
        let pass = s.apply_statuses(&[status("%1", StatusKind::Working)], t(1));
        assert_eq!(pass.transitions.len(), 1);
        let len = s.timeline.len();
        let pass = s.apply_statuses(&[status("%1", StatusKind::Working)], t(2));
        assert!(pass.transitions.is_empty());
        assert_eq!(s.timeline.len(), len);
        // Unknown pane ids never reach the timeline
        s.apply_statuses(&[status("%42", StatusKind::Error)], t(3));
        assert!(s.timeline.current_state("%42").is_none());
    }

    #[test]
    fn test_session_not_found_empties_view() {
        let mut s = store();
        s.migrate_panes(vec![pane("%1", 0)], t(0));
        s.fail_session(NtmError::transport("list-panes", "flaky"), t(1));
        assert_eq!(s.panes.len(), 1);
        s.fail_session(NtmError::SessionNotFound("main".into()), t(2));
        assert!(s.panes.is_empty());
        assert!(s.agents.is_empty());
        assert!(s.session_error.is_some());
    }

    #[test]
    fn test_counters_recomputed() {
        let mut s = store();
        s.migrate_panes(vec![pane("%1", 0), pane("%2", 1)], t(0));
        s.apply_statuses(
            &[status("%1", StatusKind::Working), status("%2", StatusKind::Idle)],
            t(1),
        );
        s.recompute_counters(t(1));
        assert_eq!(s.counters.agents(AgentType::Claude), 2);
        assert_eq!(s.counters.state(StatusKind::Working), 1);
        assert_eq!(s.counters.state(StatusKind::Idle), 1);
        assert_eq!(s.counters.checkpoint, None);
    }

    #[test]
    fn test_preview_lines_trim() {
        let lines = preview_lines("a\nb  \n\n\n");
        assert_eq!(lines, vec!["a", "b"]);
        assert!(preview_lines("").is_empty());
    }
}
