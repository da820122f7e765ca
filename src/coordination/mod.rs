//! Coordination engine
//!
//! Runs beside the dashboard (or headless) and talks to agents through Agent
//! Mail. Three loops share one task:
//!
//! - **monitor** every `poll_interval`: capture every agent pane, classify it,
//!   enroll new panes in the session registry and emit transition events
//! - **conflicts** every `conflict_every` monitor cycles: detect overlapping
//!   exclusive reservations and notify or negotiate
//! - **digest** every `digest_interval` (opt-in): markdown summary to a human
//!
//! Events go out on a bounded channel; when the consumer lags they are dropped.

pub mod assign;
pub mod conflicts;
pub mod digest;
pub mod pathmatch;

pub use assign::{AssignReport, Assignment};
pub use conflicts::{Conflict, ConflictAction, ConflictMode, Holder};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::beads::TicketTool;
use crate::capture;
use crate::config::CoordinatorConfig;
use crate::context::FetchContext;
use crate::errors::{NtmError, Result};
use crate::mail::{enroll, AgentMail, Importance, OutgoingMessage, RegistryStore};
use crate::panes::{self, PaneId};
use crate::state::{AgentSnapshot, AgentState};
use crate::status::{StatusDetector, StatusKind};
use crate::tmux::Multiplexer;

/// Coordinator event channel capacity
pub const EVENT_CAPACITY: usize = 100;

/// Lines captured per pane by the monitor loop
const MONITOR_LINES: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorEventKind {
    AgentIdle,
    AgentBusy,
    AgentError,
    AgentRecovered,
    ConflictDetected,
    WorkAssigned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorEvent {
    pub kind: CoordinatorEventKind,
    pub pane_id: Option<PaneId>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Event for a state change, if it is one worth announcing
pub fn transition_event(prev: StatusKind, next: StatusKind) -> Option<CoordinatorEventKind> {
    if prev == next {
        return None;
    }
    match (prev, next) {
        (_, StatusKind::Error) => Some(CoordinatorEventKind::AgentError),
        (StatusKind::Error, _) => Some(CoordinatorEventKind::AgentRecovered),
        (_, StatusKind::Idle) => Some(CoordinatorEventKind::AgentIdle),
        (_, StatusKind::Working) => Some(CoordinatorEventKind::AgentBusy),
        _ => None,
    }
}

/// Holder priority from what the agent is doing right now
pub fn holder_priority(snapshots: &[AgentSnapshot], agent_name: &str) -> u8 {
    match snapshots
        .iter()
        .find(|s| s.agent_name.as_deref() == Some(agent_name))
        .map(|s| s.state)
    {
        Some(StatusKind::Working) => 8,
        Some(StatusKind::Compacted) => 6,
        Some(StatusKind::Idle) => 4,
        Some(_) => 2,
        None => 0,
    }
}

pub struct Coordinator {
    session: String,
    project_dir: PathBuf,
    project_key: String,
    mux: Arc<dyn Multiplexer>,
    mail: Arc<dyn AgentMail>,
    tickets: Arc<dyn TicketTool>,
    registry: RegistryStore,
    /// Separate from the dashboard's so velocity memory does not interleave
    detector: StatusDetector,
    config: CoordinatorConfig,
    agents: HashMap<PaneId, AgentState>,
    identity: Option<String>,
    /// Conflict keys already handled; a resolved conflict may fire again later
    handled_conflicts: HashSet<String>,
    snapshots: Vec<AgentSnapshot>,
    conflicts: Vec<Conflict>,
    events: mpsc::Sender<CoordinatorEvent>,
    dropped_events: u64,
    cycles: u64,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: impl Into<String>,
        project_dir: PathBuf,
        project_key: impl Into<String>,
        mux: Arc<dyn Multiplexer>,
        mail: Arc<dyn AgentMail>,
        tickets: Arc<dyn TicketTool>,
        registry: RegistryStore,
        detector: StatusDetector,
        config: CoordinatorConfig,
    ) -> (Self, mpsc::Receiver<CoordinatorEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let coordinator = Self {
            session: session.into(),
            project_dir,
            project_key: project_key.into(),
            mux,
            mail,
            tickets,
            registry,
            detector,
            config,
            agents: HashMap::new(),
            identity: None,
            handled_conflicts: HashSet::new(),
            snapshots: Vec::new(),
            conflicts: Vec::new(),
            events: tx,
            dropped_events: 0,
            cycles: 0,
        };
        (coordinator, rx)
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    pub fn snapshots(&self) -> &[AgentSnapshot] {
        &self.snapshots
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    fn emit(&mut self, kind: CoordinatorEventKind, pane_id: Option<PaneId>, message: String, at: DateTime<Utc>) {
        let event = CoordinatorEvent {
            kind,
            pane_id,
            message,
            at,
        };
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(ev)) => {
                self.dropped_events += 1;
                tracing::debug!(kind = ?ev.kind, dropped = self.dropped_events, "Coordinator event channel full, dropping");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// The coordinator's own Agent Mail name, registering on first use
    pub async fn ensure_identity(&mut self, ctx: &FetchContext) -> Result<String> {
        if let Some(name) = &self.identity {
            return Ok(name.clone());
        }
        let name = enroll::ensure_identity(
            ctx,
            self.mail.as_ref(),
            &self.registry,
            &self.session,
            &self.project_key,
        )
        .await?;
        self.identity = Some(name.clone());
        Ok(name)
    }

    /// One monitor pass: capture, classify, announce transitions
    pub async fn monitor_once(&mut self, ctx: &FetchContext, now: DateTime<Utc>) -> Result<Vec<AgentSnapshot>> {
        let panes = panes::enumerate(ctx, self.mux.as_ref(), &self.session).await?;
        let agent_panes: Vec<_> = panes.iter().filter(|p| p.is_agent()).cloned().collect();

        let live: HashSet<&str> = agent_panes.iter().map(|p| p.id.as_str()).collect();
        let vanished: Vec<PaneId> = self
            .agents
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        for id in vanished {
            self.agents.remove(&id);
            self.detector.forget(&id);
        }

        let targets: Vec<PaneId> = agent_panes.iter().map(|p| p.id.clone()).collect();
        let captured = capture::capture_targets(ctx, self.mux.as_ref(), &agent_panes, &targets, MONITOR_LINES).await;
        if ctx.is_cancelled() {
            return Err(NtmError::Canceled);
        }

        let mut changes = Vec::new();
        for pane in &agent_panes {
            let agent = self
                .agents
                .entry(pane.id.clone())
                .or_insert_with(|| AgentState::new(pane, now));
            agent.observe_pane(pane, now);
            let Some(c) = captured.iter().find(|c| c.pane_id == pane.id) else {
                continue;
            };
            let status = self.detector.analyze_at(
                &pane.id,
                &pane.title,
                pane.agent_type,
                &c.text,
                pane.last_activity,
                now,
            );
            let change = agent.apply_status(&status, now);
            if let Some(kind) = transition_event(change.previous, change.current) {
                changes.push((kind, pane.id.clone(), pane.title.clone(), change.current));
            }
        }
        for (kind, pane_id, title, state) in changes {
            tracing::debug!(pane_id = %pane_id, kind = ?kind, "Agent transition");
            self.emit(kind, Some(pane_id), format!("{title} is now {}", state.as_str()), now);
        }

        let registry = match enroll::enroll_panes(
            ctx,
            self.mail.as_ref(),
            &self.registry,
            &self.session,
            &self.project_key,
            &agent_panes,
            now,
        )
        .await
        {
            Ok(registry) => Some(registry),
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to enroll session agents");
                self.registry
                    .load_registry(&self.session, &self.project_key)
                    .unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "Failed to read session registry");
                        None
                    })
            }
        };
        let mut snapshots: Vec<AgentSnapshot> = self
            .agents
            .values()
            .map(|a| {
                let name = registry
                    .as_ref()
                    .and_then(|r| r.lookup(&a.title, &a.pane_id))
                    .map(str::to_string);
                AgentSnapshot::from_state(a, name, now)
            })
            .collect();
        snapshots.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.pane_id.cmp(&b.pane_id)));
        self.snapshots = snapshots.clone();
        Ok(snapshots)
    }

    /// Detect reservation conflicts and handle new ones per the configured mode
    pub async fn check_conflicts(&mut self, ctx: &FetchContext, now: DateTime<Utc>) -> Result<Vec<ConflictAction>> {
        let reservations = self
            .mail
            .list_file_reservations(ctx, &self.project_key, None, true)
            .await?;
        let snapshots = &self.snapshots;
        let found = conflicts::detect_conflicts(&reservations, now, |name| holder_priority(snapshots, name));

        let identity = self.ensure_identity(ctx).await?;
        let mut actions = Vec::new();
        let mut seen = HashSet::new();
        for conflict in &found {
            let key = conflict.key();
            seen.insert(key.clone());
            if self.handled_conflicts.contains(&key) {
                continue;
            }
            let action = match self.config.conflict_mode {
                ConflictMode::Notify => {
                    let receipt =
                        conflicts::notify_conflict(ctx, self.mail.as_ref(), &self.project_key, &identity, conflict).await?;
                    Some(ConflictAction::Notify {
                        recipients: receipt.recipients,
                    })
                }
                ConflictMode::Negotiate => {
                    conflicts::negotiate_conflict(ctx, self.mail.as_ref(), &self.project_key, &identity, conflict)
                        .await?
                        .map(|target| ConflictAction::Negotiate { target })
                }
            };
            self.handled_conflicts.insert(key);
            self.emit(
                CoordinatorEventKind::ConflictDetected,
                None,
                format!(
                    "{} held by {}",
                    conflict.path_pattern,
                    conflict.holder_names().join(", ")
                ),
                now,
            );
            actions.extend(action);
        }
        self.handled_conflicts.retain(|k| seen.contains(k));
        self.conflicts = found;
        Ok(actions)
    }

    /// User-initiated release of one holder's reservation
    pub async fn force_release(
        &self,
        ctx: &FetchContext,
        holder: &Holder,
        note: &str,
    ) -> Result<ConflictAction> {
        conflicts::force_release(ctx, self.mail.as_ref(), &self.project_key, holder, note, true).await?;
        Ok(ConflictAction::ForceRelease {
            agent: holder.agent_name.clone(),
            reservation_id: holder.reservation_id,
        })
    }

    /// Hand triage recommendations to idle agents
    pub async fn assign_once(&mut self, ctx: &FetchContext, now: DateTime<Utc>) -> Result<AssignReport> {
        if !self.config.auto_assign {
            return Ok(AssignReport::default());
        }
        let snapshots = self.snapshots.clone();
        let idle = assign::select_idle(&snapshots, now, self.config.idle_threshold());
        if idle.is_empty() {
            return Ok(AssignReport::default());
        }
        let triage = self.tickets.triage(ctx, &self.project_dir).await?;
        let identity = self.ensure_identity(ctx).await?;
        let report = assign::auto_assign(ctx, self.mail.as_ref(), &self.project_key, &identity, &idle, &triage).await;
        for a in &report.assigned {
            self.emit(
                CoordinatorEventKind::WorkAssigned,
                Some(a.pane_id.clone()),
                format!("{} assigned {}", a.agent_name, a.ticket_id),
                now,
            );
        }
        Ok(report)
    }

    /// Send the periodic digest; no-op without a recipient
    pub async fn send_digest(&mut self, ctx: &FetchContext, now: DateTime<Utc>) -> Result<bool> {
        let Some(recipient) = self.config.human_recipient.clone() else {
            tracing::debug!("Digest enabled without a human_recipient, skipping");
            return Ok(false);
        };
        let identity = self.ensure_identity(ctx).await?;
        let (subject, body) = digest::compose_digest(&self.session, &self.snapshots, &self.conflicts, now);
        let msg = OutgoingMessage::new(identity, vec![recipient], subject, body).importance(Importance::Normal);
        self.mail.send_message(ctx, &self.project_key, &msg).await?;
        tracing::info!(session = %self.session, "Digest sent");
        Ok(true)
    }

    async fn cycle(&mut self, cancel: &CancellationToken) {
        self.cycles += 1;
        let ctx = FetchContext::with_token(cancel.child_token(), self.config.poll_interval().max(std::time::Duration::from_secs(5)));
        let now = Utc::now();
        if let Err(e) = self.monitor_once(&ctx, now).await {
            if !e.is_canceled() {
                tracing::warn!(error = %e, "Coordinator monitor pass failed");
            }
            return;
        }
        if self.cycles % u64::from(self.config.conflict_every()) == 0 {
            match self.check_conflicts(&ctx, now).await {
                Ok(actions) if !actions.is_empty() => {
                    tracing::info!(actions = actions.len(), "Handled reservation conflicts");
                }
                Ok(_) => {}
                Err(e) if e.is_canceled() => return,
                Err(e) => tracing::warn!(error = %e, "Conflict check failed"),
            }
        }
        match self.assign_once(&ctx, now).await {
            Ok(report) if !report.failed.is_empty() => {
                tracing::warn!(failed = report.failed.len(), "Some assignments were not delivered");
            }
            Ok(_) => {}
            Err(e) if e.is_canceled() => {}
            Err(e) => tracing::warn!(error = %e, "Auto-assign failed"),
        }
    }

    /// Run until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let digest_every = self.config.digest_interval();
        let mut digest = tokio::time::interval_at(tokio::time::Instant::now() + digest_every, digest_every);
        digest.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            session = %self.session,
            poll_ms = self.config.poll_interval().as_millis() as u64,
            digest = self.config.digest_enabled,
            "Coordinator started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = poll.tick() => self.cycle(&cancel).await,
                _ = digest.tick(), if self.config.digest_enabled => {
                    let ctx = FetchContext::with_token(cancel.child_token(), std::time::Duration::from_secs(10));
                    if let Err(e) = self.send_digest(&ctx, Utc::now()).await {
                        tracing::warn!(error = %e, "Digest failed");
                    }
                }
            }
        }
        tracing::info!(dropped_events = self.dropped_events, "Coordinator stopped");
    }
}
