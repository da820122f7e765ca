//! Refresh orchestrator
//!
//! One ticker drives every data source. Each tick asks [`RefreshOrchestrator::due`]
//! which sources should fetch, snapshots the store into a [`FetchInput`], and
//! spawns one task per fetch. Tasks report back as [`Completion`] events on the
//! same channel as keys, so the store only ever changes on the update loop.
//!
//! Key patterns:
//! - Per-source state machine with a generation counter ([`source`])
//! - Fetches never touch the store; they get a snapshot and return a [`Payload`]
//! - Only the session completion changes the pane map

pub mod source;

pub use source::{SourceId, SourceState, Ticket, Verdict, MIN_INTERVAL, SPAWN_ACTIVE_INTERVAL};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::mpsc;

use crate::beads::{BeadsSummary, TicketTool};
use crate::capture::{self, CaptureInputs, CapturedPane};
use crate::context::FetchContext;
use crate::coordination::conflicts::detect_conflicts;
use crate::errors::{ErrorKind, NtmError, Result};
use crate::event::Event;
use crate::mail::{enroll, AgentMail, InboxSummary, MailStatus, RegistryStore};
use crate::panes::{self, Pane, PaneId};
use crate::sources::{
    self, compute_alerts, compute_metrics, routing, Alert, AlertContext, CheckpointStatus,
    HandoffStatus, HistoryEntry, MetricsSnapshot, RoutingScore, SpawnState,
};
use crate::state::{AgentSnapshot, DashboardState, MigrationReport, StatusPass, StatusSample};
use crate::status::{AgentStatus, StatusDetector};
use crate::tmux::Multiplexer;
use crate::tools::{CassContext, DcgStatus, FileChange, ProjectTools, ScanReport};

/// Messages fetched per agent for the inbox panel
const INBOX_LIMIT: usize = 20;

/// Data returned by one successful fetch
#[derive(Debug)]
pub enum Payload {
    Session {
        panes: Vec<Pane>,
        captured: Vec<CapturedPane>,
        next_cursor: usize,
        statuses: Vec<AgentStatus>,
    },
    Status(Vec<AgentStatus>),
    Alerts(Vec<Alert>),
    Beads(BeadsSummary),
    Metrics(MetricsSnapshot),
    Routing(Vec<RoutingScore>),
    History(Vec<HistoryEntry>),
    FileChanges(Vec<FileChange>),
    Cass(CassContext),
    CodeScan(ScanReport),
    Dcg(DcgStatus),
    Checkpoint(CheckpointStatus),
    Handoff(HandoffStatus),
    MailStatus(MailStatus),
    MailInbox {
        summaries: Vec<InboxSummary>,
        names: HashMap<PaneId, String>,
    },
    Spawn(Option<SpawnState>),
}

/// A finished fetch, tagged with the generation it was dispatched under
#[derive(Debug)]
pub struct Completion {
    pub source: SourceId,
    pub generation: u64,
    pub result: Result<Payload>,
    pub finished_at: DateTime<Utc>,
}

/// Store snapshot a fetch reads from
#[derive(Debug, Clone, Default)]
pub struct FetchInput {
    pub panes: Vec<Pane>,
    pub capture: Option<CaptureInputs>,
    pub samples: Vec<StatusSample>,
    pub snapshots: Vec<AgentSnapshot>,
    pub alert_ctx: AlertContext,
}

impl FetchInput {
    /// Take only what `source` needs
    pub fn for_source(source: SourceId, state: &DashboardState, now: DateTime<Utc>) -> Self {
        match source {
            SourceId::Session => Self {
                capture: Some(state.capture.inputs(state.selected.clone())),
                ..Self::default()
            },
            SourceId::Status => Self {
                samples: state.status_samples(),
                ..Self::default()
            },
            SourceId::Alerts => Self {
                snapshots: state.snapshots(now),
                alert_ctx: AlertContext {
                    conflicts: state
                        .panels
                        .mail_status
                        .data
                        .as_ref()
                        .map_or(0, |m| m.conflicts),
                    mail_down: !state.panels.mail_status.unavailable
                        && state.panels.mail_status.has_error(),
                    rotating: state.rotating(),
                },
                ..Self::default()
            },
            SourceId::Metrics | SourceId::Routing => Self {
                snapshots: state.snapshots(now),
                ..Self::default()
            },
            SourceId::MailInbox => Self {
                panes: state.panes.clone(),
                ..Self::default()
            },
            _ => Self::default(),
        }
    }
}

/// Everything a fetch may call out to
pub struct Collaborators {
    pub session: String,
    pub project_dir: PathBuf,
    pub project_key: String,
    pub mux: Arc<dyn Multiplexer>,
    pub detector: Arc<StatusDetector>,
    pub tickets: Arc<dyn TicketTool>,
    pub tools: Arc<dyn ProjectTools>,
    pub mail: Option<Arc<dyn AgentMail>>,
    pub registry: RegistryStore,
    pub history_path: PathBuf,
    pub cass_query: String,
    pub beads_limit: usize,
}

impl Collaborators {
    fn mail(&self) -> Result<&Arc<dyn AgentMail>> {
        self.mail
            .as_ref()
            .ok_or_else(|| NtmError::unavailable("agent mail"))
    }
}

/// Run one fetch to completion under `ctx`
pub async fn run_fetch(
    source: SourceId,
    ctx: &FetchContext,
    collab: &Collaborators,
    input: FetchInput,
) -> Result<Payload> {
    let now = Utc::now();
    let dir = collab.project_dir.as_path();
    match source {
        SourceId::Session => {
            let panes = panes::enumerate(ctx, collab.mux.as_ref(), &collab.session).await?;
            let inputs = input
                .capture
                .ok_or_else(|| NtmError::Validation("session fetch without capture inputs".into()))?;
            let plan = capture::plan(
                &panes,
                inputs.selected.as_deref(),
                &inputs.last_captured,
                inputs.budget,
                inputs.cursor,
            );
            let captured = capture::capture_targets(
                ctx,
                collab.mux.as_ref(),
                &panes,
                &plan.targets,
                inputs.max_lines,
            )
            .await;
            if ctx.is_cancelled() {
                return Err(NtmError::Canceled);
            }
            let statuses = captured
                .iter()
                .filter_map(|c| {
                    let pane = panes.iter().find(|p| p.id == c.pane_id && p.is_agent())?;
                    Some(
                        collab
                            .detector
                            .analyze(&pane.id, &pane.title, pane.agent_type, &c.text, pane.last_activity)
                            .captured(c.captured_at),
                    )
                })
                .collect();
            Ok(Payload::Session {
                panes,
                captured,
                next_cursor: plan.next_cursor,
                statuses,
            })
        }
        SourceId::Status => {
            let mut statuses = Vec::with_capacity(input.samples.len());
            for s in &input.samples {
                if ctx.is_cancelled() {
                    return Err(NtmError::Canceled);
                }
                let status = collab
                    .detector
                    .reclassify(&s.pane_id, &s.title, s.agent_type, &s.text, s.last_activity, now)
                    .captured(s.captured_at);
                statuses.push(status);
                tokio::task::yield_now().await;
            }
            Ok(Payload::Status(statuses))
        }
        SourceId::Alerts => Ok(Payload::Alerts(compute_alerts(
            &input.snapshots,
            &input.alert_ctx,
            now,
        ))),
        SourceId::Metrics => Ok(Payload::Metrics(compute_metrics(&input.snapshots, now))),
        SourceId::Routing => Ok(Payload::Routing(routing::compute(&input.snapshots))),
        SourceId::Beads => {
            let (summary, drift) = tokio::join!(
                collab.tickets.beads_summary(ctx, dir, collab.beads_limit),
                collab.tickets.check_drift(ctx, dir),
            );
            let mut summary = summary?;
            summary.drift = match drift {
                Ok(report) => Some(report),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    tracing::debug!(error = %e, "Drift check failed");
                    None
                }
            };
            Ok(Payload::Beads(summary))
        }
        SourceId::History => ctx
            .run(
                "history",
                sources::load_history(&collab.history_path, &collab.session, sources::history::DEFAULT_LIMIT),
            )
            .await
            .map(Payload::History),
        SourceId::FileChanges => collab.tools.file_changes(ctx, dir).await.map(Payload::FileChanges),
        SourceId::Cass => collab
            .tools
            .cass_context(ctx, dir, &collab.cass_query)
            .await
            .map(Payload::Cass),
        SourceId::CodeScan => collab.tools.code_scan(ctx, dir).await.map(Payload::CodeScan),
        SourceId::Dcg => collab.tools.dcg_status(ctx).await.map(Payload::Dcg),
        SourceId::Checkpoint => ctx
            .run("checkpoints", sources::load_checkpoints(dir, &collab.session))
            .await
            .map(Payload::Checkpoint),
        SourceId::Handoff => ctx
            .run("handoffs", sources::load_handoffs(dir))
            .await
            .map(Payload::Handoff),
        SourceId::Spawn => ctx
            .run("spawn_state", sources::load_spawn_state(dir))
            .await
            .map(Payload::Spawn),
        SourceId::MailStatus => {
            let mail = collab.mail()?;
            mail.health_check(ctx).await?;
            let reservations = mail
                .list_file_reservations(ctx, &collab.project_key, None, true)
                .await?;
            let conflicts = detect_conflicts(&reservations, now, |_| 0).len();
            Ok(Payload::MailStatus(MailStatus {
                connected: true,
                reservations,
                conflicts,
            }))
        }
        SourceId::MailInbox => {
            let mail = collab.mail()?;
            let registry = enroll::enroll_panes(
                ctx,
                mail.as_ref(),
                &collab.registry,
                &collab.session,
                &collab.project_key,
                &input.panes,
                now,
            )
            .await?;
            let names: HashMap<PaneId, String> = input
                .panes
                .iter()
                .filter_map(|p| registry.lookup(&p.title, &p.id).map(|n| (p.id.clone(), n.to_string())))
                .collect();

            let agents = registry.names();
            let fetches = agents.keys().map(|name| {
                mail.fetch_inbox(ctx, &collab.project_key, name, INBOX_LIMIT, false)
            });
            let results = join_all(fetches).await;

            let mut summaries = Vec::with_capacity(agents.len());
            let mut first_err = None;
            for ((name, pane_id), result) in agents.iter().zip(results) {
                match result {
                    Ok(messages) => summaries.push(InboxSummary::from_messages(
                        name,
                        pane_id.map(str::to_string),
                        &messages,
                    )),
                    Err(e) if e.is_canceled() => return Err(e),
                    Err(e) => {
                        tracing::debug!(agent = %name, error = %e, "Inbox fetch failed");
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }
            // One unreachable inbox should not blank the panel
            if summaries.is_empty() {
                if let Some(e) = first_err {
                    return Err(e);
                }
            }
            Ok(Payload::MailInbox { summaries, names })
        }
    }
}

/// Spawn a fetch task that reports its [`Completion`] on `tx`
pub fn spawn_job(
    source: SourceId,
    ticket: Ticket,
    collab: Arc<Collaborators>,
    input: FetchInput,
    tx: mpsc::Sender<Event>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctx = FetchContext::with_token(ticket.cancel, source.timeout());
        let started = Instant::now();
        let result = run_fetch(source, &ctx, &collab, input).await;
        match &result {
            Ok(_) => tracing::trace!(source = %source, generation = ticket.generation, elapsed_ms = started.elapsed().as_millis() as u64, "Fetch finished"),
            Err(e) if e.is_canceled() => tracing::debug!(source = %source, generation = ticket.generation, "Fetch canceled"),
            Err(e) => tracing::debug!(source = %source, generation = ticket.generation, error = %e, "Fetch failed"),
        }
        let completion = Completion {
            source,
            generation: ticket.generation,
            result,
            finished_at: Utc::now(),
        };
        if tx.send(Event::Completion(Box::new(completion))).await.is_err() {
            tracing::debug!(source = %source, "Update loop gone, dropping completion");
        }
    })
}

/// What applying a completion changed, for follow-up actions
#[derive(Debug, Default)]
pub struct Applied {
    pub migration: MigrationReport,
    pub status: StatusPass,
}

/// Write a completion into the store
pub fn apply_completion(
    state: &mut DashboardState,
    source: SourceId,
    result: Result<Payload>,
    now: DateTime<Utc>,
) -> Applied {
    let mut applied = Applied::default();
    let payload = match result {
        Ok(p) => p,
        Err(err) => {
            if source == SourceId::Session {
                applied.migration = state.fail_session(err, now);
            } else {
                fail_panel(state, source, err);
            }
            state.recompute_counters(now);
            return applied;
        }
    };

    match payload {
        Payload::Session {
            panes,
            captured,
            next_cursor,
            statuses,
        } => {
            let (migration, status) = state.apply_session(panes, captured, next_cursor, &statuses, now);
            applied.migration = migration;
            applied.status = status;
        }
        Payload::Status(statuses) => {
            applied.status = state.apply_statuses(&statuses, now);
            state.panels.status.set((), now);
        }
        Payload::Alerts(v) => state.panels.alerts.set(v, now),
        Payload::Beads(v) => state.panels.beads.set(v, now),
        Payload::Metrics(v) => state.panels.metrics.set(v, now),
        Payload::Routing(v) => state.panels.routing.set(v, now),
        Payload::History(v) => state.panels.history.set(v, now),
        Payload::FileChanges(v) => state.panels.file_changes.set(v, now),
        Payload::Cass(v) => state.panels.cass.set(v, now),
        Payload::CodeScan(v) => state.panels.code_scan.set(v, now),
        Payload::Dcg(v) => state.panels.dcg.set(v, now),
        Payload::Checkpoint(v) => state.panels.checkpoint.set(v, now),
        Payload::Handoff(v) => state.panels.handoff.set(v, now),
        Payload::MailStatus(v) => state.panels.mail_status.set(v, now),
        Payload::MailInbox { summaries, names } => {
            state.panels.mail_inbox.set(summaries, now);
            let live: HashSet<&str> = state.panes.iter().map(|p| p.id.as_str()).collect();
            state.agent_names = names
                .into_iter()
                .filter(|(id, _)| live.contains(id.as_str()))
                .collect();
        }
        Payload::Spawn(v) => state.panels.spawn.set(v, now),
    }
    state.recompute_counters(now);
    applied
}

fn fail_panel(state: &mut DashboardState, source: SourceId, err: NtmError) {
    let p = &mut state.panels;
    match source {
        SourceId::Session => {}
        SourceId::Status => p.status.fail(err),
        SourceId::Alerts => p.alerts.fail(err),
        SourceId::Beads => p.beads.fail(err),
        SourceId::Metrics => p.metrics.fail(err),
        SourceId::Routing => p.routing.fail(err),
        SourceId::History => p.history.fail(err),
        SourceId::FileChanges => p.file_changes.fail(err),
        SourceId::Cass => p.cass.fail(err),
        SourceId::CodeScan => p.code_scan.fail(err),
        SourceId::Dcg => p.dcg.fail(err),
        SourceId::Checkpoint => p.checkpoint.fail(err),
        SourceId::Handoff => p.handoff.fail(err),
        SourceId::MailStatus => p.mail_status.fail(err),
        SourceId::MailInbox => p.mail_inbox.fail(err),
        SourceId::Spawn => p.spawn.fail(err),
    }
}

/// Scheduling state for every source
#[derive(Debug)]
pub struct RefreshOrchestrator {
    sources: BTreeMap<SourceId, SourceState>,
    disabled: HashSet<SourceId>,
    suspended: bool,
    spawn_active: bool,
}

impl RefreshOrchestrator {
    /// `intervals` overrides the default cadence per source
    pub fn new(intervals: &HashMap<SourceId, Duration>) -> Self {
        let sources = SourceId::ALL
            .iter()
            .map(|&id| {
                let interval = intervals
                    .get(&id)
                    .copied()
                    .unwrap_or_else(|| id.default_interval());
                (id, SourceState::new(id, interval))
            })
            .collect();
        Self {
            sources,
            disabled: HashSet::new(),
            suspended: false,
            spawn_active: false,
        }
    }

    /// Never dispatch `id` (e.g. mail sources when mail is not configured)
    pub fn disable(&mut self, id: SourceId) {
        self.disabled.insert(id);
    }

    pub fn source(&self, id: SourceId) -> Option<&SourceState> {
        self.sources.get(&id)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        if self.suspended != suspended {
            tracing::debug!(suspended, "Dashboard suspension changed");
        }
        self.suspended = suspended;
    }

    /// Effective cadence; spawn polls faster while a batch is running
    pub fn interval(&self, id: SourceId) -> Duration {
        let configured = self
            .sources
            .get(&id)
            .map_or_else(|| id.default_interval(), |s| s.interval);
        if id == SourceId::Spawn && self.spawn_active {
            configured.min(SPAWN_ACTIVE_INTERVAL)
        } else {
            configured
        }
    }

    /// Begin every source that is due, returning one ticket each
    pub fn due(&mut self, now: Instant) -> Vec<(SourceId, Ticket)> {
        let mut out = Vec::new();
        let ids: Vec<SourceId> = self.sources.keys().copied().collect();
        for id in ids {
            if self.disabled.contains(&id) {
                continue;
            }
            let interval = self.interval(id);
            let suspended = self.suspended;
            if let Some(state) = self.sources.get_mut(&id) {
                if state.is_due(now, interval, suspended) {
                    out.push((id, state.begin(now)));
                }
            }
        }
        out
    }

    /// User-requested refresh; `None` means every source
    pub fn request_refresh(&mut self, id: Option<SourceId>, cancel_in_flight: bool) {
        for (sid, state) in &mut self.sources {
            if id.map_or(true, |want| want == *sid) {
                state.request(cancel_in_flight);
            }
        }
    }

    /// Settle a completion against its source and decide whether to apply it
    pub fn settle(&mut self, completion: &Completion, now: Instant) -> Verdict {
        let Some(state) = self.sources.get_mut(&completion.source) else {
            return Verdict::Stale;
        };
        let canceled = matches!(&completion.result, Err(e) if e.is_canceled());
        let verdict = state.complete(completion.generation, canceled, now);
        match verdict {
            Verdict::Stale => {
                tracing::trace!(source = %completion.source, generation = completion.generation, "Dropping stale completion");
            }
            Verdict::Canceled => {}
            Verdict::Apply => match &completion.result {
                Err(e) if e.kind() == ErrorKind::Unauthorized => {
                    tracing::warn!(source = %completion.source, error = %e, "Unauthorized, pausing source until refreshed");
                    state.block();
                }
                Ok(Payload::Spawn(spawn)) => {
                    self.spawn_active = spawn.as_ref().is_some_and(SpawnState::is_active);
                }
                _ => {}
            },
        }
        verdict
    }

    /// Cancel everything in flight (shutdown)
    pub fn cancel_all(&mut self) {
        for state in self.sources.values_mut() {
            state.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::DriftStatus;
    use crate::capture::CaptureScheduler;
    use crate::coordination::conflicts::tests::RecordingMail;
    use crate::mail::{FallbackMode, Importance, InboxMessage};
    use crate::status::StatusKind;
    use crate::state::Timeline;
    use crate::tmux::fake::{raw, FakeMux};
    use crate::tools::CassHit;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoTickets;

    #[async_trait]
    impl TicketTool for NoTickets {
        async fn beads_summary(&self, _ctx: &FetchContext, _dir: &Path, _limit: usize) -> Result<BeadsSummary> {
            Err(NtmError::unavailable("bv"))
        }
        async fn triage(&self, _ctx: &FetchContext, _dir: &Path) -> Result<crate::beads::Triage> {
            Err(NtmError::unavailable("bv"))
        }
        async fn check_drift(&self, _ctx: &FetchContext, _dir: &Path) -> Result<crate::beads::DriftReport> {
            Err(NtmError::unavailable("bv"))
        }
    }

    /// Code scan blocks until canceled
    #[derive(Default)]
    struct SlowTools {
        scans: AtomicUsize,
    }

    #[async_trait]
    impl ProjectTools for SlowTools {
        async fn code_scan(&self, ctx: &FetchContext, _dir: &Path) -> Result<ScanReport> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            ctx.run("ubs", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ScanReport::default())
            })
            .await
        }
        async fn cass_context(&self, _ctx: &FetchContext, _dir: &Path, query: &str) -> Result<CassContext> {
            Ok(CassContext {
                query: query.to_string(),
                hits: vec![CassHit {
                    title: "prior session".into(),
                    snippet: String::new(),
                    score: 1.0,
                    source_path: None,
                }],
            })
        }
        async fn dcg_status(&self, _ctx: &FetchContext) -> Result<DcgStatus> {
            Err(NtmError::unavailable("dcg"))
        }
        async fn file_changes(&self, _ctx: &FetchContext, _dir: &Path) -> Result<Vec<FileChange>> {
            Ok(Vec::new())
        }
    }

    fn collaborators(mux: Arc<FakeMux>, tools: Arc<SlowTools>, dir: &Path) -> Arc<Collaborators> {
        Arc::new(Collaborators {
            session: "proj".into(),
            project_dir: dir.to_path_buf(),
            project_key: dir.display().to_string(),
            mux,
            detector: Arc::new(StatusDetector::default()),
            tickets: Arc::new(NoTickets),
            tools,
            mail: None,
            registry: RegistryStore::new(dir.join("sessions"), FallbackMode::Strict),
            history_path: dir.join("history.jsonl"),
            cass_query: "proj".into(),
            beads_limit: 5,
        })
    }

    fn collaborators_with_mail(
        mux: Arc<FakeMux>,
        mail: Arc<RecordingMail>,
        tickets: Arc<dyn TicketTool>,
        dir: &Path,
    ) -> Arc<Collaborators> {
        let mail: Arc<dyn AgentMail> = mail;
        Arc::new(Collaborators {
            session: "proj".into(),
            project_dir: dir.to_path_buf(),
            project_key: dir.display().to_string(),
            mux,
            detector: Arc::new(StatusDetector::default()),
            tickets,
            tools: Arc::new(SlowTools::default()),
            mail: Some(mail),
            registry: RegistryStore::new(dir.join("sessions"), FallbackMode::Strict),
            history_path: dir.join("history.jsonl"),
            cass_query: "proj".into(),
            beads_limit: 5,
        })
    }

    fn store() -> DashboardState {
        DashboardState::new("proj", CaptureScheduler::default(), Timeline::default())
    }

    fn session_payload(ids: &[&str]) -> Payload {
        let panes = ids
            .iter()
            .enumerate()
            .map(|(i, id)| Pane::from_raw(raw(id, i as u32, &format!("proj__cc_{}", i + 1), "node")))
            .collect();
        Payload::Session {
            panes,
            captured: Vec::new(),
            next_cursor: 0,
            statuses: Vec::new(),
        }
    }

    #[test]
    fn test_stale_completion_dropped() {
        let mut orch = RefreshOrchestrator::new(&HashMap::new());
        let mut state = store();
        let t0 = Instant::now();

        let first = orch.due(t0);
        let (_, old) = first.iter().find(|(id, _)| *id == SourceId::Session).cloned().unwrap();
        orch.request_refresh(Some(SourceId::Session), true);
        assert!(old.cancel.is_cancelled());
        let (_, new) = orch
            .due(t0)
            .into_iter()
            .find(|(id, _)| *id == SourceId::Session)
            .unwrap();
        assert_eq!(new.generation, old.generation + 1);

        // Newer fetch lands first
        let newer = Completion {
            source: SourceId::Session,
            generation: new.generation,
            result: Ok(session_payload(&["%1", "%2"])),
            finished_at: Utc::now(),
        };
        assert_eq!(orch.settle(&newer, t0), Verdict::Apply);
        apply_completion(&mut state, newer.source, newer.result, Utc::now());

        // The superseded one arrives late with different panes
        let older = Completion {
            source: SourceId::Session,
            generation: old.generation,
            result: Ok(session_payload(&["%9"])),
            finished_at: Utc::now(),
        };
        assert_eq!(orch.settle(&older, t0), Verdict::Stale);

        let ids: Vec<&str> = state.panes.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["%1", "%2"]);
    }

    #[test]
    fn test_older_completion_arriving_first_is_dropped() {
        let mut orch = RefreshOrchestrator::new(&HashMap::new());
        let mut state = store();
        let t0 = Instant::now();

        let (_, old) = orch
            .due(t0)
            .into_iter()
            .find(|(id, _)| *id == SourceId::Session)
            .unwrap();
        orch.request_refresh(Some(SourceId::Session), true);
        let (_, new) = orch
            .due(t0)
            .into_iter()
            .find(|(id, _)| *id == SourceId::Session)
            .unwrap();

        // Superseded fetch lands first and must not touch the store
        let older = Completion {
            source: SourceId::Session,
            generation: old.generation,
            result: Ok(session_payload(&["%9"])),
            finished_at: Utc::now(),
        };
        assert_eq!(orch.settle(&older, t0), Verdict::Stale);
        assert!(orch.source(SourceId::Session).unwrap().in_flight());
        assert!(state.panes.is_empty());

        let newer = Completion {
            source: SourceId::Session,
            generation: new.generation,
            result: Ok(session_payload(&["%1", "%2"])),
            finished_at: Utc::now(),
        };
        assert_eq!(orch.settle(&newer, t0), Verdict::Apply);
        apply_completion(&mut state, newer.source, newer.result, Utc::now());
        let ids: Vec<&str> = state.panes.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["%1", "%2"]);
        assert!(!orch.source(SourceId::Session).unwrap().in_flight());
    }

    #[tokio::test]
    async fn test_late_status_completion_keeps_newer_capture() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(FakeMux::with_panes(vec![raw("%1", 0, "proj__cc_1", "node")]));
        mux.set_text("%1", "API Error: status 429\n");
        let collab = collaborators(mux.clone(), Arc::new(SlowTools::default()), dir.path());
        let mut state = store();
        let ctx = FetchContext::new(Duration::from_secs(5));

        let input = FetchInput::for_source(SourceId::Session, &state, Utc::now());
        let payload = run_fetch(SourceId::Session, &ctx, &collab, input).await.unwrap();
        apply_completion(&mut state, SourceId::Session, Ok(payload), Utc::now());
        assert_eq!(state.agents["%1"].raw_state, StatusKind::RateLimited);

        // Status fetch snapshots the rate-limited capture, then stalls
        let stale_input = FetchInput::for_source(SourceId::Status, &state, Utc::now());

        tokio::time::sleep(Duration::from_millis(5)).await;
        mux.set_text("%1", "Done.\n\n> \n? for shortcuts");
        let input = FetchInput::for_source(SourceId::Session, &state, Utc::now());
        let payload = run_fetch(SourceId::Session, &ctx, &collab, input).await.unwrap();
        apply_completion(&mut state, SourceId::Session, Ok(payload), Utc::now());
        assert_eq!(state.agents["%1"].raw_state, StatusKind::Idle);
        let velocity = state.agents["%1"].token_velocity;

        let late = run_fetch(SourceId::Status, &ctx, &collab, stale_input).await;
        let applied = apply_completion(&mut state, SourceId::Status, late, Utc::now());
        assert!(applied.status.transitions.is_empty());
        assert_eq!(state.agents["%1"].raw_state, StatusKind::Idle);
        assert_eq!(state.agents["%1"].token_velocity, velocity);

        // A Status pass over the current capture still applies
        let input = FetchInput::for_source(SourceId::Status, &state, Utc::now());
        let current = run_fetch(SourceId::Status, &ctx, &collab, input).await;
        apply_completion(&mut state, SourceId::Status, current, Utc::now());
        assert_eq!(state.agents["%1"].raw_state, StatusKind::Idle);
        assert!(state.panels.status.last_updated_at.is_some());
    }

    fn message(id: i64, subject: &str) -> InboxMessage {
        InboxMessage {
            id,
            subject: subject.into(),
            from: "Coordinator".into(),
            created_at: Utc::now(),
            importance: Importance::Urgent,
            ack_required: true,
            read: false,
            body_md: None,
        }
    }

    #[tokio::test]
    async fn test_inbox_enrolls_panes_and_keeps_reachable_inboxes() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(FakeMux::with_panes(vec![
            raw("%1", 0, "proj__cc_1", "node"),
            raw("%2", 1, "proj__cc_2", "node"),
        ]));
        let mail = Arc::new(RecordingMail::default());
        mail.inbox.lock().unwrap().push(message(5, "Rebase onto main"));
        mail.fail_inbox_for.lock().unwrap().push("Agent-cc-2".into());
        let collab = collaborators_with_mail(mux, mail.clone(), Arc::new(NoTickets), dir.path());
        let ctx = FetchContext::new(SourceId::MailInbox.timeout());

        let mut state = store();
        let input = FetchInput::for_source(SourceId::Session, &state, Utc::now());
        let payload = run_fetch(SourceId::Session, &ctx, &collab, input).await.unwrap();
        apply_completion(&mut state, SourceId::Session, Ok(payload), Utc::now());

        let input = FetchInput::for_source(SourceId::MailInbox, &state, Utc::now());
        let payload = run_fetch(SourceId::MailInbox, &ctx, &collab, input).await.unwrap();
        apply_completion(&mut state, SourceId::MailInbox, Ok(payload), Utc::now());

        assert_eq!(mail.registered.lock().unwrap().len(), 2);
        let registry = collab
            .registry
            .load_registry("proj", &collab.project_key)
            .unwrap()
            .unwrap();
        assert_eq!(registry.lookup("proj__cc_2", "%2"), Some("Agent-cc-2"));

        assert_eq!(state.agent_names.get("%1").map(String::as_str), Some("Agent-cc-1"));
        assert_eq!(state.agent_names.get("%2").map(String::as_str), Some("Agent-cc-2"));
        let inbox = state.panels.mail_inbox.data.as_ref().unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].agent_name, "Agent-cc-1");
        assert_eq!(inbox[0].pending_acks, vec![5]);
        assert_eq!(state.counters.mail_urgent, 1);
    }

    #[tokio::test]
    async fn test_inbox_fails_only_when_every_agent_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(FakeMux::with_panes(vec![raw("%1", 0, "proj__cc_1", "node")]));
        let mail = Arc::new(RecordingMail::default());
        mail.fail_inbox_for.lock().unwrap().push("Agent-cc-1".into());
        let collab = collaborators_with_mail(mux, mail, Arc::new(NoTickets), dir.path());
        let ctx = FetchContext::new(SourceId::MailInbox.timeout());
        let input = FetchInput {
            panes: vec![Pane::from_raw(raw("%1", 0, "proj__cc_1", "node"))],
            ..FetchInput::default()
        };
        let err = run_fetch(SourceId::MailInbox, &ctx, &collab, input).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    struct DriftingTickets;

    #[async_trait]
    impl TicketTool for DriftingTickets {
        async fn beads_summary(&self, _ctx: &FetchContext, _dir: &Path, _limit: usize) -> Result<BeadsSummary> {
            Ok(BeadsSummary {
                available: true,
                ..BeadsSummary::default()
            })
        }
        async fn triage(&self, _ctx: &FetchContext, _dir: &Path) -> Result<crate::beads::Triage> {
            Err(NtmError::unavailable("bv"))
        }
        async fn check_drift(&self, _ctx: &FetchContext, _dir: &Path) -> Result<crate::beads::DriftReport> {
            Ok(crate::beads::DriftReport {
                status: DriftStatus::Warning,
                message: "3 beads changed since baseline".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_beads_fetch_carries_drift() {
        let dir = tempfile::tempdir().unwrap();
        let mail = Arc::new(RecordingMail::default());
        let collab = collaborators_with_mail(
            Arc::new(FakeMux::default()),
            mail,
            Arc::new(DriftingTickets),
            dir.path(),
        );
        let ctx = FetchContext::new(SourceId::Beads.timeout());
        let Payload::Beads(summary) = run_fetch(SourceId::Beads, &ctx, &collab, FetchInput::default())
            .await
            .unwrap()
        else {
            panic!("expected beads payload");
        };
        assert_eq!(summary.drift.unwrap().status, DriftStatus::Warning);
    }

    #[tokio::test]
    async fn test_cancel_code_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(FakeMux::with_panes(vec![raw("%1", 0, "proj__cc_1", "node")]));
        let tools = Arc::new(SlowTools::default());
        let collab = collaborators(mux, tools.clone(), dir.path());
        let (tx, mut rx) = mpsc::channel(16);
        let mut orch = RefreshOrchestrator::new(&HashMap::new());
        let mut state = store();
        let t0 = Instant::now();

        let ticket = orch
            .due(t0)
            .into_iter()
            .find(|(id, _)| *id == SourceId::CodeScan)
            .map(|(_, t)| t)
            .unwrap();
        let handle = spawn_job(SourceId::CodeScan, ticket.clone(), collab, FetchInput::default(), tx);

        // Wait for the scan to start, then cancel it
        while tools.scans.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        orch.request_refresh(Some(SourceId::CodeScan), true);
        handle.await.unwrap();

        let Some(Event::Completion(done)) = rx.recv().await else {
            panic!("expected a completion");
        };
        assert!(matches!(done.result, Err(NtmError::Canceled)));
        assert_ne!(orch.settle(&done, t0), Verdict::Apply);
        assert!(state.panels.code_scan.error.is_none());
        assert!(state.panels.code_scan.last_updated_at.is_none());
        assert!(orch.source(SourceId::CodeScan).unwrap().last_fetched_at.is_none());

        // Re-dispatched right away under a newer generation
        let again: Vec<_> = orch.due(t0).into_iter().filter(|(id, _)| *id == SourceId::CodeScan).collect();
        assert_eq!(again.len(), 1);
        assert!(again[0].1.generation > ticket.generation);

        // The canceled completion, had it been applied, would also be silent
        apply_completion(&mut state, SourceId::Alerts, Err(NtmError::Canceled), Utc::now());
        assert!(state.panels.alerts.error.is_none());
    }

    #[test]
    fn test_unauthorized_blocks_until_request() {
        let mut orch = RefreshOrchestrator::new(&HashMap::new());
        let t0 = Instant::now();
        let (_, ticket) = orch
            .due(t0)
            .into_iter()
            .find(|(id, _)| *id == SourceId::MailStatus)
            .unwrap();
        let done = Completion {
            source: SourceId::MailStatus,
            generation: ticket.generation,
            result: Err(NtmError::Unauthorized {
                op: "health_check".into(),
                status: Some(401),
            }),
            finished_at: Utc::now(),
        };
        assert_eq!(orch.settle(&done, t0), Verdict::Apply);
        let later = t0 + Duration::from_secs(3600);
        assert!(!orch.due(later).iter().any(|(id, _)| *id == SourceId::MailStatus));
        orch.request_refresh(Some(SourceId::MailStatus), false);
        assert!(orch.due(later).iter().any(|(id, _)| *id == SourceId::MailStatus));
    }

    #[test]
    fn test_suspension_pauses_most_sources() {
        let mut orch = RefreshOrchestrator::new(&HashMap::new());
        orch.set_suspended(true);
        let due: Vec<SourceId> = orch.due(Instant::now()).into_iter().map(|(id, _)| id).collect();
        assert_eq!(due, vec![SourceId::History, SourceId::FileChanges]);
    }

    #[test]
    fn test_disabled_source_never_dispatched() {
        let mut orch = RefreshOrchestrator::new(&HashMap::new());
        orch.disable(SourceId::MailInbox);
        assert!(!orch.due(Instant::now()).iter().any(|(id, _)| *id == SourceId::MailInbox));
    }

    #[test]
    fn test_spawn_interval_adapts() {
        let mut orch = RefreshOrchestrator::new(&HashMap::new());
        assert_eq!(orch.interval(SourceId::Spawn), Duration::from_secs(2));
        let t0 = Instant::now();
        let (_, ticket) = orch
            .due(t0)
            .into_iter()
            .find(|(id, _)| *id == SourceId::Spawn)
            .unwrap();
        let active = SpawnState {
            batch_id: "b1".into(),
            started_at: Utc::now(),
            stagger_secs: 30,
            prompts: vec![crate::sources::spawn::SpawnPrompt {
                pane: "%1".into(),
                order: 0,
                scheduled_at: Utc::now(),
                sent: false,
            }],
            completed_at: None,
        };
        let done = Completion {
            source: SourceId::Spawn,
            generation: ticket.generation,
            result: Ok(Payload::Spawn(Some(active))),
            finished_at: Utc::now(),
        };
        orch.settle(&done, t0);
        assert_eq!(orch.interval(SourceId::Spawn), SPAWN_ACTIVE_INTERVAL);
    }

    #[test]
    fn test_configured_interval_respected_and_floored() {
        let mut intervals = HashMap::new();
        intervals.insert(SourceId::Beads, Duration::from_millis(10));
        intervals.insert(SourceId::Alerts, Duration::from_secs(7));
        let orch = RefreshOrchestrator::new(&intervals);
        assert_eq!(orch.interval(SourceId::Beads), MIN_INTERVAL);
        assert_eq!(orch.interval(SourceId::Alerts), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_session_fetch_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(FakeMux::with_panes(vec![
            raw("%1", 0, "proj__cc_1", "node"),
            raw("%2", 1, "proj__user", "zsh"),
        ]));
        mux.set_text("%1", "Thinking about the change\n");
        let collab = collaborators(mux, Arc::new(SlowTools::default()), dir.path());
        let mut state = store();
        let input = FetchInput::for_source(SourceId::Session, &state, Utc::now());
        let ctx = FetchContext::new(SourceId::Session.timeout());

        let payload = run_fetch(SourceId::Session, &ctx, &collab, input).await.unwrap();
        let applied = apply_completion(&mut state, SourceId::Session, Ok(payload), Utc::now());

        assert_eq!(state.panes.len(), 2);
        assert_eq!(applied.migration.added, vec!["%1"]);
        assert!(state.agents.contains_key("%1"));
        assert!(!state.agents.contains_key("%2"));
        assert!(state.outputs.contains_key("%1"));
        assert!(state.session_updated_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_session_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(FakeMux::default());
        *mux.list_error.lock().unwrap() = Some(NtmError::SessionNotFound("proj".into()));
        let collab = collaborators(mux, Arc::new(SlowTools::default()), dir.path());
        let mut state = store();
        let input = FetchInput::for_source(SourceId::Session, &state, Utc::now());
        let ctx = FetchContext::new(SourceId::Session.timeout());

        let result = run_fetch(SourceId::Session, &ctx, &collab, input).await;
        apply_completion(&mut state, SourceId::Session, result, Utc::now());
        assert!(matches!(state.session_error, Some(NtmError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_mail_sources_unavailable_without_client() {
        let dir = tempfile::tempdir().unwrap();
        let collab = collaborators(Arc::new(FakeMux::default()), Arc::new(SlowTools::default()), dir.path());
        let ctx = FetchContext::new(Duration::from_secs(1));
        let err = run_fetch(SourceId::MailStatus, &ctx, &collab, FetchInput::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        let mut state = store();
        apply_completion(&mut state, SourceId::MailStatus, Err(err), Utc::now());
        assert!(state.panels.mail_status.unavailable);
    }
}
