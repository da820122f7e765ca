//! Application state and logic
//!
//! `App` owns the view-model store and the refresh orchestrator and is the
//! only thing that mutates either. Everything asynchronous (fetches, focus,
//! recovery prompts, force releases) runs on spawned tasks and reports back
//! through `event_tx`, so [`App::handle_event`] sees one serial stream.
//!
//! - [`App::new()`] - Constructor
//! - [`App::handle_event()`] - Event processing
//! - [`App::tick()`] - Dispatch due fetches
//! - [`App::rendered()`] - Mark frame as rendered
//! - [`App::show_status()`] - Display status messages

mod actions;
mod keyboard;

use crate::coordination::conflicts::{detect_conflicts, Conflict};
use crate::coordination::{holder_priority, CoordinatorEvent, CoordinatorEventKind};
use crate::event::{ActionOutcome, Event, UserAction};
use crate::notify::Notifier;
use crate::panes::PaneId;
use crate::refresh::{
    apply_completion, spawn_job, Collaborators, Completion, FetchInput, RefreshOrchestrator,
    SourceId, Verdict,
};
use crate::state::DashboardState;
use crate::status::StatusKind;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Coordinator events kept for the debug log
const EVENT_LOG_CAPACITY: usize = 50;

/// How long a footer status message stays up
const STATUS_TTL: Duration = Duration::from_secs(5);

/// Application state and logic
pub struct App {
    pub state: DashboardState,
    pub orchestrator: RefreshOrchestrator,
    pub collab: Arc<Collaborators>,
    pub should_quit: bool,
    pub debug_mode: bool,
    pub show_help: bool,
    /// Dirty flag: true if UI needs re-render (render-on-change optimization)
    pub needs_render: bool,
    /// Status message to display in footer (message, timestamp)
    pub status_message: Option<(String, Instant)>,
    /// Pane currently zoomed in tmux; the dashboard is suspended meanwhile
    pub zoomed: Option<PaneId>,
    /// Recent coordinator events, newest last
    pub coordinator_log: VecDeque<CoordinatorEvent>,
    event_tx: mpsc::Sender<Event>,
    notifier: Notifier,
    /// Fetch and action tasks, pruned as they finish
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    pub fn new(
        state: DashboardState,
        orchestrator: RefreshOrchestrator,
        collab: Arc<Collaborators>,
        event_tx: mpsc::Sender<Event>,
        debug_mode: bool,
        notifier: Notifier,
    ) -> Self {
        Self {
            state,
            orchestrator,
            collab,
            should_quit: false,
            debug_mode,
            show_help: false,
            needs_render: true, // Always render first frame
            status_message: None,
            zoomed: None,
            coordinator_log: VecDeque::with_capacity(EVENT_LOG_CAPACITY),
            event_tx,
            notifier,
            tasks: Vec::new(),
        }
    }

    /// Show a status message in the footer (clears after 5 seconds)
    pub fn show_status(&mut self, msg: &str) {
        self.status_message = Some((msg.to_string(), Instant::now()));
        self.needs_render = true;
    }

    /// Handle incoming events
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Key(key) => {
                self.handle_key(key);
                self.needs_render = true;
            }
            Event::Resize => self.needs_render = true,
            Event::Completion(completion) => self.handle_completion(*completion),
            Event::Coordinator(ev) => self.handle_coordinator_event(ev),
            Event::ActionDone(outcome) => self.handle_action_done(outcome),
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let verdict = self.orchestrator.settle(&completion, Instant::now());
        if verdict != Verdict::Apply {
            return;
        }
        let source = completion.source;
        let now = Utc::now();
        let applied = apply_completion(&mut self.state, source, completion.result, now);

        for id in &applied.migration.removed {
            self.collab.detector.forget(id);
            if self.zoomed.as_deref() == Some(id.as_str()) {
                self.leave_zoom();
            }
        }
        for t in &applied.status.transitions {
            if t.current == StatusKind::Error {
                let title = self
                    .state
                    .agents
                    .get(&t.pane_id)
                    .map_or(t.pane_id.as_str(), |a| a.title.as_str())
                    .to_string();
                self.notifier
                    .agent_error(&t.pane_id, &title, &format!("{} -> {}", t.previous, t.current));
            }
        }
        for recovery in applied.status.recoveries {
            self.send_recovery(recovery);
        }
        if source == SourceId::Session {
            self.state.timeline.evict(now);
        }
        if source == SourceId::MailStatus {
            for conflict in self.conflicts() {
                self.notifier
                    .conflict(&conflict.path_pattern, &conflict.holder_names());
            }
        }
        self.needs_render = true;
    }

    fn handle_coordinator_event(&mut self, ev: CoordinatorEvent) {
        tracing::debug!(kind = ?ev.kind, pane_id = ?ev.pane_id, message = %ev.message, "Coordinator event");
        if ev.kind == CoordinatorEventKind::AgentError {
            if let Some(pane_id) = &ev.pane_id {
                self.notifier.agent_error(pane_id, pane_id, &ev.message);
            }
        }
        if self.coordinator_log.len() == EVENT_LOG_CAPACITY {
            self.coordinator_log.pop_front();
        }
        self.coordinator_log.push_back(ev);
        self.needs_render = self.needs_render || self.debug_mode;
    }

    fn handle_action_done(&mut self, outcome: ActionOutcome) {
        match (&outcome.result, outcome.action) {
            (Ok(msg), UserAction::Recovery) => {
                if let Some(id) = &outcome.pane_id {
                    self.state.mark_recovery_sent(id, Utc::now());
                }
                tracing::info!(pane_id = ?outcome.pane_id, "Recovery prompt delivered");
                self.show_status(msg);
            }
            (Ok(msg), _) => self.show_status(msg),
            (Err(e), action) => {
                tracing::warn!(action = action.label(), pane_id = ?outcome.pane_id, error = %e, "Action failed");
                if action == UserAction::Focus {
                    self.leave_zoom();
                }
                self.show_status(&format!("{} failed: {}", action.label(), e));
            }
        }
    }

    /// Dispatch every due fetch and expire the footer message
    pub fn tick(&mut self) {
        let now = Instant::now();
        self.tasks.retain(|t| !t.is_finished());
        for (source, ticket) in self.orchestrator.due(now) {
            let input = FetchInput::for_source(source, &self.state, Utc::now());
            self.tasks.push(spawn_job(
                source,
                ticket,
                Arc::clone(&self.collab),
                input,
                self.event_tx.clone(),
            ));
        }
        if self
            .status_message
            .as_ref()
            .is_some_and(|(_, at)| at.elapsed() >= STATUS_TTL)
        {
            self.status_message = None;
            self.needs_render = true;
        }
    }

    /// Called after render to reset dirty flag
    pub fn rendered(&mut self) {
        self.needs_render = false;
    }

    /// Active reservation conflicts from the last mail status fetch
    pub fn conflicts(&self) -> Vec<Conflict> {
        let Some(status) = self.state.panels.mail_status.data.as_ref() else {
            return Vec::new();
        };
        let now = Utc::now();
        let snapshots = self.state.snapshots(now);
        detect_conflicts(&status.reservations, now, |name| holder_priority(&snapshots, name))
    }

    /// Cancel in-flight fetches, then abort whatever ignores the token
    pub async fn shutdown(&mut self, grace: Duration) {
        self.orchestrator.cancel_all();
        let deadline = tokio::time::Instant::now() + grace;
        for task in &mut self.tasks {
            if tokio::time::timeout_at(deadline, &mut *task).await.is_err() {
                task.abort();
            }
        }
        self.tasks.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::beads::{BeadsSummary, DriftReport, TicketTool, Triage};
    use crate::capture::CaptureScheduler;
    use crate::context::FetchContext;
    use crate::errors::{NtmError, Result};
    use crate::mail::{AgentMail, FallbackMode, RegistryStore};
    use crate::state::Timeline;
    use crate::status::StatusDetector;
    use crate::tmux::fake::{raw, FakeMux};
    use crate::tools::{CassContext, DcgStatus, FileChange, ProjectTools, ScanReport};
    use async_trait::async_trait;
    use std::path::Path;

    struct NoTickets;

    #[async_trait]
    impl TicketTool for NoTickets {
        async fn beads_summary(&self, _ctx: &FetchContext, _dir: &Path, _limit: usize) -> Result<BeadsSummary> {
            Err(NtmError::unavailable("bv"))
        }
        async fn triage(&self, _ctx: &FetchContext, _dir: &Path) -> Result<Triage> {
            Err(NtmError::unavailable("bv"))
        }
        async fn check_drift(&self, _ctx: &FetchContext, _dir: &Path) -> Result<DriftReport> {
            Err(NtmError::unavailable("bv"))
        }
    }

    struct NoTools;

    #[async_trait]
    impl ProjectTools for NoTools {
        async fn code_scan(&self, _ctx: &FetchContext, _dir: &Path) -> Result<ScanReport> {
            Err(NtmError::unavailable("ubs"))
        }
        async fn cass_context(&self, _ctx: &FetchContext, _dir: &Path, _query: &str) -> Result<CassContext> {
            Err(NtmError::unavailable("cass"))
        }
        async fn dcg_status(&self, _ctx: &FetchContext) -> Result<DcgStatus> {
            Err(NtmError::unavailable("dcg"))
        }
        async fn file_changes(&self, _ctx: &FetchContext, _dir: &Path) -> Result<Vec<FileChange>> {
            Ok(Vec::new())
        }
    }

    pub(crate) fn test_app(mux: Arc<FakeMux>, dir: &Path) -> (App, mpsc::Receiver<Event>) {
        test_app_with_mail(mux, dir, None)
    }

    /// Mail sources stay disabled; only actions reach `mail`
    pub(crate) fn test_app_with_mail(
        mux: Arc<FakeMux>,
        dir: &Path,
        mail: Option<Arc<dyn AgentMail>>,
    ) -> (App, mpsc::Receiver<Event>) {
        let collab = Arc::new(Collaborators {
            session: "proj".into(),
            project_dir: dir.to_path_buf(),
            project_key: dir.display().to_string(),
            mux,
            detector: Arc::new(StatusDetector::default()),
            tickets: Arc::new(NoTickets),
            tools: Arc::new(NoTools),
            mail,
            registry: RegistryStore::new(dir.join("sessions"), FallbackMode::Strict),
            history_path: dir.join("history.jsonl"),
            cass_query: "proj".into(),
            beads_limit: 5,
        });
        let (tx, rx) = mpsc::channel(100);
        let state = DashboardState::new("proj", CaptureScheduler::default(), Timeline::default());
        let mut orchestrator = RefreshOrchestrator::new(&std::collections::HashMap::new());
        orchestrator.disable(SourceId::MailStatus);
        orchestrator.disable(SourceId::MailInbox);
        let app = App::new(state, orchestrator, collab, tx, false, Notifier::new(false));
        (app, rx)
    }

    fn two_panes() -> Arc<FakeMux> {
        Arc::new(FakeMux::with_panes(vec![
            raw("%1", 0, "proj__cc_1", "node"),
            raw("%2", 1, "proj__cod_1", "node"),
        ]))
    }

    /// Feed completions back until the session source has applied once
    pub(crate) async fn pump_session(app: &mut App, rx: &mut mpsc::Receiver<Event>) {
        loop {
            let ev = rx.recv().await.unwrap();
            let is_session = matches!(&ev, Event::Completion(c) if c.source == SourceId::Session);
            app.handle_event(ev);
            if is_session {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_tick_dispatches_and_session_completion_applies() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, mut rx) = test_app(two_panes(), dir.path());

        app.tick();
        assert!(app.orchestrator.source(SourceId::Session).unwrap().in_flight());
        assert!(!app.orchestrator.source(SourceId::MailStatus).unwrap().in_flight());

        pump_session(&mut app, &mut rx).await;
        assert_eq!(app.state.panes.len(), 2);
        assert_eq!(app.state.selected.as_deref(), Some("%1"));
        assert!(app.needs_render);
    }

    #[tokio::test]
    async fn test_tick_does_not_redispatch_in_flight_sources() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx) = test_app(two_panes(), dir.path());
        app.tick();
        let generation = app.orchestrator.source(SourceId::Session).unwrap().generation();
        app.tick();
        assert_eq!(
            app.orchestrator.source(SourceId::Session).unwrap().generation(),
            generation
        );
    }

    #[tokio::test]
    async fn test_recovery_outcome_marks_agent() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, mut rx) = test_app(two_panes(), dir.path());
        app.tick();
        pump_session(&mut app, &mut rx).await;

        app.handle_event(Event::ActionDone(ActionOutcome {
            action: UserAction::Recovery,
            pane_id: Some("%1".into()),
            result: Ok("recovery sent to proj__cc_1".into()),
        }));
        assert!(app.state.agents["%1"].recovery_sent);
        assert!(app.status_message.is_some());
    }

    #[test]
    fn test_coordinator_log_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx) = test_app(two_panes(), dir.path());
        for i in 0..(EVENT_LOG_CAPACITY + 5) {
            app.handle_event(Event::Coordinator(CoordinatorEvent {
                kind: CoordinatorEventKind::AgentIdle,
                pane_id: None,
                message: format!("event {i}"),
                at: Utc::now(),
            }));
        }
        assert_eq!(app.coordinator_log.len(), EVENT_LOG_CAPACITY);
        assert_eq!(app.coordinator_log.back().unwrap().message, "event 54");
    }
}
