// Clippy configuration: enable pedantic but allow overly strict lints
#![allow(clippy::missing_errors_doc)] // Internal functions don't need # Errors docs
#![allow(clippy::too_many_lines)] // Some functions are naturally long
#![allow(clippy::cast_possible_truncation)] // We're careful with our casts
#![allow(clippy::needless_pass_by_value)] // PathBuf by value is fine for config loading

//! ntm - live dashboard for tmux sessions of AI coding agents
//!
//! Usage:
//!   ntm -s <session>              # Start the dashboard
//!   ntm -s <session> --once       # One diagnostics pass, printed as a table
//!   ntm -s <session> coordinate   # Headless coordinator
//!   ntm -s <session> teardown     # Delete the session's agent registry

use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use ntm::app::App;
use ntm::beads::BvCli;
use ntm::capture::CaptureScheduler;
use ntm::cli::{self, Cli, Commands};
use ntm::config::NtmConfig;
use ntm::context::FetchContext;
use ntm::coordination::Coordinator;
use ntm::errors::NtmError;
use ntm::event::{self, Event};
use ntm::mail::{AgentMail, HttpMailClient, RegistryStore};
use ntm::notify::Notifier;
use ntm::refresh::{
    apply_completion, run_fetch, Collaborators, FetchInput, RefreshOrchestrator, SourceId,
    MIN_INTERVAL,
};
use ntm::sources::history;
use ntm::state::{DashboardState, Timeline};
use ntm::status::StatusDetector;
use ntm::tmux::TmuxClient;
use ntm::tools::{resolve_project_dir, CliTools};
use ntm::{tui, ui};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long fetches get to notice cancellation at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Get the log directory path
fn get_log_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("/tmp/ntm/logs"),
        |dirs| dirs.cache_dir().join("ntm").join("logs"),
    )
}

/// Everything the run modes share
struct Runtime {
    config: NtmConfig,
    collab: Arc<Collaborators>,
}

fn build_runtime(session: String, project_dir: PathBuf, config: NtmConfig) -> Result<Runtime> {
    let project_key = config
        .mail
        .project_key
        .clone()
        .unwrap_or_else(|| project_dir.display().to_string());

    let mail: Option<Arc<dyn AgentMail>> = if config.mail.enabled {
        match HttpMailClient::new(&config.mail.url, config.mail.token.clone()) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!(url = %config.mail.url, error = %e, "Agent Mail disabled: invalid endpoint");
                None
            }
        }
    } else {
        None
    };

    let registry_root = config
        .registry
        .root
        .clone()
        .unwrap_or_else(RegistryStore::default_root);
    let cass_query = config.refresh.cass_query.clone().unwrap_or_else(|| {
        project_dir
            .file_name()
            .map_or_else(|| session.clone(), |n| n.to_string_lossy().to_string())
    });

    let collab = Collaborators {
        session,
        project_dir,
        project_key,
        mux: Arc::new(TmuxClient::new(config.tools.tmux.clone())),
        detector: Arc::new(StatusDetector::new(config.model_table())),
        tickets: Arc::new(BvCli::new(config.tools.bv.clone())),
        tools: Arc::new(CliTools {
            ubs: config.tools.ubs.clone(),
            cass: config.tools.cass.clone(),
            dcg: config.tools.dcg.clone(),
            git: config.tools.git.clone(),
        }),
        mail,
        registry: RegistryStore::new(registry_root, config.registry.fallback),
        history_path: history::default_path(),
        cass_query,
        beads_limit: config.refresh.beads_limit,
    };
    Ok(Runtime {
        config,
        collab: Arc::new(collab),
    })
}

fn new_store(rt: &Runtime) -> DashboardState {
    let capture = CaptureScheduler::new(rt.config.refresh.capture_budget, rt.config.refresh.capture_lines);
    let timeline_path = rt
        .collab
        .registry
        .session_root(&rt.collab.session)
        .join("timeline.jsonl");
    let mut state = DashboardState::new(
        rt.collab.session.clone(),
        capture,
        Timeline::default().with_sink(timeline_path),
    );
    if rt.collab.mail.is_none() {
        state.panels.mail_status.fail(NtmError::unavailable("agent mail"));
        state.panels.mail_inbox.fail(NtmError::unavailable("agent mail"));
    }
    state
}

fn new_orchestrator(rt: &Runtime) -> RefreshOrchestrator {
    let mut orchestrator = RefreshOrchestrator::new(&rt.config.refresh_intervals());
    if rt.collab.mail.is_none() {
        orchestrator.disable(SourceId::MailStatus);
        orchestrator.disable(SourceId::MailInbox);
    }
    orchestrator
}

/// Coordinator wired to the same tools as the dashboard, if mail is available
fn new_coordinator(rt: &Runtime) -> Option<(Coordinator, mpsc::Receiver<ntm::coordination::CoordinatorEvent>)> {
    let Some(mail) = rt.collab.mail.clone() else {
        tracing::warn!("Coordinator needs Agent Mail; not starting");
        return None;
    };
    Some(Coordinator::new(
        rt.collab.session.clone(),
        rt.collab.project_dir.clone(),
        rt.collab.project_key.clone(),
        Arc::clone(&rt.collab.mux),
        mail,
        Arc::clone(&rt.collab.tickets),
        rt.collab.registry.clone(),
        StatusDetector::new(rt.config.model_table()),
        rt.config.coordinator.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = cli.command {
        cli::print_completions(shell);
        return Ok(());
    }

    // Initialize error handling
    color_eyre::install()?;

    // Setup file logging with rotation
    let log_dir = get_log_dir();
    std::fs::create_dir_all(&log_dir)
        .wrap_err_with(|| format!("creating log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "ntm.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let log_filter = format!("ntm={}", cli.log_level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(non_blocking),
        )
        .init();

    tracing::info!("Starting ntm v{}", env!("CARGO_PKG_VERSION"));

    let session = cli
        .session_name()
        .ok_or_else(|| eyre!("No session given: pass --session <name> or set NTM_SESSION"))?;
    let project_dir = resolve_project_dir(cli.project_dir.clone());
    let config = NtmConfig::load();
    tracing::info!(
        session = %session,
        project_dir = %project_dir.display(),
        mail = config.mail.enabled,
        coordinator = config.coordinator.enabled,
        "Loaded config"
    );
    let rt = build_runtime(session, project_dir, config)?;

    match cli.command {
        Some(Commands::Teardown) => return teardown(&rt),
        Some(Commands::Coordinate) => return run_coordinator(&rt).await,
        Some(Commands::Completions { .. }) | None => {}
    }

    if cli.once {
        return run_once(&rt).await;
    }

    let (event_tx, event_rx) = mpsc::channel(100);
    let cancel = CancellationToken::new();

    let coordinator_handle = if cli.coordinator || rt.config.coordinator.enabled {
        new_coordinator(&rt).map(|(coordinator, rx)| {
            let forward = tokio::spawn(event::input::forward_coordinator(rx, event_tx.clone()));
            let run = tokio::spawn(coordinator.run(cancel.child_token()));
            (run, forward)
        })
    } else {
        None
    };

    let result = run_tui(&rt, event_tx, event_rx, cli.debug, cli.tick_rate, cli.frame_rate).await;

    cancel.cancel();
    if let Some((run, forward)) = coordinator_handle {
        if tokio::time::timeout(SHUTDOWN_GRACE, run).await.is_err() {
            tracing::debug!("Coordinator did not stop in time");
        }
        forward.abort();
    }

    result
}

/// Ticker period for `tick_rate` ticks/sec, never faster than the
/// quickest source may poll
fn tick_period(tick_rate: f64) -> Duration {
    let period = Duration::from_secs_f64(1.0 / tick_rate);
    if period < MIN_INTERVAL {
        tracing::warn!(tick_rate, "Tick rate above 10/s, clamping to {}ms", MIN_INTERVAL.as_millis());
    }
    period.max(MIN_INTERVAL)
}

async fn run_tui(
    rt: &Runtime,
    event_tx: mpsc::Sender<Event>,
    mut event_rx: mpsc::Receiver<Event>,
    debug_mode: bool,
    tick_rate: f64,
    frame_rate: f64,
) -> Result<()> {
    use std::time::Instant;

    if tick_rate <= 0.0 || frame_rate <= 0.0 {
        return Err(eyre!("--tick-rate and --frame-rate must be positive"));
    }
    // Calculate durations from rates
    let tick_duration = tick_period(tick_rate);
    let frame_duration = Duration::from_secs_f64(1.0 / frame_rate);

    tracing::info!(
        "TUI starting: {:.1} FPS, {:.1} ticks/sec",
        frame_rate,
        tick_rate
    );

    let mut terminal = tui::init()?;
    tui::install_panic_hook();

    // RAII guard ensures terminal is restored on panic or early return
    let _guard = tui::TerminalGuard;

    let mut app = App::new(
        new_store(rt),
        new_orchestrator(rt),
        Arc::clone(&rt.collab),
        event_tx.clone(),
        debug_mode,
        Notifier::new(rt.config.notifications.enabled),
    );

    let cancel = CancellationToken::new();
    let input_handle = tokio::spawn(event::input::listen(event_tx.clone(), cancel.clone()));

    let mut ticker = tokio::time::interval(tick_duration);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Frame rate limiting state
    let mut last_frame = Instant::now();

    loop {
        // Frame rate limiting with dirty flag check
        let now = Instant::now();
        if app.needs_render && now.duration_since(last_frame) >= frame_duration {
            terminal.draw(|f| ui::render(f, &app))?;
            app.rendered();
            last_frame = now;
        }

        tokio::select! {
            Some(event) = event_rx.recv() => {
                app.handle_event(event);
            }
            _ = ticker.tick() => {
                app.tick();
            }
        }

        if app.should_quit {
            break;
        }
    }

    tracing::debug!("Shutting down");
    cancel.cancel();
    input_handle.abort();
    app.shutdown(SHUTDOWN_GRACE).await;

    tui::restore()?;
    terminal.show_cursor()?;

    Ok(())
}

/// One enumerate + capture + detect pass, printed as a table
async fn run_once(rt: &Runtime) -> Result<()> {
    let mut state = new_store(rt);
    let now = chrono::Utc::now();
    let input = FetchInput::for_source(SourceId::Session, &state, now);
    let ctx = FetchContext::new(SourceId::Session.timeout());
    let result = run_fetch(SourceId::Session, &ctx, &rt.collab, input).await;
    if let Err(e) = &result {
        eprintln!("{e}\n{}", e.hint());
        return Err(eyre!("session fetch failed: {}", e.kind().code()));
    }
    apply_completion(&mut state, SourceId::Session, result, now);

    println!(
        "{:<4} {:<6} {:<28} {:<5} {:<13} {:>6} {:>9}  {}",
        "IDX", "PANE", "TITLE", "TYPE", "STATE", "CTX%", "TOK/S", "HEALTH"
    );
    for pane in &state.panes {
        match state.agents.get(&pane.id) {
            Some(agent) => println!(
                "{:<4} {:<6} {:<28} {:<5} {:<13} {:>6.1} {:>9.1}  {:?}",
                pane.index,
                pane.id,
                pane.title,
                agent.agent_type.alias(),
                agent.state().as_str(),
                agent.context.usage_percent,
                agent.token_velocity,
                agent.health.status
            ),
            None => println!(
                "{:<4} {:<6} {:<28} {:<5} {:<13}",
                pane.index, pane.id, pane.title, "-", pane.command
            ),
        }
    }
    Ok(())
}

/// Headless coordinator until Ctrl+C
async fn run_coordinator(rt: &Runtime) -> Result<()> {
    let (coordinator, mut rx) =
        new_coordinator(rt).ok_or_else(|| eyre!("Agent Mail is not configured ([mail] enabled/url)"))?;
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(coordinator.run(cancel.clone()));

    println!("Coordinating session {} (Ctrl+C to stop)", rt.collab.session);
    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => println!("{} {:?} {}", ev.at.format("%H:%M:%S"), ev.kind, ev.message),
                None => break,
            },
            res = tokio::signal::ctrl_c() => {
                res.wrap_err("listening for Ctrl+C")?;
                break;
            }
        }
    }
    cancel.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
        tracing::debug!("Coordinator did not stop in time");
    }
    Ok(())
}

fn teardown(rt: &Runtime) -> Result<()> {
    let c = &rt.collab;
    c.registry
        .delete_session(&c.session, &c.project_key)
        .map_err(|e| eyre!("teardown failed: {e}"))?;
    let dir = c.registry.session_dir(&c.session, &c.project_key);
    println!("Removed agent registry for {} ({})", c.session, dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_period_floored() {
        assert_eq!(tick_period(4.0), Duration::from_millis(250));
        assert_eq!(tick_period(10.0), MIN_INTERVAL);
        assert_eq!(tick_period(1000.0), MIN_INTERVAL);
    }
}
