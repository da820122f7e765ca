//! Per-source refresh state machine
//!
//! ```text
//! idle ──begin──▶ in_flight ──complete──▶ idle
//!                    │
//!                    └──request(cancel)──▶ idle (token canceled, generation moves on)
//! ```
//!
//! Key patterns:
//! - At most one fetch in flight; extra requests set a single `pending` flag
//! - Every dispatch bumps the generation; completions from older generations are stale
//! - A canceled completion never touches `last_fetched_at`

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Every data source the dashboard refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceId {
    Session,
    Status,
    Alerts,
    Beads,
    Metrics,
    Routing,
    History,
    FileChanges,
    Cass,
    CodeScan,
    Dcg,
    Checkpoint,
    Handoff,
    MailStatus,
    MailInbox,
    Spawn,
}

/// Spawn cadence while a staggered spawn is in progress
pub const SPAWN_ACTIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Orchestrator tick; no cadence may be shorter
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

impl SourceId {
    pub const ALL: [SourceId; 16] = [
        SourceId::Session,
        SourceId::Status,
        SourceId::Alerts,
        SourceId::Beads,
        SourceId::Metrics,
        SourceId::Routing,
        SourceId::History,
        SourceId::FileChanges,
        SourceId::Cass,
        SourceId::CodeScan,
        SourceId::Dcg,
        SourceId::Checkpoint,
        SourceId::Handoff,
        SourceId::MailStatus,
        SourceId::MailInbox,
        SourceId::Spawn,
    ];

    /// Config key (`[refresh.intervals_ms]`) and log field
    pub fn name(self) -> &'static str {
        match self {
            SourceId::Session => "session",
            SourceId::Status => "status",
            SourceId::Alerts => "alerts",
            SourceId::Beads => "beads",
            SourceId::Metrics => "metrics",
            SourceId::Routing => "routing",
            SourceId::History => "history",
            SourceId::FileChanges => "file_changes",
            SourceId::Cass => "cass",
            SourceId::CodeScan => "code_scan",
            SourceId::Dcg => "dcg",
            SourceId::Checkpoint => "checkpoint",
            SourceId::Handoff => "handoff",
            SourceId::MailStatus => "mail_status",
            SourceId::MailInbox => "mail_inbox",
            SourceId::Spawn => "spawn",
        }
    }

    /// `NTM_<KEY>_REFRESH_MS` / `NTM_<KEY>_REFRESH_SECS`
    pub fn env_key(self) -> &'static str {
        match self {
            SourceId::Session => "SESSION",
            SourceId::Status => "STATUS",
            SourceId::Alerts => "ALERTS",
            SourceId::Beads => "BEADS",
            SourceId::Metrics => "METRICS",
            SourceId::Routing => "ROUTING",
            SourceId::History => "HISTORY",
            SourceId::FileChanges => "FILE_CHANGES",
            SourceId::Cass => "CASS",
            SourceId::CodeScan => "SCAN",
            SourceId::Dcg => "DCG",
            SourceId::Checkpoint => "CHECKPOINT",
            SourceId::Handoff => "HANDOFF",
            SourceId::MailStatus => "MAIL",
            SourceId::MailInbox => "INBOX",
            SourceId::Spawn => "SPAWN",
        }
    }

    pub fn default_interval(self) -> Duration {
        match self {
            SourceId::Session => Duration::from_secs(1),
            SourceId::Alerts => Duration::from_secs(3),
            SourceId::Beads => Duration::from_secs(5),
            SourceId::Status
            | SourceId::Metrics
            | SourceId::Routing
            | SourceId::History
            | SourceId::FileChanges => Duration::from_secs(10),
            SourceId::Cass => Duration::from_secs(15 * 60),
            SourceId::CodeScan => Duration::from_secs(60),
            SourceId::Dcg => Duration::from_secs(5 * 60),
            SourceId::Checkpoint
            | SourceId::Handoff
            | SourceId::MailStatus
            | SourceId::MailInbox => Duration::from_secs(30),
            SourceId::Spawn => Duration::from_secs(2),
        }
    }

    /// Deadline for one fetch
    pub fn timeout(self) -> Duration {
        match self {
            SourceId::Session => Duration::from_secs(5),
            SourceId::Status => Duration::from_secs(5),
            SourceId::Alerts | SourceId::Metrics | SourceId::Routing => Duration::from_secs(2),
            SourceId::CodeScan => Duration::from_secs(120),
            SourceId::Cass => Duration::from_secs(30),
            SourceId::Beads | SourceId::Dcg | SourceId::FileChanges => Duration::from_secs(10),
            SourceId::MailStatus | SourceId::MailInbox => Duration::from_secs(10),
            SourceId::History | SourceId::Checkpoint | SourceId::Handoff | SourceId::Spawn => {
                Duration::from_secs(3)
            }
        }
    }

    /// Pauses while the dashboard is suspended
    pub fn suspends(self) -> bool {
        !matches!(self, SourceId::History | SourceId::FileChanges)
    }

    /// A user refresh cancels the in-flight fetch instead of queueing behind it
    pub fn cancellable(self) -> bool {
        matches!(self, SourceId::Session | SourceId::Status | SourceId::CodeScan)
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle for one dispatched fetch
#[derive(Debug, Clone)]
pub struct Ticket {
    pub generation: u64,
    pub cancel: CancellationToken,
}

/// What to do with a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Current generation: apply the payload or error
    Apply,
    /// Superseded by a newer dispatch: drop silently
    Stale,
    /// Current generation but canceled: drop silently, timestamps untouched
    Canceled,
}

#[derive(Debug)]
pub struct SourceState {
    pub id: SourceId,
    pub interval: Duration,
    generation: u64,
    in_flight: Option<Ticket>,
    pending: bool,
    /// Suspended after an auth failure until the user asks again
    blocked: bool,
    pub last_started_at: Option<Instant>,
    pub last_fetched_at: Option<Instant>,
}

impl SourceState {
    pub fn new(id: SourceId, interval: Duration) -> Self {
        Self {
            id,
            interval: interval.max(MIN_INTERVAL),
            generation: 0,
            in_flight: None,
            pending: false,
            blocked: false,
            last_started_at: None,
            last_fetched_at: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn blocked(&self) -> bool {
        self.blocked
    }

    pub fn block(&mut self) {
        self.blocked = true;
    }

    /// Ready to dispatch at `now` with cadence `interval`
    pub fn is_due(&self, now: Instant, interval: Duration, suspended: bool) -> bool {
        if self.in_flight.is_some() || self.blocked {
            return false;
        }
        if suspended && self.id.suspends() {
            return false;
        }
        self.pending
            || self
                .last_fetched_at
                .map_or(true, |t| now.saturating_duration_since(t) >= interval)
    }

    /// idle → in_flight
    pub fn begin(&mut self, now: Instant) -> Ticket {
        self.generation += 1;
        self.pending = false;
        self.last_started_at = Some(now);
        let ticket = Ticket {
            generation: self.generation,
            cancel: CancellationToken::new(),
        };
        self.in_flight = Some(ticket.clone());
        ticket
    }

    /// Ask for a refresh
    ///
    /// With `cancel_in_flight` on a cancellable source the running fetch is
    /// canceled and abandoned, so the next tick dispatches a fresh one. Any
    /// request also lifts an auth block.
    pub fn request(&mut self, cancel_in_flight: bool) {
        self.pending = true;
        self.blocked = false;
        if cancel_in_flight && self.id.cancellable() {
            if let Some(ticket) = self.in_flight.take() {
                ticket.cancel.cancel();
                tracing::debug!(source = %self.id, generation = ticket.generation, "Canceled in-flight fetch");
            }
        }
    }

    /// in_flight → idle
    pub fn complete(&mut self, generation: u64, canceled: bool, now: Instant) -> Verdict {
        let current = self
            .in_flight
            .as_ref()
            .is_some_and(|t| t.generation == generation);
        if !current || generation < self.generation {
            return Verdict::Stale;
        }
        self.in_flight = None;
        if canceled {
            return Verdict::Canceled;
        }
        self.last_fetched_at = Some(now);
        Verdict::Apply
    }

    /// Cancel whatever is running and forget it
    pub fn cancel(&mut self) {
        if let Some(ticket) = self.in_flight.take() {
            ticket.cancel.cancel();
        }
    }
}
