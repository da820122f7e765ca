//! Capture scheduling
//!
//! Capturing pane text is the most expensive multiplexer call, so each cycle
//! captures at most `budget` agent panes chosen by three rules in order:
//!
//! 1. the selected pane, if it runs an agent
//! 2. panes whose last activity is newer than their last capture, newest first
//! 3. round-robin fill from a cursor that persists across cycles
//!
//! Only rule 3 moves the cursor. Planning is pure; [`capture_targets`] does the
//! I/O with a short per-pane deadline so one hung pane never stalls the cycle.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;

use crate::context::FetchContext;
use crate::panes::{Pane, PaneId};
use crate::tmux::Multiplexer;

/// Default number of panes captured per cycle
pub const DEFAULT_BUDGET: usize = 20;

/// Default number of lines captured from each pane
pub const DEFAULT_MAX_LINES: usize = 200;

/// Deadline for a single pane capture
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of planning one capture cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePlan {
    /// Panes to capture, in priority order
    pub targets: Vec<PaneId>,
    /// Cursor for the next cycle
    pub next_cursor: usize,
    /// Positions the round-robin rule advanced over
    pub rr_steps: usize,
}

/// Choose which panes to capture this cycle
///
/// `cursor` indexes the agent panes in index order; it is reduced modulo
/// their count so a cursor left over from a larger pane set stays valid.
pub fn plan(
    panes: &[Pane],
    selected: Option<&str>,
    last_captured: &HashMap<PaneId, DateTime<Utc>>,
    budget: usize,
    cursor: usize,
) -> CapturePlan {
    let mut candidates: Vec<&Pane> = panes.iter().filter(|p| p.is_agent()).collect();
    candidates.sort_by_key(|p| p.index);

    let len = candidates.len();
    if len == 0 || budget == 0 {
        return CapturePlan {
            targets: Vec::new(),
            next_cursor: if len == 0 { 0 } else { cursor % len },
            rr_steps: 0,
        };
    }

    let mut targets: Vec<PaneId> = Vec::with_capacity(budget.min(len));
    let mut picked: HashSet<&str> = HashSet::new();

    // Rule 1: selected-first
    if let Some(sel) = selected {
        if let Some(p) = candidates.iter().find(|p| p.id == sel) {
            targets.push(p.id.clone());
            picked.insert(p.id.as_str());
        }
    }

    // Rule 2: activity delta, newest first
    let mut changed: Vec<(&Pane, DateTime<Utc>)> = candidates
        .iter()
        .filter(|p| !picked.contains(p.id.as_str()))
        .filter_map(|p| {
            let activity = p.last_activity?;
            match last_captured.get(&p.id) {
                Some(captured) if activity <= *captured => None,
                _ => Some((*p, activity)),
            }
        })
        .collect();
    changed.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.index.cmp(&b.0.index)));

    for (p, _) in changed {
        if targets.len() >= budget {
            break;
        }
        targets.push(p.id.clone());
        picked.insert(p.id.as_str());
    }

    // Rule 3: round-robin fill
    let start = cursor % len;
    let mut rr_steps = 0;
    while targets.len() < budget && rr_steps < len {
        let p = candidates[(start + rr_steps) % len];
        rr_steps += 1;
        if picked.insert(p.id.as_str()) {
            targets.push(p.id.clone());
        }
    }

    CapturePlan {
        targets,
        next_cursor: (start + rr_steps) % len,
        rr_steps,
    }
}

/// Text captured from one pane
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedPane {
    pub pane_id: PaneId,
    pub text: String,
    pub last_activity: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
}

/// Capture every target concurrently
///
/// A failed or timed-out capture drops only that pane. Cancellation of `ctx`
/// propagates to every per-pane call.
pub async fn capture_targets(
    ctx: &FetchContext,
    mux: &dyn Multiplexer,
    panes: &[Pane],
    targets: &[PaneId],
    max_lines: usize,
) -> Vec<CapturedPane> {
    let activity: HashMap<&str, Option<DateTime<Utc>>> = panes
        .iter()
        .map(|p| (p.id.as_str(), p.last_activity))
        .collect();

    let calls = targets.iter().map(|id| {
        let pane_ctx = ctx.child(CAPTURE_TIMEOUT);
        async move {
            let res = mux.capture_pane(&pane_ctx, id, max_lines).await;
            (id, res)
        }
    });

    let mut out = Vec::with_capacity(targets.len());
    for (id, res) in join_all(calls).await {
        match res {
            Ok(text) => out.push(CapturedPane {
                pane_id: id.clone(),
                text,
                last_activity: activity.get(id.as_str()).copied().flatten(),
                captured_at: Utc::now(),
            }),
            Err(e) if e.is_canceled() => {}
            Err(e) => {
                tracing::debug!(pane_id = %id, error = %e, "Capture failed, skipping pane");
            }
        }
    }
    out
}

/// Session-persistent capture bookkeeping
///
/// Owned by the dashboard state; fetches get a [`CaptureInputs`] snapshot and
/// the completion path writes results back.
#[derive(Debug, Clone)]
pub struct CaptureScheduler {
    pub budget: usize,
    pub max_lines: usize,
    cursor: usize,
    last_captured: HashMap<PaneId, DateTime<Utc>>,
}

/// Snapshot of scheduler state carried by a session fetch
#[derive(Debug, Clone)]
pub struct CaptureInputs {
    pub selected: Option<PaneId>,
    pub last_captured: HashMap<PaneId, DateTime<Utc>>,
    pub budget: usize,
    pub max_lines: usize,
    pub cursor: usize,
}

impl Default for CaptureScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET, DEFAULT_MAX_LINES)
    }
}

impl CaptureScheduler {
    pub fn new(budget: usize, max_lines: usize) -> Self {
        Self {
            budget: budget.max(1),
            max_lines: max_lines.max(1),
            cursor: 0,
            last_captured: HashMap::new(),
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn last_captured(&self, pane_id: &str) -> Option<DateTime<Utc>> {
        self.last_captured.get(pane_id).copied()
    }

    pub fn inputs(&self, selected: Option<PaneId>) -> CaptureInputs {
        CaptureInputs {
            selected,
            last_captured: self.last_captured.clone(),
            budget: self.budget,
            max_lines: self.max_lines,
            cursor: self.cursor,
        }
    }

    /// Record a finished cycle
    pub fn apply(&mut self, next_cursor: usize, captured: &[CapturedPane]) {
        self.cursor = next_cursor;
        for c in captured {
            self.last_captured.insert(c.pane_id.clone(), c.captured_at);
        }
    }

    /// Forget panes that no longer exist
    pub fn retain(&mut self, live: &HashSet<&str>) {
        self.last_captured.retain(|id, _| live.contains(id.as_str()));
    }

    pub fn tracked(&self) -> usize {
        self.last_captured.len()
    }
}
