//! Agent status detection from captured pane text
//!
//! [`StatusDetector::analyze`] classifies one capture into an [`AgentStatus`]:
//! - state from per-agent pattern tables over the text tail
//! - context usage from the model table (or the agent's own readout)
//! - smoothed token velocity from per-pane memory
//! - whether a compaction banner is on screen
//!
//! The detector holds only velocity memory, behind a mutex so one instance can
//! be shared by the refresh fetches and the coordination monitor.

pub mod models;
pub mod patterns;
pub mod velocity;

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::panes::{parse_variant, AgentType};

pub use models::ModelTable;
use velocity::VelocityTracker;

/// Activity this recent counts as working when no pattern matches
const ACTIVE_WINDOW: Duration = Duration::from_secs(5);

/// Longest excerpt kept as `last_output`
const EXCERPT_CHARS: usize = 160;

/// Classified agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Working,
    Idle,
    Error,
    RateLimited,
    Compacted,
    Unknown,
}

impl StatusKind {
    pub const ALL: [StatusKind; 6] = [
        StatusKind::Working,
        StatusKind::Idle,
        StatusKind::Error,
        StatusKind::RateLimited,
        StatusKind::Compacted,
        StatusKind::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Working => "working",
            StatusKind::Idle => "idle",
            StatusKind::Error => "error",
            StatusKind::RateLimited => "rate_limited",
            StatusKind::Compacted => "compacted",
            StatusKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an agent is in the error (or rate-limited) state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    RateLimit,
    Crash,
    ToolError,
    Unknown,
}

impl AgentErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentErrorKind::RateLimit => "rate_limit",
            AgentErrorKind::Crash => "crash",
            AgentErrorKind::ToolError => "tool_error",
            AgentErrorKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub tokens_used: u64,
    /// Zero when the model is unknown; the UI skips the bar
    pub tokens_limit: u64,
    pub usage_percent: f64,
    pub model_name: Option<String>,
}

/// Detector output for one pane capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub pane_id: String,
    pub state: StatusKind,
    pub error_kind: Option<AgentErrorKind>,
    pub compaction_detected: bool,
    pub context: ContextUsage,
    pub token_velocity: f64,
    pub last_output: String,
    pub analyzed_at: DateTime<Utc>,
    /// When the analyzed text was captured, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl AgentStatus {
    pub fn captured(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = Some(at);
        self
    }
}

/// State shown to the user
///
/// error > rate_limited > compacted > everything else. Compaction never hides
/// an error or a rate limit.
pub fn display_state(raw: StatusKind, compacted: bool) -> StatusKind {
    match raw {
        StatusKind::Error | StatusKind::RateLimited => raw,
        _ if compacted => StatusKind::Compacted,
        other => other,
    }
}

pub struct StatusDetector {
    models: ModelTable,
    velocity: Mutex<VelocityTracker>,
}

impl Default for StatusDetector {
    fn default() -> Self {
        Self::new(ModelTable::builtin())
    }
}

impl StatusDetector {
    pub fn new(models: ModelTable) -> Self {
        Self {
            models,
            velocity: Mutex::new(VelocityTracker::default()),
        }
    }

    pub fn models(&self) -> &ModelTable {
        &self.models
    }

    pub fn analyze(
        &self,
        pane_id: &str,
        title: &str,
        agent_type: AgentType,
        text: &str,
        last_activity: Option<DateTime<Utc>>,
    ) -> AgentStatus {
        self.analyze_at(pane_id, title, agent_type, text, last_activity, Utc::now())
    }

    /// [`analyze`](Self::analyze) with an explicit clock
    pub fn analyze_at(
        &self,
        pane_id: &str,
        title: &str,
        agent_type: AgentType,
        text: &str,
        last_activity: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AgentStatus {
        self.classify(pane_id, title, agent_type, text, last_activity, now, true)
    }

    /// Classify an earlier capture again with a fresh clock
    ///
    /// The velocity tracker is only read, so re-running over old text never
    /// resets or decays the rate measured from live captures.
    pub fn reclassify(
        &self,
        pane_id: &str,
        title: &str,
        agent_type: AgentType,
        text: &str,
        last_activity: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AgentStatus {
        self.classify(pane_id, title, agent_type, text, last_activity, now, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn classify(
        &self,
        pane_id: &str,
        title: &str,
        agent_type: AgentType,
        text: &str,
        last_activity: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        record_velocity: bool,
    ) -> AgentStatus {
        let tail = patterns::tail(text, patterns::TAIL_BYTES);
        let classification = patterns::patterns_for(agent_type).classify(tail);
        let compaction_detected = patterns::detect_compaction(tail);

        let state = classification.state.unwrap_or_else(|| {
            let recently_active = last_activity
                .and_then(|t| (now - t).to_std().ok())
                .is_some_and(|age| age <= ACTIVE_WINDOW);
            if recently_active {
                StatusKind::Working
            } else {
                StatusKind::Unknown
            }
        });

        let context = self.context_usage(title, agent_type, text, tail);

        let token_velocity = {
            let mut velocity = self
                .velocity
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if record_velocity {
                velocity.observe(pane_id, context.tokens_used, now)
            } else {
                velocity.current(pane_id, now)
            }
        };

        AgentStatus {
            pane_id: pane_id.to_string(),
            state,
            error_kind: classification.error_kind,
            compaction_detected,
            context,
            token_velocity,
            last_output: last_output(text),
            analyzed_at: now,
            captured_at: None,
        }
    }

    fn context_usage(
        &self,
        title: &str,
        agent_type: AgentType,
        text: &str,
        tail: &str,
    ) -> ContextUsage {
        let variant = parse_variant(title, agent_type);
        let model_name = self.models.resolve_model(agent_type, variant.as_deref());
        let tokens_limit = model_name
            .as_deref()
            .and_then(|m| self.models.context_window(m))
            .unwrap_or(0);
        let estimate = self.models.estimate_tokens(agent_type, text.len());

        if tokens_limit == 0 {
            return ContextUsage {
                tokens_used: estimate,
                tokens_limit: 0,
                usage_percent: 0.0,
                model_name,
            };
        }

        let (tokens_used, usage_percent) = match patterns::reported_context_used(tail) {
            Some(pct) => ((tokens_limit as f64 * pct / 100.0).round() as u64, pct),
            None => {
                let used = estimate.min(tokens_limit);
                (used, used as f64 / tokens_limit as f64 * 100.0)
            }
        };

        ContextUsage {
            tokens_used,
            tokens_limit,
            usage_percent: usage_percent.clamp(0.0, 100.0),
            model_name,
        }
    }

    /// Drop velocity memory for one pane
    pub fn forget(&self, pane_id: &str) {
        self.velocity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .forget(pane_id);
    }

    /// Drop velocity memory for every pane
    pub fn reset(&self) {
        self.velocity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

fn last_output(text: &str) -> String {
    let line = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    line.chars().take(EXCERPT_CHARS).collect()
}
