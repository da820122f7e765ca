//! Per-agent pattern tables for pane text classification
//!
//! Patterns run against the tail of the captured text only, so old scrollback
//! never decides the current state.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::panes::AgentType;

use super::{AgentErrorKind, StatusKind};

/// Bytes of captured text inspected by the classifier
pub const TAIL_BYTES: usize = 600;

pub struct PatternSet {
    working: Vec<Regex>,
    idle: Vec<Regex>,
    rate_limit: Vec<Regex>,
    errors: Vec<(Regex, AgentErrorKind)>,
}

/// Outcome of matching one tail against a pattern set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub state: Option<StatusKind>,
    pub error_kind: Option<AgentErrorKind>,
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern = %p, error = %e, "Skipping invalid status pattern");
                None
            }
        })
        .collect()
}

fn compile_errors(patterns: &[(&str, AgentErrorKind)]) -> Vec<(Regex, AgentErrorKind)> {
    patterns
        .iter()
        .filter_map(|(p, kind)| compile(&[*p]).pop().map(|re| (re, *kind)))
        .collect()
}

// Shared by every agent type
const COMMON_RATE_LIMIT: [&str; 4] = [
    r"(?i)rate[ _-]?limit(ed)?",
    r"(?i)too many requests",
    r"(?i)\b(?:status|error|code)[ :]*429\b|\bhttp/[\d.]+ 429\b|\b429 too many",
    r"(?i)usage limit (reached|exceeded)",
];

const COMMON_ERRORS: [(&str, AgentErrorKind); 6] = [
    (r"(?i)^\s*(panic|fatal error)\b", AgentErrorKind::Crash),
    (r"(?i)traceback \(most recent call last\)", AgentErrorKind::Crash),
    (r"(?i)unhandled (promise )?rejection|segmentation fault", AgentErrorKind::Crash),
    (r"(?m)^\s+at .+\(.+:\d+:\d+\)$", AgentErrorKind::Crash),
    (r"(?i)tool (call|use) (failed|error)", AgentErrorKind::ToolError),
    (r"(?i)^\s*error:|api error|overloaded_error", AgentErrorKind::Unknown),
];

static CLAUDE: Lazy<PatternSet> = Lazy::new(|| PatternSet {
    working: compile(&[
        r"(?i)esc to interrupt",
        r"(?i)\b(thinking|pondering|crafting|cooking|brewing|computing)…",
        r"[✻✽✶✳✢·] \w+…",
        r"⏺ (Bash|Read|Edit|Write|Update|Search|Task)\(",
    ]),
    idle: compile(&[r"(?m)^\s*>\s*$", r"(?m)^│ >\s", r"(?i)\? for shortcuts"]),
    rate_limit: compile(&[&COMMON_RATE_LIMIT[..], &[r"(?i)claude usage limit"][..]].concat()),
    errors: compile_errors(&COMMON_ERRORS),
});

static CODEX: Lazy<PatternSet> = Lazy::new(|| PatternSet {
    working: compile(&[
        r"(?i)esc to interrupt",
        r"(?i)\bworking\b.*\(\d+s",
        r"(?i)^\s*• (running|exploring|reading)",
    ]),
    idle: compile(&[r"(?m)^›\s*$", r"(?m)^\s*▌\s*$", r"(?i)send a message"]),
    rate_limit: compile(&COMMON_RATE_LIMIT),
    errors: compile_errors(&COMMON_ERRORS),
});

static GEMINI: Lazy<PatternSet> = Lazy::new(|| PatternSet {
    working: compile(&[r"(?i)\(esc to cancel", r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]"]),
    idle: compile(&[r"(?i)type your message", r"(?m)^\s*>\s*$"]),
    rate_limit: compile(&[&COMMON_RATE_LIMIT[..], &[r"(?i)quota exceeded|resource_exhausted"][..]].concat()),
    errors: compile_errors(&COMMON_ERRORS),
});

static GENERIC: Lazy<PatternSet> = Lazy::new(|| PatternSet {
    working: compile(&[r"(?i)esc to (interrupt|cancel)"]),
    idle: compile(&[r"(?m)^\s*[>$%#❯]\s*$"]),
    rate_limit: compile(&COMMON_RATE_LIMIT),
    errors: compile_errors(&COMMON_ERRORS),
});

static COMPACTION: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)context left until auto-?compact:\s*0%",
        r"(?i)compacting conversation",
        r"(?i)conversation (has been )?compacted",
        r"(?i)\b0% context left",
    ])
});

static CONTEXT_LEFT: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)context left until auto-?compact:\s*(\d{1,3})%",
        r"(?i)\b(\d{1,3})% context left",
    ])
});

pub fn patterns_for(agent_type: AgentType) -> &'static PatternSet {
    match agent_type {
        AgentType::Claude => &CLAUDE,
        AgentType::Codex => &CODEX,
        AgentType::Gemini => &GEMINI,
        AgentType::User | AgentType::Unknown => &GENERIC,
    }
}

/// Last `max` bytes of `text`, cut on a char boundary
pub fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

impl PatternSet {
    /// Classify a tail with precedence error > rate_limited > working > idle
    pub fn classify(&self, tail: &str) -> Classification {
        if let Some((_, kind)) = self.errors.iter().find(|(re, _)| re.is_match(tail)) {
            // A rate-limit banner often looks like an API error too
            if self.rate_limit.iter().any(|re| re.is_match(tail)) {
                return Classification {
                    state: Some(StatusKind::RateLimited),
                    error_kind: Some(AgentErrorKind::RateLimit),
                };
            }
            return Classification {
                state: Some(StatusKind::Error),
                error_kind: Some(*kind),
            };
        }
        if self.rate_limit.iter().any(|re| re.is_match(tail)) {
            return Classification {
                state: Some(StatusKind::RateLimited),
                error_kind: Some(AgentErrorKind::RateLimit),
            };
        }
        if self.working.iter().any(|re| re.is_match(tail)) {
            return Classification {
                state: Some(StatusKind::Working),
                error_kind: None,
            };
        }
        if self.idle.iter().any(|re| re.is_match(tail)) {
            return Classification {
                state: Some(StatusKind::Idle),
                error_kind: None,
            };
        }
        Classification {
            state: None,
            error_kind: None,
        }
    }
}

/// Whether a compaction banner is visible in the tail
pub fn detect_compaction(tail: &str) -> bool {
    COMPACTION.iter().any(|re| re.is_match(tail))
}

/// Context usage percent reported by the agent itself, if shown
///
/// Agents print the remaining share; this returns the used share.
pub fn reported_context_used(tail: &str) -> Option<f64> {
    CONTEXT_LEFT.iter().find_map(|re| {
        let caps = re.captures_iter(tail).last()?;
        let left: f64 = caps.get(1)?.as_str().parse().ok()?;
        Some((100.0 - left.min(100.0)).max(0.0))
    })
}
