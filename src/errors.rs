//! Structured error types for ntm
//!
//! Every fetch returns at most one `NtmError`. The refresh orchestrator only
//! looks at [`NtmError::kind`] to decide how a failure is surfaced: canceled
//! fetches are silent, unavailable tools collapse their panel, transport and
//! timeout failures keep last-known-good data on screen.

use std::time::Duration;

use thiserror::Error;

use crate::coordination::Conflict;

/// Coarse classification used for recovery decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    SessionNotFound,
    Transport,
    Unauthorized,
    NotFound,
    Timeout,
    Canceled,
    Validation,
    Conflict,
    Unavailable,
    Unknown,
}

impl ErrorKind {
    /// Stable code, also used for multiplexer errors
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::Transport => "transport",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// All possible errors in ntm
#[derive(Error, Debug, Clone)]
pub enum NtmError {
    /// The multiplexer has no session with this name
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// External service unreachable or returned a non-success status
    #[error("{op}: transport error{}: {message}", status_suffix(.status))]
    Transport {
        op: String,
        message: String,
        status: Option<u16>,
    },

    /// Missing or rejected bearer token
    #[error("{op}: unauthorized{}", status_suffix(.status))]
    Unauthorized { op: String, status: Option<u16> },

    /// Requested entity is absent
    #[error("{op}: not found: {what}")]
    NotFound { op: String, what: String },

    /// Deadline exceeded
    #[error("{op}: timed out after {}ms", .after.as_millis())]
    Timeout { op: String, after: Duration },

    /// Canceled by the user or superseded by a newer fetch
    #[error("canceled")]
    Canceled,

    /// Malformed input or response
    #[error("validation failed: {0}")]
    Validation(String),

    /// File reservation clash
    #[error("reservation conflict on '{}' ({} holders)", .0.path_pattern, .0.holders.len())]
    Conflict(Box<Conflict>),

    /// Tool not installed
    #[error("{tool} is not available")]
    Unavailable { tool: String },

    /// Carry-through with the upstream message
    #[error("{op}: {message}")]
    Unknown { op: String, message: String },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// Convenience Result type using NtmError
pub type Result<T> = std::result::Result<T, NtmError>;

impl NtmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NtmError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            NtmError::Transport { .. } => ErrorKind::Transport,
            NtmError::Unauthorized { .. } => ErrorKind::Unauthorized,
            NtmError::NotFound { .. } => ErrorKind::NotFound,
            NtmError::Timeout { .. } => ErrorKind::Timeout,
            NtmError::Canceled => ErrorKind::Canceled,
            NtmError::Validation(_) => ErrorKind::Validation,
            NtmError::Conflict(_) => ErrorKind::Conflict,
            NtmError::Unavailable { .. } => ErrorKind::Unavailable,
            NtmError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, NtmError::Canceled)
    }

    pub fn transport(op: impl Into<String>, message: impl ToString) -> Self {
        NtmError::Transport {
            op: op.into(),
            message: message.to_string(),
            status: None,
        }
    }

    pub fn unknown(op: impl Into<String>, message: impl ToString) -> Self {
        NtmError::Unknown {
            op: op.into(),
            message: message.to_string(),
        }
    }

    pub fn unavailable(tool: impl Into<String>) -> Self {
        NtmError::Unavailable { tool: tool.into() }
    }

    /// Map an HTTP status code from an upstream service
    pub fn from_status(op: impl Into<String>, status: u16, body: &str) -> Self {
        let op = op.into();
        match status {
            401 | 403 => NtmError::Unauthorized {
                op,
                status: Some(status),
            },
            404 => NtmError::NotFound {
                op,
                what: truncate(body, 200),
            },
            408 | 504 => NtmError::Timeout {
                op,
                after: Duration::ZERO,
            },
            _ => NtmError::Transport {
                op,
                message: truncate(body, 200),
                status: Some(status),
            },
        }
    }

    /// Actionable hint shown under the session error banner
    pub fn hint(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Unavailable => "Install tmux (e.g. `brew install tmux` or `apt install tmux`)",
            ErrorKind::SessionNotFound => "Start a session first: `ntm spawn <session>` or `tmux new -s <session>`",
            ErrorKind::Unauthorized => "Check the Agent Mail token, then press r to retry",
            _ => "Press r to retry",
        }
    }
}

impl From<reqwest::Error> for NtmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return NtmError::Timeout {
                op: "http".to_string(),
                after: Duration::ZERO,
            };
        }
        if let Some(status) = e.status() {
            return NtmError::from_status("http", status.as_u16(), &e.to_string());
        }
        NtmError::transport("http", e)
    }
}

impl From<serde_json::Error> for NtmError {
    fn from(e: serde_json::Error) -> Self {
        NtmError::Validation(format!("invalid JSON: {e}"))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
