//! Alerts computed locally from the latest agent snapshot

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::panes::PaneId;
use crate::state::agent::{CONTEXT_ERROR_PERCENT, CONTEXT_WARNING_PERCENT};
use crate::state::AgentSnapshot;
use crate::status::{AgentErrorKind, StatusKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::Info, Severity::Warning, Severity::Critical];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ContextPressure,
    AgentError,
    RateLimited,
    Stalled,
    Rotated,
    FileConflict,
    MailUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub pane_id: Option<PaneId>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Non-agent facts the alert pass needs
#[derive(Debug, Clone, Default)]
pub struct AlertContext {
    pub conflicts: usize,
    /// Mail was configured but the last status fetch failed
    pub mail_down: bool,
    pub rotating: Vec<PaneId>,
}

pub fn compute_alerts(agents: &[AgentSnapshot], ctx: &AlertContext, now: DateTime<Utc>) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let mut push = |kind, severity, pane_id: Option<&str>, message: String| {
        alerts.push(Alert {
            kind,
            severity,
            pane_id: pane_id.map(str::to_string),
            message,
            raised_at: now,
        });
    };

    for a in agents {
        let name = a.display_name();
        match a.state {
            StatusKind::Error => {
                let kind = a.error_kind.map_or("unknown", AgentErrorKind::as_str);
                push(
                    AlertKind::AgentError,
                    Severity::Critical,
                    Some(a.pane_id.as_str()),
                    format!("{name} hit an error ({kind})"),
                );
            }
            StatusKind::RateLimited => push(
                AlertKind::RateLimited,
                Severity::Warning,
                Some(a.pane_id.as_str()),
                format!("{name} is rate limited"),
            ),
            _ => {}
        }
        if a.context_limit > 0 {
            let pct = a.context_percent;
            if pct > CONTEXT_ERROR_PERCENT {
                push(
                    AlertKind::ContextPressure,
                    Severity::Critical,
                    Some(a.pane_id.as_str()),
                    format!("{name} context at {pct:.0}%"),
                );
            } else if pct > CONTEXT_WARNING_PERCENT {
                push(
                    AlertKind::ContextPressure,
                    Severity::Warning,
                    Some(a.pane_id.as_str()),
                    format!("{name} context at {pct:.0}%"),
                );
            }
        }
        if a.stalled {
            push(
                AlertKind::Stalled,
                Severity::Warning,
                Some(a.pane_id.as_str()),
                format!("{name} has produced no output for 5m"),
            );
        }
    }

    for pane_id in &ctx.rotating {
        push(
            AlertKind::Rotated,
            Severity::Info,
            Some(pane_id.as_str()),
            format!("agent rotated into {pane_id}"),
        );
    }
    if ctx.conflicts > 0 {
        push(
            AlertKind::FileConflict,
            Severity::Warning,
            None,
            format!("{} file reservation conflict(s)", ctx.conflicts),
        );
    }
    if ctx.mail_down {
        push(
            AlertKind::MailUnavailable,
            Severity::Info,
            None,
            "Agent Mail is unreachable".to_string(),
        );
    }

    alerts.sort_by(|a, b| b.severity.cmp(&a.severity));
    alerts
}
