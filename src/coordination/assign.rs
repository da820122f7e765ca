//! Work assignment
//!
//! Idle healthy agents get the top unblocked triage recommendation, one
//! message each. A ticket that was sent is gone for the rest of the pass; a
//! failed send leaves it for the next agent.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::beads::{Recommendation, Triage};
use crate::context::FetchContext;
use crate::mail::{AgentMail, Importance, OutgoingMessage};
use crate::sources::routing;
use crate::state::agent::HealthStatus;
use crate::state::AgentSnapshot;
use crate::status::StatusKind;

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub pane_id: String,
    pub agent_name: String,
    pub ticket_id: String,
    pub title: String,
}

#[derive(Debug, Default)]
pub struct AssignReport {
    pub assigned: Vec<Assignment>,
    /// Agent name and the send error
    pub failed: Vec<(String, String)>,
}

/// Idle, healthy, addressable agents quiet for at least `idle_threshold`, best routing score first
pub fn select_idle<'a>(
    agents: &'a [AgentSnapshot],
    now: DateTime<Utc>,
    idle_threshold: Duration,
) -> Vec<&'a AgentSnapshot> {
    let mut idle: Vec<&AgentSnapshot> = agents
        .iter()
        .filter(|a| a.state == StatusKind::Idle)
        .filter(|a| a.health != HealthStatus::Error)
        .filter(|a| a.agent_name.is_some())
        .filter(|a| {
            a.last_activity.map_or(true, |t| {
                (now - t).to_std().unwrap_or(Duration::ZERO) >= idle_threshold
            })
        })
        .collect();
    idle.sort_by(|a, b| {
        routing::score(b)
            .total_cmp(&routing::score(a))
            .then_with(|| a.index.cmp(&b.index))
    });
    idle
}

fn assignment_body(rec: &Recommendation) -> String {
    let mut body = format!("Please pick up **{}**: {}\n", rec.id, rec.title);
    if !rec.reasons.is_empty() {
        body.push_str("\nWhy this one:\n");
        for reason in &rec.reasons {
            body.push_str(&format!("- {reason}\n"));
        }
    }
    if !rec.unblocks_ids.is_empty() {
        body.push_str(&format!("\nUnblocks: {}\n", rec.unblocks_ids.join(", ")));
    }
    body.push_str(&format!("\nMark it in progress with `br update {} --status in_progress`.", rec.id));
    body
}

pub async fn auto_assign(
    ctx: &FetchContext,
    mail: &dyn AgentMail,
    project_key: &str,
    sender: &str,
    idle_agents: &[&AgentSnapshot],
    triage: &Triage,
) -> AssignReport {
    let mut report = AssignReport::default();
    let mut remaining: Vec<Recommendation> = triage
        .ranked()
        .into_iter()
        .filter(|r| !r.is_blocked())
        .collect();

    for agent in idle_agents {
        if remaining.is_empty() || ctx.is_cancelled() {
            break;
        }
        let Some(name) = agent.agent_name.as_deref() else {
            continue;
        };
        let rec = &remaining[0];
        let msg = OutgoingMessage::new(
            sender,
            vec![name.to_string()],
            format!("[assign] {}: {}", rec.id, rec.title),
            assignment_body(rec),
        )
        .importance(Importance::High)
        .ack_required(true);

        match mail.send_message(ctx, project_key, &msg).await {
            Ok(_) => {
                tracing::info!(pane_id = %agent.pane_id, agent = %name, ticket = %rec.id, "Work assigned");
                let rec = remaining.remove(0);
                report.assigned.push(Assignment {
                    pane_id: agent.pane_id.clone(),
                    agent_name: name.to_string(),
                    ticket_id: rec.id,
                    title: rec.title,
                });
            }
            Err(e) if e.is_canceled() => break,
            Err(e) => {
                tracing::warn!(agent = %name, error = %e, "Assignment send failed");
                report.failed.push((name.to_string(), e.to_string()));
            }
        }
    }
    report
}
