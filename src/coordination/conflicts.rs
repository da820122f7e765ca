//! File reservation conflicts
//!
//! A conflict is two or more distinct agents holding active exclusive
//! reservations whose patterns overlap. Handling is one of:
//!
//! - **notify** (default): one high-importance message to every holder
//! - **negotiate**: an ack-required release request to the lowest-priority holder
//! - **force release**: user initiated, releases one holder's reservation

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pathmatch::patterns_overlap;
use crate::context::FetchContext;
use crate::errors::Result;
use crate::mail::{AgentMail, FileReservation, Importance, OutgoingMessage, SendReceipt};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Holder {
    pub agent_name: String,
    pub reservation_id: i64,
    pub path_pattern: String,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
    /// Higher keeps the reservation in a negotiation
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub path_pattern: String,
    pub holders: Vec<Holder>,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    /// Stable identity: the pattern plus the sorted holder names
    pub fn key(&self) -> String {
        let names: BTreeSet<&str> = self.holders.iter().map(|h| h.agent_name.as_str()).collect();
        format!(
            "{}|{}",
            self.path_pattern,
            names.into_iter().collect::<Vec<_>>().join(",")
        )
    }

    pub fn holder_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.holders.iter().map(|h| h.agent_name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Holder asked to yield: lowest priority, newest reservation on ties
    pub fn release_candidate(&self, requester: Option<&str>) -> Option<&Holder> {
        self.holders
            .iter()
            .filter(|h| Some(h.agent_name.as_str()) != requester)
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.reserved_at.cmp(&a.reserved_at))
                    .then_with(|| a.agent_name.cmp(&b.agent_name))
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictMode {
    #[default]
    Notify,
    Negotiate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictAction {
    Notify { recipients: Vec<String> },
    Negotiate { target: String },
    ForceRelease { agent: String, reservation_id: i64 },
}

/// Group active exclusive reservations into conflicts
///
/// `priority_of` ranks a holder by agent name. Conflicts are ordered by
/// pattern. Each cluster of mutually overlapping reservations is reported
/// once; the same agents clashing on unrelated paths are separate conflicts.
pub fn detect_conflicts(
    reservations: &[FileReservation],
    now: DateTime<Utc>,
    priority_of: impl Fn(&str) -> u8,
) -> Vec<Conflict> {
    let mut active: Vec<&FileReservation> = reservations
        .iter()
        .filter(|r| r.exclusive && r.is_active(now))
        .collect();
    active.sort_by(|a, b| a.path_pattern.cmp(&b.path_pattern).then(a.id.cmp(&b.id)));

    let mut clusters: Vec<(BTreeSet<i64>, Conflict)> = Vec::new();

    for anchor in &active {
        let overlapping: Vec<&FileReservation> = active
            .iter()
            .copied()
            .filter(|r| patterns_overlap(&anchor.path_pattern, &r.path_pattern))
            .collect();
        let agents: BTreeSet<&str> = overlapping.iter().map(|r| r.agent.as_str()).collect();
        if agents.len() < 2 {
            continue;
        }
        let ids: BTreeSet<i64> = overlapping.iter().map(|r| r.id).collect();
        // A cluster already covered by a wider one adds nothing new
        if clusters.iter().any(|(seen, _)| ids.is_subset(seen)) {
            continue;
        }
        clusters.retain(|(seen, _)| !seen.is_subset(&ids));

        let holders: Vec<Holder> = overlapping
            .iter()
            .map(|r| Holder {
                agent_name: r.agent.clone(),
                reservation_id: r.id,
                path_pattern: r.path_pattern.clone(),
                reserved_at: r.created_at,
                expires_at: r.expires_at,
                reason: r.reason.clone(),
                priority: priority_of(&r.agent),
            })
            .collect();
        let conflict = Conflict {
            path_pattern: anchor.path_pattern.clone(),
            holders,
            detected_at: now,
        };
        clusters.push((ids, conflict));
    }
    let mut conflicts: Vec<Conflict> = clusters.into_iter().map(|(_, c)| c).collect();
    conflicts.sort_by(|a, b| a.path_pattern.cmp(&b.path_pattern));
    conflicts
}

fn holder_lines(conflict: &Conflict) -> String {
    conflict
        .holders
        .iter()
        .map(|h| {
            let reason = if h.reason.is_empty() { "no reason given" } else { h.reason.as_str() };
            format!(
                "- **{}** holds `{}` since {} ({reason})",
                h.agent_name,
                h.path_pattern,
                h.reserved_at.format("%H:%M:%S")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One high-importance message to every holder
pub async fn notify_conflict(
    ctx: &FetchContext,
    mail: &dyn AgentMail,
    project_key: &str,
    sender: &str,
    conflict: &Conflict,
) -> Result<SendReceipt> {
    let body = format!(
        "Overlapping exclusive reservations on `{}`:\n\n{}\n\nPlease coordinate: one of you should release or narrow the reservation.",
        conflict.path_pattern,
        holder_lines(conflict)
    );
    let msg = OutgoingMessage::new(
        sender,
        conflict.holder_names(),
        format!("[conflict] {}", conflict.path_pattern),
        body,
    )
    .importance(Importance::High);
    let receipt = mail.send_message(ctx, project_key, &msg).await?;
    tracing::info!(
        pattern = %conflict.path_pattern,
        holders = conflict.holders.len(),
        "Conflict notification sent"
    );
    Ok(receipt)
}

/// Ask the lowest-priority holder (never the requester) to release
///
/// Returns the target's name, or `None` when nobody else holds the pattern.
pub async fn negotiate_conflict(
    ctx: &FetchContext,
    mail: &dyn AgentMail,
    project_key: &str,
    requester: &str,
    conflict: &Conflict,
) -> Result<Option<String>> {
    let Some(target) = conflict.release_candidate(Some(requester)) else {
        return Ok(None);
    };
    let body = format!(
        "Your reservation `{}` (id {}) overlaps with other agents on `{}`:\n\n{}\n\nPlease release it when you reach a safe point and acknowledge this message.",
        target.path_pattern,
        target.reservation_id,
        conflict.path_pattern,
        holder_lines(conflict)
    );
    let msg = OutgoingMessage::new(
        requester,
        vec![target.agent_name.clone()],
        format!("[release request] {}", target.path_pattern),
        body,
    )
    .importance(Importance::High)
    .ack_required(true);
    mail.send_message(ctx, project_key, &msg).await?;
    tracing::info!(agent = %target.agent_name, pattern = %conflict.path_pattern, "Release requested");
    Ok(Some(target.agent_name.clone()))
}

/// Release one holder's reservation on the user's behalf
pub async fn force_release(
    ctx: &FetchContext,
    mail: &dyn AgentMail,
    project_key: &str,
    holder: &Holder,
    note: &str,
    notify: bool,
) -> Result<()> {
    mail.force_release_file_reservation(
        ctx,
        project_key,
        &holder.agent_name,
        holder.reservation_id,
        note,
        notify,
    )
    .await?;
    tracing::warn!(
        agent = %holder.agent_name,
        reservation_id = holder.reservation_id,
        "Reservation force-released"
    );
    Ok(())
}
