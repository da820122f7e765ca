//! Agent Mail data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Importance {
    pub fn as_str(self) -> &'static str {
        match self {
            Importance::Low => "low",
            Importance::Normal => "normal",
            Importance::High => "high",
            Importance::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub human_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredAgent {
    pub name: String,
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub task_description: String,
}

/// Registration request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRegistration {
    pub program: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,
}

/// Advisory lock over a path pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReservation {
    pub id: i64,
    #[serde(alias = "agent_name")]
    pub agent: String,
    pub path_pattern: String,
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(alias = "created_ts")]
    pub created_at: DateTime<Utc>,
    #[serde(alias = "expires_ts")]
    pub expires_at: DateTime<Utc>,
    #[serde(default, alias = "released_ts")]
    pub released_at: Option<DateTime<Utc>>,
}

fn default_exclusive() -> bool {
    true
}

impl FileReservation {
    /// Not released and not expired at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.released_at.is_none() && self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    pub sender_name: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body_md: String,
    pub importance: Importance,
    pub ack_required: bool,
}

impl OutgoingMessage {
    pub fn new(sender: impl Into<String>, to: Vec<String>, subject: impl Into<String>, body_md: impl Into<String>) -> Self {
        Self {
            sender_name: sender.into(),
            to,
            subject: subject.into(),
            body_md: body_md.into(),
            importance: Importance::Normal,
            ack_required: false,
        }
    }

    pub fn importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn ack_required(mut self, ack: bool) -> Self {
        self.ack_required = ack;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: i64,
    #[serde(default)]
    pub subject: String,
    #[serde(default, alias = "sender_name")]
    pub from: String,
    #[serde(alias = "created_ts")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub ack_required: bool,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub body_md: Option<String>,
}

/// Connectivity and reservations for the mail badge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MailStatus {
    pub connected: bool,
    pub reservations: Vec<FileReservation>,
    pub conflicts: usize,
}

/// Per-agent inbox roll-up for the inbox panel
#[derive(Debug, Clone, PartialEq)]
pub struct InboxSummary {
    pub agent_name: String,
    pub pane_id: Option<String>,
    pub unread: usize,
    pub urgent: usize,
    pub latest_subject: Option<String>,
    /// Unread messages, newest first
    pub unread_ids: Vec<i64>,
    /// Unread messages that ask for an acknowledgement
    pub pending_acks: Vec<i64>,
}

impl InboxSummary {
    pub fn from_messages(agent_name: &str, pane_id: Option<String>, messages: &[InboxMessage]) -> Self {
        let mut unread: Vec<&InboxMessage> = messages.iter().filter(|m| !m.read).collect();
        unread.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Self {
            agent_name: agent_name.to_string(),
            pane_id,
            unread: unread.len(),
            urgent: unread
                .iter()
                .filter(|m| m.importance >= Importance::High)
                .count(),
            latest_subject: messages
                .iter()
                .max_by_key(|m| m.created_at)
                .map(|m| m.subject.clone()),
            unread_ids: unread.iter().map(|m| m.id).collect(),
            pending_acks: unread
                .iter()
                .filter(|m| m.ack_required)
                .map(|m| m.id)
                .collect(),
        }
    }
}
