//! Pane enumeration and agent classification
//!
//! Turns the multiplexer's raw pane list into [`Pane`] records with a
//! detected [`AgentType`]. Pane titles follow the `<session>__<alias>_<n>[_<variant>]`
//! convention used when agents are spawned, but any title containing an agent
//! name is recognized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::FetchContext;
use crate::errors::{NtmError, Result};
use crate::tmux::{Multiplexer, RawPane};

/// Stable pane identifier assigned by the multiplexer (e.g. `%3`)
pub type PaneId = String;

/// Session-local pane index, display only
pub type PaneIndex = u32;

/// Shell commands that mark a pane as a plain user shell
const SHELL_COMMANDS: [&str; 6] = ["bash", "zsh", "fish", "sh", "dash", "nu"];

/// Agent program running in a pane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Claude,
    Codex,
    Gemini,
    User,
    Unknown,
}

impl AgentType {
    pub const ALL: [AgentType; 5] = [
        AgentType::Claude,
        AgentType::Codex,
        AgentType::Gemini,
        AgentType::User,
        AgentType::Unknown,
    ];

    /// True for panes that run an AI agent
    pub fn is_agent(self) -> bool {
        matches!(self, AgentType::Claude | AgentType::Codex | AgentType::Gemini)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
            AgentType::Gemini => "gemini",
            AgentType::User => "user",
            AgentType::Unknown => "unknown",
        }
    }

    /// Short alias used in pane titles
    pub fn alias(self) -> &'static str {
        match self {
            AgentType::Claude => "cc",
            AgentType::Codex => "cod",
            AgentType::Gemini => "gmi",
            AgentType::User => "user",
            AgentType::Unknown => "?",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pane in the session, enriched with agent classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pane {
    pub id: PaneId,
    pub index: PaneIndex,
    pub title: String,
    pub agent_type: AgentType,
    /// Model/variant string parsed from the title (e.g. "opus")
    pub variant: Option<String>,
    pub command: String,
    pub width: u16,
    pub height: u16,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Pane {
    pub fn from_raw(raw: RawPane) -> Self {
        let agent_type = detect_agent_type(&raw.title, &raw.command);
        let variant = if agent_type.is_agent() {
            parse_variant(&raw.title, agent_type)
        } else {
            None
        };
        Self {
            id: raw.id,
            index: raw.index,
            title: raw.title,
            agent_type,
            variant,
            command: raw.command,
            width: raw.width,
            height: raw.height,
            last_activity: raw.last_activity,
        }
    }

    pub fn is_agent(&self) -> bool {
        self.agent_type.is_agent()
    }

    /// Whether the pane's foreground process is a plain shell
    pub fn runs_shell(&self) -> bool {
        let cmd = self.command.rsplit('/').next().unwrap_or(&self.command);
        SHELL_COMMANDS.contains(&cmd.trim_start_matches('-'))
    }
}

fn title_tokens(title: &str) -> Vec<String> {
    title
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Classify a pane from its title (and command, to tell shells apart)
///
/// Full names match as substrings; the short aliases (`cc`, `cod`, `gmi`) only
/// match as whole title tokens so words like "accent" are not read as Claude.
pub fn detect_agent_type(title: &str, command: &str) -> AgentType {
    let lower = title.to_lowercase();
    let tokens = title_tokens(title);
    let has_token = |t: &str| tokens.iter().any(|tok| tok == t);

    if lower.contains("claude") || has_token("cc") {
        return AgentType::Claude;
    }
    if lower.contains("codex") || has_token("cod") {
        return AgentType::Codex;
    }
    if lower.contains("gemini") || has_token("gmi") {
        return AgentType::Gemini;
    }

    let cmd = command.rsplit('/').next().unwrap_or(command);
    if SHELL_COMMANDS.contains(&cmd.trim_start_matches('-')) || has_token("user") {
        AgentType::User
    } else {
        AgentType::Unknown
    }
}

/// Model/variant suffix from a title like `proj__cc_2_opus`
pub fn parse_variant(title: &str, agent_type: AgentType) -> Option<String> {
    let suffix = title.rsplit("__").next().unwrap_or(title);
    let tokens = title_tokens(suffix);
    let mut after_alias = false;
    for tok in tokens {
        if tok == agent_type.alias() || tok == agent_type.as_str() {
            after_alias = true;
            continue;
        }
        if !after_alias || tok.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        return Some(tok);
    }
    None
}

/// Enumerate the panes of `session`, sorted by index ascending
pub async fn enumerate(
    ctx: &FetchContext,
    mux: &dyn Multiplexer,
    session: &str,
) -> Result<Vec<Pane>> {
    if session.trim().is_empty() {
        return Err(NtmError::Validation("session name is empty".to_string()));
    }
    let raw = mux.list_panes(ctx, session).await.map_err(|e| match e {
        NtmError::NotFound { .. } => NtmError::SessionNotFound(session.to_string()),
        other => other,
    })?;
    let mut panes: Vec<Pane> = raw.into_iter().map(Pane::from_raw).collect();
    panes.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.id.cmp(&b.id)));
    Ok(panes)
}
