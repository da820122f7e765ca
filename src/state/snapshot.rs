//! Read-only agent snapshot handed to alerts, routing and the coordinator

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::panes::{AgentType, PaneId};
use crate::state::agent::{AgentState, HealthStatus};
use crate::status::{AgentErrorKind, StatusKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub pane_id: PaneId,
    pub index: u32,
    pub title: String,
    pub agent_type: AgentType,
    /// Agent Mail name, when the session registry knows this pane
    pub agent_name: Option<String>,
    pub state: StatusKind,
    pub error_kind: Option<AgentErrorKind>,
    pub health: HealthStatus,
    pub context_percent: f64,
    pub context_limit: u64,
    pub token_velocity: f64,
    pub last_activity: Option<DateTime<Utc>>,
    pub stalled: bool,
}

impl AgentSnapshot {
    pub fn from_state(agent: &AgentState, agent_name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            pane_id: agent.pane_id.clone(),
            index: agent.index,
            title: agent.title.clone(),
            agent_type: agent.agent_type,
            agent_name,
            state: agent.state(),
            error_kind: agent.error_kind,
            health: agent.health.status,
            context_percent: agent.context.usage_percent,
            context_limit: agent.context.tokens_limit,
            token_velocity: agent.token_velocity,
            last_activity: agent.last_activity,
            stalled: agent.is_stalled(now),
        }
    }

    /// Name to address this agent by, falling back to the pane title
    pub fn display_name(&self) -> &str {
        self.agent_name.as_deref().unwrap_or(&self.title)
    }
}
