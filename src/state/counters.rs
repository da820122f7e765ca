//! Badge counters, recomputed after every completion pass

use std::collections::HashMap;

use crate::panes::AgentType;
use crate::sources::{CheckpointHealth, Severity};
use crate::status::StatusKind;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Counters {
    pub by_type: HashMap<AgentType, usize>,
    pub by_state: HashMap<StatusKind, usize>,
    pub alerts: HashMap<Severity, usize>,
    pub checkpoint: Option<CheckpointHealth>,
    pub beads_ready: usize,
    pub beads_in_progress: usize,
    pub beads_blocked: usize,
    pub mail_connected: bool,
    pub mail_conflicts: usize,
    pub mail_unread: usize,
    pub mail_urgent: usize,
}

impl Counters {
    pub fn agents(&self, agent_type: AgentType) -> usize {
        self.by_type.get(&agent_type).copied().unwrap_or(0)
    }

    pub fn state(&self, state: StatusKind) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }

    pub fn alerts(&self, severity: Severity) -> usize {
        self.alerts.get(&severity).copied().unwrap_or(0)
    }

    pub fn total_agents(&self) -> usize {
        self.by_type.values().sum()
    }
}
