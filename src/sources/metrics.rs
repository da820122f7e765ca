//! Fleet metrics for the metrics panel

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AgentSnapshot;
use crate::status::StatusKind;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub agents: usize,
    /// Agent type alias → count
    pub by_type: BTreeMap<String, usize>,
    pub working: usize,
    pub idle: usize,
    pub errors: usize,
    /// Over agents with a known context window
    pub avg_context_percent: f64,
    pub max_context_percent: f64,
    /// Sum of token velocities, tokens/s
    pub total_velocity: f64,
    pub collected_at: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    /// Share of agents currently working
    pub fn utilization(&self) -> f64 {
        if self.agents == 0 {
            return 0.0;
        }
        self.working as f64 / self.agents as f64
    }
}

pub fn compute_metrics(agents: &[AgentSnapshot], now: DateTime<Utc>) -> MetricsSnapshot {
    let mut m = MetricsSnapshot {
        agents: agents.len(),
        collected_at: Some(now),
        ..MetricsSnapshot::default()
    };
    let mut known = 0usize;
    let mut sum = 0.0;
    for a in agents {
        *m.by_type.entry(a.agent_type.alias().to_string()).or_default() += 1;
        match a.state {
            StatusKind::Working => m.working += 1,
            StatusKind::Idle => m.idle += 1,
            StatusKind::Error => m.errors += 1,
            _ => {}
        }
        if a.context_limit > 0 {
            known += 1;
            sum += a.context_percent;
            m.max_context_percent = m.max_context_percent.max(a.context_percent);
        }
        m.total_velocity += a.token_velocity;
    }
    if known > 0 {
        m.avg_context_percent = sum / known as f64;
    }
    m
}
