//! Routing scores: who should take the next task
//!
//! Score in `[0, 1]`: a base by state, scaled by context headroom, with a
//! small penalty for agents still streaming tokens.

use serde::Serialize;

use crate::panes::PaneId;
use crate::state::agent::HealthStatus;
use crate::state::AgentSnapshot;
use crate::status::StatusKind;

/// Headroom factor when the context window is unknown
const UNKNOWN_HEADROOM: f64 = 0.8;

/// Velocity (tokens/s) at which the busy penalty saturates
const VELOCITY_SATURATION: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingScore {
    pub pane_id: PaneId,
    pub name: String,
    pub score: f64,
    pub reason: String,
}

fn state_base(state: StatusKind) -> f64 {
    match state {
        StatusKind::Idle => 1.0,
        StatusKind::Working => 0.4,
        StatusKind::Compacted => 0.3,
        StatusKind::Unknown => 0.2,
        StatusKind::RateLimited => 0.05,
        StatusKind::Error => 0.0,
    }
}

pub fn score(agent: &AgentSnapshot) -> f64 {
    if agent.health == HealthStatus::Error {
        return 0.0;
    }
    let headroom = if agent.context_limit > 0 {
        (1.0 - agent.context_percent / 100.0).clamp(0.1, 1.0)
    } else {
        UNKNOWN_HEADROOM
    };
    let busy = (agent.token_velocity / VELOCITY_SATURATION).clamp(0.0, 1.0) * 0.2;
    (state_base(agent.state) * headroom * (1.0 - busy)).clamp(0.0, 1.0)
}

/// Scores for every agent, best first
pub fn compute(agents: &[AgentSnapshot]) -> Vec<RoutingScore> {
    let mut scores: Vec<RoutingScore> = agents
        .iter()
        .map(|a| RoutingScore {
            pane_id: a.pane_id.clone(),
            name: a.display_name().to_string(),
            score: score(a),
            reason: if a.context_limit > 0 {
                format!("{}, {:.0}% context", a.state, a.context_percent)
            } else {
                a.state.to_string()
            },
        })
        .collect();
    scores.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.pane_id.cmp(&b.pane_id)));
    scores
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::panes::AgentType;

    pub(crate) fn snapshot(pane_id: &str, state: StatusKind, pct: f64) -> AgentSnapshot {
        AgentSnapshot {
            pane_id: pane_id.into(),
            index: 0,
            title: format!("proj__cc_{pane_id}"),
            agent_type: AgentType::Claude,
            agent_name: None,
            state,
            error_kind: None,
            health: HealthStatus::Ok,
            context_percent: pct,
            context_limit: 200_000,
            token_velocity: 0.0,
            last_activity: None,
            stalled: false,
        }
    }

    #[test]
    fn test_idle_with_headroom_ranks_first() {
        let agents = vec![
            snapshot("%1", StatusKind::Working, 10.0),
            snapshot("%2", StatusKind::Idle, 80.0),
            snapshot("%3", StatusKind::Idle, 10.0),
            snapshot("%4", StatusKind::Error, 0.0),
        ];
        let scores = compute(&agents);
        let order: Vec<&str> = scores.iter().map(|s| s.pane_id.as_str()).collect();
        assert_eq!(order, vec!["%3", "%2", "%1", "%4"]);
        assert_eq!(scores[3].score, 0.0);
    }

    #[test]
    fn test_streaming_agent_penalized() {
        let calm = snapshot("%1", StatusKind::Working, 10.0);
        let mut busy = calm.clone();
        busy.token_velocity = 100.0;
        assert!(score(&busy) < score(&calm));
    }
}
