//! Periodic markdown digest for the human operator

use chrono::{DateTime, Utc};

use super::conflicts::Conflict;
use crate::state::AgentSnapshot;
use crate::status::StatusKind;

pub fn compose_digest(
    session: &str,
    agents: &[AgentSnapshot],
    conflicts: &[Conflict],
    now: DateTime<Utc>,
) -> (String, String) {
    let count = |kind: StatusKind| agents.iter().filter(|a| a.state == kind).count();
    let subject = format!(
        "[digest] {session}: {} working, {} idle, {} error",
        count(StatusKind::Working),
        count(StatusKind::Idle),
        count(StatusKind::Error)
    );

    let mut body = format!("## Session `{session}` at {}\n\n", now.format("%Y-%m-%d %H:%M UTC"));
    body.push_str("| Agent | State | Context | Health |\n|---|---|---|---|\n");
    for a in agents {
        let context = if a.context_limit > 0 {
            format!("{:.0}%", a.context_percent)
        } else {
            "-".to_string()
        };
        body.push_str(&format!(
            "| {} | {} | {} | {:?} |\n",
            a.display_name(),
            a.state,
            context,
            a.health
        ));
    }

    let stalled: Vec<&str> = agents.iter().filter(|a| a.stalled).map(|a| a.display_name()).collect();
    if !stalled.is_empty() {
        body.push_str(&format!("\n**Stalled:** {}\n", stalled.join(", ")));
    }
    if !conflicts.is_empty() {
        body.push_str("\n### Reservation conflicts\n\n");
        for c in conflicts {
            body.push_str(&format!("- `{}`: {}\n", c.path_pattern, c.holder_names().join(", ")));
        }
    }
    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::conflicts::tests::{reservation, t};
    use crate::coordination::conflicts::detect_conflicts;
    use crate::sources::routing::tests::snapshot;

    #[test]
    fn test_digest_counts_and_conflicts() {
        let mut stalled = snapshot("%2", StatusKind::Working, 40.0);
        stalled.stalled = true;
        let agents = vec![snapshot("%1", StatusKind::Idle, 10.0), stalled];
        let conflicts = detect_conflicts(
            &[reservation(1, "A", "src/", 0), reservation(2, "B", "src/", 0)],
            t(10),
            |_| 5,
        );
        let (subject, body) = compose_digest("proj", &agents, &conflicts, t(10));
        assert_eq!(subject, "[digest] proj: 1 working, 1 idle, 0 error");
        assert!(body.contains("**Stalled:** proj__cc_%2"));
        assert!(body.contains("`src/`: A, B"));
    }
}
