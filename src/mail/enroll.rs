//! Registering session panes and the coordinator with Agent Mail
//!
//! Agent panes get an Agent Mail name the first time they are seen; the name
//! is written to the session registry under both the pane title and the pane
//! id. A pane that reappears under a new id keeps its name through the title.
//! Registration failures for one pane are logged and retried on the next pass.

use chrono::{DateTime, Utc};

use super::registry::{RegistryStore, SessionAgentInfo, SessionAgentRegistry};
use super::types::AgentRegistration;
use super::AgentMail;
use crate::context::FetchContext;
use crate::errors::Result;
use crate::panes::Pane;

/// Registration request for one agent pane
fn pane_registration(session: &str, pane: &Pane) -> AgentRegistration {
    AgentRegistration {
        program: pane.agent_type.as_str().to_string(),
        model: pane
            .variant
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        name: None,
        task_description: Some(format!("{} in tmux session {session}", pane.title)),
    }
}

/// Bring the session registry in line with the live agent panes
///
/// Returns the registry as saved. Nothing is written when every pane is
/// already known under its current id.
pub async fn enroll_panes(
    ctx: &FetchContext,
    mail: &dyn AgentMail,
    store: &RegistryStore,
    session: &str,
    project_key: &str,
    panes: &[Pane],
    now: DateTime<Utc>,
) -> Result<SessionAgentRegistry> {
    let _guard = store.lock().await;
    let mut registry = store
        .load_registry(session, project_key)?
        .unwrap_or_else(|| SessionAgentRegistry::new(session, project_key, now));
    let mut changed = false;
    let mut project_ready = false;

    for pane in panes.iter().filter(|p| p.is_agent()) {
        if let Some(name) = registry.lookup(&pane.title, &pane.id).map(str::to_string) {
            let bound = registry.agents.get(&pane.title) == Some(&name)
                && registry.pane_id_map.get(&pane.id) == Some(&name);
            if !bound {
                registry.insert(&pane.title, &pane.id, &name, now);
                changed = true;
            }
            continue;
        }
        if !project_ready {
            mail.ensure_project(ctx, project_key).await?;
            project_ready = true;
        }
        match mail
            .register_agent(ctx, project_key, &pane_registration(session, pane))
            .await
        {
            Ok(agent) => {
                tracing::info!(pane_id = %pane.id, title = %pane.title, agent = %agent.name, "Registered pane agent");
                registry.insert(&pane.title, &pane.id, &agent.name, now);
                changed = true;
            }
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                tracing::warn!(pane_id = %pane.id, error = %e, "Failed to register pane agent");
            }
        }
    }

    // Pane ids are not reused across panes, so stale ids only mislead lookups.
    // An empty pane list means the session has not been listed yet.
    let before = registry.pane_id_map.len();
    if !panes.is_empty() {
        registry
            .pane_id_map
            .retain(|id, _| panes.iter().any(|p| &p.id == id));
    }
    if registry.pane_id_map.len() != before {
        registry.updated_at = now;
        changed = true;
    }

    if changed {
        store.save_registry(&registry)?;
    }
    Ok(registry)
}

/// The coordinator's own Agent Mail name, registering it on first use
pub async fn ensure_identity(
    ctx: &FetchContext,
    mail: &dyn AgentMail,
    store: &RegistryStore,
    session: &str,
    project_key: &str,
) -> Result<String> {
    let _guard = store.lock().await;
    if let Some(info) = store.load_agent_info(session, project_key)? {
        return Ok(info.agent_name);
    }
    let now = Utc::now();
    mail.ensure_project(ctx, project_key).await?;
    let registration = AgentRegistration {
        program: "ntm".to_string(),
        model: "coordinator".to_string(),
        name: None,
        task_description: Some(format!("Coordinator for session {session}")),
    };
    let agent = mail.register_agent(ctx, project_key, &registration).await?;
    store.save_agent_info(
        session,
        &SessionAgentInfo {
            agent_name: agent.name.clone(),
            project_key: project_key.to_string(),
            registered_at: now,
            last_active_at: now,
        },
    )?;
    tracing::info!(agent = %agent.name, session = %session, "Registered coordinator identity");
    Ok(agent.name)
}
