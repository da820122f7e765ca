//! User and follow-up actions that talk to tmux or Agent Mail
//!
//! Each action runs on its own task under a short deadline and reports an
//! [`ActionOutcome`] back through the event channel.

use super::App;
use crate::context::FetchContext;
use crate::coordination::conflicts;
use crate::errors::NtmError;
use crate::event::{ActionOutcome, Event, UserAction};
use crate::mail::{enroll, AgentMail, Importance, OutgoingMessage};
use crate::refresh::Collaborators;
use crate::state::RecoveryAction;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Deadline for one user action
const ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Prompt sent to an agent after its context was compacted
pub const RECOVERY_PROMPT: &str = "Your context was just compacted. Re-read AGENTS.md, \
re-check your current bead and the files you were editing, then continue where you left off.";

/// Send the recovery prompt through Agent Mail, typing it into the pane
/// when the agent has no mail name or the send fails
async fn deliver_recovery(
    ctx: &FetchContext,
    collab: &Collaborators,
    recovery: &RecoveryAction,
    known_name: Option<String>,
) -> Result<String, NtmError> {
    if let Some(mail) = &collab.mail {
        let name = match known_name {
            Some(name) => Some(name),
            None => registered_name(collab, recovery),
        };
        match name {
            Some(name) => match mail_recovery(ctx, collab, mail.as_ref(), recovery, &name).await {
                Ok(()) => return Ok(format!("Recovery message sent to {name}")),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    tracing::warn!(pane_id = %recovery.pane_id, agent = %name, error = %e, "Recovery mail failed, typing prompt into pane");
                }
            },
            None => {
                tracing::info!(pane_id = %recovery.pane_id, "Pane has no Agent Mail name, typing recovery prompt");
            }
        }
    }
    collab.mux.send_text(ctx, &recovery.pane_id, RECOVERY_PROMPT).await?;
    Ok(format!("Recovery prompt sent to {}", recovery.title))
}

fn registered_name(collab: &Collaborators, recovery: &RecoveryAction) -> Option<String> {
    match collab.registry.load_registry(&collab.session, &collab.project_key) {
        Ok(registry) => registry?
            .lookup(&recovery.title, &recovery.pane_id)
            .map(str::to_string),
        Err(e) => {
            tracing::debug!(error = %e, "Could not read session registry");
            None
        }
    }
}

async fn mail_recovery(
    ctx: &FetchContext,
    collab: &Collaborators,
    mail: &dyn AgentMail,
    recovery: &RecoveryAction,
    name: &str,
) -> Result<(), NtmError> {
    let sender = enroll::ensure_identity(
        ctx,
        mail,
        &collab.registry,
        &collab.session,
        &collab.project_key,
    )
    .await?;
    let message = OutgoingMessage::new(
        sender,
        vec![name.to_string()],
        format!("[recovery] {} context compacted", recovery.title),
        RECOVERY_PROMPT,
    )
    .importance(Importance::High);
    mail.send_message(ctx, &collab.project_key, &message).await?;
    Ok(())
}

impl App {
    fn spawn_action<F>(&mut self, action: UserAction, pane_id: Option<String>, fut: F)
    where
        F: Future<Output = Result<String, NtmError>> + Send + 'static,
    {
        let tx = self.event_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let result = fut.await;
            let outcome = ActionOutcome {
                action,
                pane_id,
                result,
            };
            if tx.send(Event::ActionDone(outcome)).await.is_err() {
                tracing::debug!(action = action.label(), "Update loop gone, dropping action outcome");
            }
        }));
    }

    /// Nudge a freshly compacted agent to reload its context
    pub(crate) fn send_recovery(&mut self, recovery: RecoveryAction) {
        tracing::info!(pane_id = %recovery.pane_id, title = %recovery.title, "Sending compaction recovery");
        let collab = Arc::clone(&self.collab);
        let known_name = self.state.agent_names.get(&recovery.pane_id).cloned();
        let pane_id = recovery.pane_id.clone();
        self.spawn_action(UserAction::Recovery, Some(pane_id), async move {
            let ctx = FetchContext::new(ACTION_TIMEOUT);
            deliver_recovery(&ctx, &collab, &recovery, known_name).await
        });
    }

    /// Manual recovery for the selected pane, ignoring the cooldown
    pub(crate) fn recover_selected(&mut self) {
        let Some(agent) = self.state.selected_agent() else {
            self.show_status("No agent selected");
            return;
        };
        let recovery = RecoveryAction {
            pane_id: agent.pane_id.clone(),
            title: agent.title.clone(),
            detected_at: chrono::Utc::now(),
        };
        self.send_recovery(recovery);
    }

    /// Zoom into the selected pane, or back out if already zoomed
    pub(crate) fn toggle_zoom(&mut self) {
        let mux = self.collab.mux.clone();
        if let Some(pane_id) = self.zoomed.clone() {
            self.leave_zoom();
            // resize-pane -Z toggles, so the same call unzooms
            self.spawn_action(UserAction::Focus, Some(pane_id.clone()), async move {
                let ctx = FetchContext::new(ACTION_TIMEOUT);
                mux.focus_pane(&ctx, &pane_id, true).await?;
                Ok::<_, NtmError>("Back to dashboard".to_string())
            });
            return;
        }
        let Some(pane) = self.state.selected_pane() else {
            self.show_status("No pane selected");
            return;
        };
        let pane_id = pane.id.clone();
        let title = pane.title.clone();
        self.zoomed = Some(pane_id.clone());
        self.orchestrator.set_suspended(true);
        tracing::debug!(pane_id = %pane_id, "Zooming into pane");
        self.spawn_action(UserAction::Focus, Some(pane_id.clone()), async move {
            let ctx = FetchContext::new(ACTION_TIMEOUT);
            mux.focus_pane(&ctx, &pane_id, true).await?;
            Ok::<_, NtmError>(format!("Zoomed into {title} (z to return)"))
        });
    }

    /// Resume refreshing without touching tmux
    pub(crate) fn leave_zoom(&mut self) {
        if self.zoomed.take().is_some() {
            self.orchestrator.set_suspended(false);
            self.orchestrator.request_refresh(None, false);
        }
    }

    /// Force-release the lowest-priority holder of the conflict involving
    /// the selected agent (or the first conflict when none does)
    pub(crate) fn force_release_selected(&mut self) {
        let Some(mail) = self.collab.mail.clone() else {
            self.show_status("Agent Mail is not configured");
            return;
        };
        let found = self.conflicts();
        let selected_name = self
            .state
            .selected
            .as_ref()
            .and_then(|id| self.state.agent_names.get(id))
            .cloned();
        let chosen = selected_name
            .as_deref()
            .and_then(|name| {
                found
                    .iter()
                    .find(|c| c.holders.iter().any(|h| h.agent_name == name))
            })
            .or_else(|| found.first());
        let Some(conflict) = chosen else {
            self.show_status("No reservation conflicts");
            return;
        };
        let Some(holder) = conflict.release_candidate(None).cloned() else {
            self.show_status("Conflict has no releasable holder");
            return;
        };
        let project_key = self.collab.project_key.clone();
        let note = format!(
            "Released from the dashboard to resolve a conflict on {}",
            conflict.path_pattern
        );
        tracing::info!(agent = %holder.agent_name, reservation_id = holder.reservation_id, "Force release requested");
        self.spawn_action(UserAction::ForceRelease, None, async move {
            let ctx = FetchContext::new(ACTION_TIMEOUT);
            conflicts::force_release(&ctx, mail.as_ref(), &project_key, &holder, &note, true).await?;
            Ok::<_, NtmError>(format!(
                "Released {} held by {}",
                holder.path_pattern, holder.agent_name
            ))
        });
        self.orchestrator
            .request_refresh(Some(crate::refresh::SourceId::MailStatus), false);
    }

    /// Acknowledge the selected agent's messages that ask for it and mark
    /// its unread mail as read
    pub(crate) fn acknowledge_selected(&mut self) {
        let Some(mail) = self.collab.mail.clone() else {
            self.show_status("Agent Mail is not configured");
            return;
        };
        let Some(selected) = self.state.selected.clone() else {
            self.show_status("No agent selected");
            return;
        };
        let summary = self
            .state
            .panels
            .mail_inbox
            .data
            .as_ref()
            .and_then(|inbox| inbox.iter().find(|s| s.pane_id.as_deref() == Some(selected.as_str())))
            .cloned();
        let Some(summary) = summary else {
            self.show_status("No inbox for the selected agent");
            return;
        };
        if summary.unread_ids.is_empty() {
            self.show_status(&format!("No unread mail for {}", summary.agent_name));
            return;
        }
        let project_key = self.collab.project_key.clone();
        tracing::info!(agent = %summary.agent_name, unread = summary.unread_ids.len(), acks = summary.pending_acks.len(), "Acknowledging mail");
        self.spawn_action(UserAction::Acknowledge, Some(selected), async move {
            let ctx = FetchContext::new(ACTION_TIMEOUT);
            let agent = summary.agent_name.as_str();
            for id in &summary.pending_acks {
                mail.acknowledge_message(&ctx, &project_key, agent, *id).await?;
            }
            for id in &summary.unread_ids {
                mail.mark_message_read(&ctx, &project_key, agent, *id).await?;
            }
            Ok::<_, NtmError>(format!(
                "Read {} messages for {agent} ({} acknowledged)",
                summary.unread_ids.len(),
                summary.pending_acks.len()
            ))
        });
        self.orchestrator
            .request_refresh(Some(crate::refresh::SourceId::MailInbox), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::{pump_session, test_app, test_app_with_mail};
    use crate::coordination::conflicts::tests::RecordingMail;
    use crate::mail::{
        FallbackMode, HttpMailClient, InboxMessage, InboxSummary, RegistryStore, SessionAgentInfo,
        SessionAgentRegistry,
    };
    use crate::refresh::SourceId;
    use crate::tmux::fake::{raw, FakeMux};
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn next_outcome(rx: &mut tokio::sync::mpsc::Receiver<Event>) -> ActionOutcome {
        loop {
            if let Event::ActionDone(outcome) = rx.recv().await.unwrap() {
                return outcome;
            }
        }
    }

    #[tokio::test]
    async fn test_zoom_suspends_and_returns() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(FakeMux::with_panes(vec![raw("%1", 0, "proj__cc_1", "node")]));
        let (mut app, mut rx) = test_app(mux.clone(), dir.path());
        app.tick();
        pump_session(&mut app, &mut rx).await;

        app.toggle_zoom();
        assert_eq!(app.zoomed.as_deref(), Some("%1"));
        assert!(app.orchestrator.is_suspended());
        let outcome = next_outcome(&mut rx).await;
        assert_eq!(outcome.action, UserAction::Focus);
        assert!(outcome.result.is_ok());
        assert_eq!(mux.focused.lock().unwrap().as_slice(), &[("%1".to_string(), true)]);

        app.toggle_zoom();
        assert!(app.zoomed.is_none());
        assert!(!app.orchestrator.is_suspended());
        assert!(app.orchestrator.source(SourceId::Session).unwrap().pending());
    }

    #[tokio::test]
    async fn test_recovery_without_mail_types_prompt_into_pane() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(FakeMux::with_panes(vec![raw("%1", 0, "proj__cc_1", "node")]));
        let (mut app, mut rx) = test_app(mux.clone(), dir.path());
        app.tick();
        pump_session(&mut app, &mut rx).await;

        app.recover_selected();
        let outcome = next_outcome(&mut rx).await;
        assert_eq!(outcome.pane_id.as_deref(), Some("%1"));
        let sent = mux.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("%1".to_string(), RECOVERY_PROMPT.to_string())]);
    }

    /// Registry maps %1 to BlueLake; the coordinator is already registered
    fn seed_mail_identities(dir: &std::path::Path) {
        let store = RegistryStore::new(dir.join("sessions"), FallbackMode::Strict);
        let key = dir.display().to_string();
        let now = Utc::now();
        let mut registry = SessionAgentRegistry::new("proj", &key, now);
        registry.insert("proj__cc_1", "%1", "BlueLake", now);
        store.save_registry(&registry).unwrap();
        store
            .save_agent_info(
                "proj",
                &SessionAgentInfo {
                    agent_name: "Coordinator".into(),
                    project_key: key,
                    registered_at: now,
                    last_active_at: now,
                },
            )
            .unwrap();
    }

    async fn refresh_session(app: &mut App, rx: &mut tokio::sync::mpsc::Receiver<Event>) {
        app.orchestrator.request_refresh(Some(SourceId::Session), false);
        app.tick();
        pump_session(app, rx).await;
    }

    #[tokio::test]
    async fn test_compaction_recovery_goes_through_agent_mail_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "params": {
                    "name": "send_message",
                    "arguments": {
                        "sender_name": "Coordinator",
                        "to": ["BlueLake"],
                        "subject": "[recovery] proj__cc_1 context compacted",
                        "body_md": RECOVERY_PROMPT,
                        "importance": "high"
                    }
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"structuredContent": {"message_id": 9, "recipients": ["BlueLake"]}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        seed_mail_identities(dir.path());
        let mux = Arc::new(FakeMux::with_panes(vec![raw("%1", 0, "proj__cc_1", "node")]));
        mux.set_text("%1", "Conversation compacted\n> ");
        let mail: Arc<dyn AgentMail> = Arc::new(HttpMailClient::new(&server.uri(), None).unwrap());
        let (mut app, mut rx) = test_app_with_mail(mux.clone(), dir.path(), Some(mail));

        app.tick();
        pump_session(&mut app, &mut rx).await;
        let outcome = next_outcome(&mut rx).await;
        assert_eq!(outcome.action, UserAction::Recovery);
        assert_eq!(outcome.result.as_deref().unwrap(), "Recovery message sent to BlueLake");
        app.handle_event(Event::ActionDone(outcome));
        assert!(app.state.agents["%1"].recovery_sent);

        // Marker scrolls away, then reappears inside the cooldown
        mux.set_text("%1", "Working on it\n> ");
        refresh_session(&mut app, &mut rx).await;
        mux.set_text("%1", "Conversation compacted\n> ");
        refresh_session(&mut app, &mut rx).await;

        app.shutdown(Duration::from_millis(200)).await;
        assert!(mux.sent.lock().unwrap().is_empty());
        let sends = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| String::from_utf8_lossy(&r.body).contains("send_message"))
            .count();
        assert_eq!(sends, 1);
    }

    #[tokio::test]
    async fn test_recovery_falls_back_to_pane_when_agent_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(FakeMux::with_panes(vec![raw("%1", 0, "proj__cc_1", "node")]));
        let mail: Arc<dyn AgentMail> = Arc::new(HttpMailClient::new(&server.uri(), None).unwrap());
        let (mut app, mut rx) = test_app_with_mail(mux.clone(), dir.path(), Some(mail));
        app.tick();
        pump_session(&mut app, &mut rx).await;

        app.recover_selected();
        let outcome = next_outcome(&mut rx).await;
        assert!(outcome.result.unwrap().contains("proj__cc_1"));
        let sent = mux.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("%1".to_string(), RECOVERY_PROMPT.to_string())]);
    }

    #[tokio::test]
    async fn test_acknowledge_selected_agent_mail() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(FakeMux::with_panes(vec![raw("%1", 0, "proj__cc_1", "node")]));
        let mail = Arc::new(RecordingMail::default());
        let client: Arc<dyn AgentMail> = mail.clone();
        let (mut app, mut rx) = test_app_with_mail(mux, dir.path(), Some(client));
        app.tick();
        pump_session(&mut app, &mut rx).await;

        let inbox = vec![
            InboxMessage {
                id: 11,
                subject: "Please confirm".into(),
                from: "Coordinator".into(),
                created_at: Utc::now(),
                importance: Importance::High,
                ack_required: true,
                read: false,
                body_md: None,
            },
            InboxMessage {
                id: 12,
                subject: "FYI".into(),
                from: "GreenHill".into(),
                created_at: Utc::now(),
                importance: Importance::Normal,
                ack_required: false,
                read: false,
                body_md: None,
            },
        ];
        app.state.panels.mail_inbox.set(
            vec![InboxSummary::from_messages("BlueLake", Some("%1".into()), &inbox)],
            Utc::now(),
        );

        app.acknowledge_selected();
        let outcome = next_outcome(&mut rx).await;
        assert_eq!(outcome.action, UserAction::Acknowledge);
        assert!(outcome.result.is_ok());
        assert_eq!(mail.acknowledged.lock().unwrap().as_slice(), &[("BlueLake".to_string(), 11)]);
        let mut read = mail.marked_read.lock().unwrap().clone();
        read.sort();
        assert_eq!(read, vec![("BlueLake".to_string(), 11), ("BlueLake".to_string(), 12)]);
        assert!(app.orchestrator.source(SourceId::MailInbox).unwrap().pending());
    }

    #[tokio::test]
    async fn test_outcome_after_update_loop_gone_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, rx) = test_app(Arc::new(FakeMux::default()), dir.path());
        drop(rx);
        app.spawn_action(UserAction::Focus, None, async { Ok::<_, NtmError>("done".to_string()) });
        let task = app.tasks.pop().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_force_release_without_mail() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx) = test_app(Arc::new(FakeMux::default()), dir.path());
        app.force_release_selected();
        let (msg, _) = app.status_message.clone().unwrap();
        assert!(msg.contains("not configured"));
    }
}
