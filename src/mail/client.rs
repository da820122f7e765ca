//! Agent Mail JSON-RPC client
//!
//! Every operation is a `tools/call` request:
//!
//! ```text
//! {"jsonrpc":"2.0","method":"tools/call","params":{"name":<tool>,"arguments":{...}},"id":N}
//! ```
//!
//! Servers answer with either a bare `result` or a tool envelope
//! `{content:[{type:"text",text}], structuredContent, isError}`. The envelope
//! is unwrapped here so callers only ever see the tool's own payload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use url::Url;

use super::types::{
    AgentRegistration, FileReservation, InboxMessage, OutgoingMessage, ProjectInfo,
    RegisteredAgent, SendReceipt,
};
use crate::context::FetchContext;
use crate::errors::{NtmError, Result};

/// Default Agent Mail endpoint
pub const DEFAULT_URL: &str = "http://127.0.0.1:8765/mcp/";

#[async_trait]
pub trait AgentMail: Send + Sync {
    async fn ensure_project(&self, ctx: &FetchContext, project_key: &str) -> Result<ProjectInfo>;

    async fn register_agent(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        registration: &AgentRegistration,
    ) -> Result<RegisteredAgent>;

    async fn list_file_reservations(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        agent: Option<&str>,
        all_agents: bool,
    ) -> Result<Vec<FileReservation>>;

    async fn send_message(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        message: &OutgoingMessage,
    ) -> Result<SendReceipt>;

    async fn force_release_file_reservation(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        agent: &str,
        reservation_id: i64,
        note: &str,
        notify: bool,
    ) -> Result<()>;

    async fn fetch_inbox(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        agent: &str,
        limit: usize,
        include_bodies: bool,
    ) -> Result<Vec<InboxMessage>>;

    async fn mark_message_read(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        agent: &str,
        message_id: i64,
    ) -> Result<()>;

    async fn acknowledge_message(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        agent: &str,
        message_id: i64,
    ) -> Result<()>;

    async fn health_check(&self, ctx: &FetchContext) -> Result<()>;
}

/// HTTP implementation of [`AgentMail`]
pub struct HttpMailClient {
    http: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
    next_id: AtomicU64,
}

impl HttpMailClient {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| NtmError::Validation(format!("invalid mail url '{endpoint}': {e}")))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .map_err(|e| NtmError::transport("mail client", e))?;
        Ok(Self {
            http,
            endpoint,
            token: token.filter(|t| !t.trim().is_empty()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Invoke one tool and return its unwrapped payload
    pub async fn call_tool(&self, ctx: &FetchContext, name: &str, arguments: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments },
            "id": id,
        });

        let mut req = self.http.post(self.endpoint.clone()).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let (status, text) = ctx
            .run(name, async {
                let resp = req
                    .send()
                    .await
                    .map_err(|e| NtmError::transport(name, e))?;
                let status = resp.status().as_u16();
                let text = resp
                    .text()
                    .await
                    .map_err(|e| NtmError::transport(name, e))?;
                Ok((status, text))
            })
            .await?;

        if !(200..300).contains(&status) {
            return Err(NtmError::from_status(name, status, &text));
        }

        let envelope: Value = serde_json::from_str(&text)
            .map_err(|e| NtmError::Validation(format!("{name}: invalid JSON-RPC response: {e}")))?;

        if let Some(err) = envelope.get("error").filter(|e| !e.is_null()) {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            tracing::debug!(tool = %name, error = %message, "Agent Mail RPC error");
            return Err(NtmError::unknown(name, message));
        }

        let result = envelope.get("result").cloned().unwrap_or(Value::Null);
        unwrap_envelope(name, result)
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        ctx: &FetchContext,
        name: &str,
        arguments: Value,
    ) -> Result<T> {
        let value = self.call_tool(ctx, name, arguments).await?;
        serde_json::from_value(value)
            .map_err(|e| NtmError::Validation(format!("{name}: unexpected payload: {e}")))
    }
}

/// Strip the tool-call envelope, surfacing `isError` text as the error message
pub fn unwrap_envelope(op: &str, result: Value) -> Result<Value> {
    let Some(obj) = result.as_object() else {
        return Ok(result);
    };

    let is_envelope = obj.contains_key("content")
        || obj.contains_key("structuredContent")
        || obj.contains_key("isError");
    if !is_envelope {
        return Ok(result);
    }

    let text = obj
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if obj.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        let message = if text.is_empty() {
            "tool reported an error".to_string()
        } else {
            text
        };
        return Err(NtmError::unknown(op, message));
    }

    if let Some(structured) = obj.get("structuredContent").filter(|v| !v.is_null()) {
        return Ok(structured.clone());
    }

    if text.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Accept either a bare array or an object wrapping it under `key`
fn list_field(value: Value, key: &str) -> Value {
    match value {
        Value::Object(mut map) => map.remove(key).unwrap_or(Value::Array(Vec::new())),
        Value::Null => Value::Array(Vec::new()),
        other => other,
    }
}

#[async_trait]
impl AgentMail for HttpMailClient {
    async fn ensure_project(&self, ctx: &FetchContext, project_key: &str) -> Result<ProjectInfo> {
        self.call_typed(ctx, "ensure_project", json!({ "human_key": project_key }))
            .await
    }

    async fn register_agent(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        registration: &AgentRegistration,
    ) -> Result<RegisteredAgent> {
        let mut args = serde_json::to_value(registration)?;
        if let Some(map) = args.as_object_mut() {
            map.insert("project_key".to_string(), json!(project_key));
        }
        self.call_typed(ctx, "register_agent", args).await
    }

    async fn list_file_reservations(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        agent: Option<&str>,
        all_agents: bool,
    ) -> Result<Vec<FileReservation>> {
        let mut args = json!({ "project_key": project_key, "all_agents": all_agents });
        if let (Some(agent), Some(map)) = (agent, args.as_object_mut()) {
            map.insert("agent_name".to_string(), json!(agent));
        }
        let value = self
            .call_tool(ctx, "list_file_reservations", args)
            .await?;
        serde_json::from_value(list_field(value, "reservations")).map_err(|e| {
            NtmError::Validation(format!("list_file_reservations: unexpected payload: {e}"))
        })
    }

    async fn send_message(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        message: &OutgoingMessage,
    ) -> Result<SendReceipt> {
        let mut args = serde_json::to_value(message)?;
        if let Some(map) = args.as_object_mut() {
            map.insert("project_key".to_string(), json!(project_key));
        }
        let value = self.call_tool(ctx, "send_message", args).await?;
        tracing::debug!(
            subject = %message.subject,
            recipients = message.to.len(),
            importance = message.importance.as_str(),
            "Sent Agent Mail message"
        );
        // Some servers answer with nothing beyond the envelope
        if value.is_null() {
            return Ok(SendReceipt::default());
        }
        serde_json::from_value(value)
            .map_err(|e| NtmError::Validation(format!("send_message: unexpected payload: {e}")))
    }

    async fn force_release_file_reservation(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        agent: &str,
        reservation_id: i64,
        note: &str,
        notify: bool,
    ) -> Result<()> {
        self.call_tool(
            ctx,
            "force_release_file_reservation",
            json!({
                "project_key": project_key,
                "agent_name": agent,
                "file_reservation_id": reservation_id,
                "note": note,
                "notify_previous": notify,
            }),
        )
        .await?;
        Ok(())
    }

    async fn fetch_inbox(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        agent: &str,
        limit: usize,
        include_bodies: bool,
    ) -> Result<Vec<InboxMessage>> {
        let value = self
            .call_tool(
                ctx,
                "fetch_inbox",
                json!({
                    "project_key": project_key,
                    "agent_name": agent,
                    "limit": limit,
                    "include_bodies": include_bodies,
                }),
            )
            .await?;
        serde_json::from_value(list_field(value, "messages"))
            .map_err(|e| NtmError::Validation(format!("fetch_inbox: unexpected payload: {e}")))
    }

    async fn mark_message_read(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        agent: &str,
        message_id: i64,
    ) -> Result<()> {
        self.call_tool(
            ctx,
            "mark_message_read",
            json!({ "project_key": project_key, "agent_name": agent, "message_id": message_id }),
        )
        .await?;
        Ok(())
    }

    async fn acknowledge_message(
        &self,
        ctx: &FetchContext,
        project_key: &str,
        agent: &str,
        message_id: i64,
    ) -> Result<()> {
        self.call_tool(
            ctx,
            "acknowledge_message",
            json!({ "project_key": project_key, "agent_name": agent, "message_id": message_id }),
        )
        .await?;
        Ok(())
    }

    async fn health_check(&self, ctx: &FetchContext) -> Result<()> {
        self.call_tool(ctx, "health_check", json!({})).await?;
        Ok(())
    }
}
