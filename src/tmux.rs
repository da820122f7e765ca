//! Tmux integration for the dashboard
//!
//! Provides the three multiplexer operations the refresh engine consumes:
//! - Listing panes of a session with per-pane last activity
//! - Capturing the tail of a pane's visible text
//! - Focusing/zooming a pane (and sending keys for recovery fallback)
//!
//! Key patterns:
//! - `list-panes -s` covers every window of the session
//! - Enter must be a separate argument to send-keys
//! - Use load-buffer + paste-buffer for long/multi-line content

use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::context::FetchContext;
use crate::errors::{NtmError, Result};

/// Field separator for `list-panes -F` output
const FIELD_SEP: char = '\t';

/// Format string for `list-panes`
const LIST_FORMAT: &str = "#{pane_id}\t#{pane_index}\t#{pane_title}\t#{pane_width}\t#{pane_height}\t#{pane_current_command}\t#{pane_activity}";

/// One pane as reported by the multiplexer, before agent classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPane {
    pub id: String,
    pub index: u32,
    pub title: String,
    pub width: u16,
    pub height: u16,
    pub command: String,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Multiplexer operations consumed by the core
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// List every pane in `session`
    async fn list_panes(&self, ctx: &FetchContext, session: &str) -> Result<Vec<RawPane>>;

    /// Capture up to `max_lines` of the pane's text
    async fn capture_pane(&self, ctx: &FetchContext, pane_id: &str, max_lines: usize)
        -> Result<String>;

    /// Focus a pane, optionally toggling zoom
    async fn focus_pane(&self, ctx: &FetchContext, pane_id: &str, zoom: bool) -> Result<()>;

    /// Paste `text` into a pane and press Enter
    async fn send_text(&self, ctx: &FetchContext, pane_id: &str, text: &str) -> Result<()>;
}

/// Controller for tmux operations
///
/// All methods shell out to the tmux CLI (no libtmux/ffi). Child processes are
/// killed when the owning future is dropped, so cancellation never leaks a
/// stuck `tmux` process.
#[derive(Debug, Clone)]
pub struct TmuxClient {
    binary: String,
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
        }
    }
}

impl TmuxClient {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run tmux with `args`, returning stdout on success
    async fn exec(&self, ctx: &FetchContext, op: &str, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = ctx
            .run(op, async {
                cmd.output().await.map_err(|e| spawn_error(&self.binary, e))
            })
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_stderr(op, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Multiplexer for TmuxClient {
    async fn list_panes(&self, ctx: &FetchContext, session: &str) -> Result<Vec<RawPane>> {
        let target = format!("={session}");
        let stdout = self
            .exec(ctx, "list-panes", &["list-panes", "-s", "-t", &target, "-F", LIST_FORMAT])
            .await
            .map_err(|e| match e {
                NtmError::NotFound { .. } => NtmError::SessionNotFound(session.to_string()),
                other => other,
            })?;

        let panes: Vec<RawPane> = stdout.lines().filter_map(parse_pane_line).collect();
        tracing::trace!(session = %session, count = panes.len(), "Listed panes");
        Ok(panes)
    }

    async fn capture_pane(
        &self,
        ctx: &FetchContext,
        pane_id: &str,
        max_lines: usize,
    ) -> Result<String> {
        let start = format!("-{}", max_lines.max(1));
        self.exec(
            ctx,
            "capture-pane",
            &["capture-pane", "-p", "-J", "-t", pane_id, "-S", &start],
        )
        .await
    }

    async fn focus_pane(&self, ctx: &FetchContext, pane_id: &str, zoom: bool) -> Result<()> {
        self.exec(ctx, "select-pane", &["select-pane", "-t", pane_id])
            .await?;
        if zoom {
            self.exec(ctx, "resize-pane", &["resize-pane", "-Z", "-t", pane_id])
                .await?;
        }
        tracing::debug!(pane_id = %pane_id, zoom = zoom, "Focused pane");
        Ok(())
    }

    async fn send_text(&self, ctx: &FetchContext, pane_id: &str, text: &str) -> Result<()> {
        // load-buffer from stdin avoids escaping issues with long prompts
        let binary = self.binary.clone();
        let content = text.to_string();
        ctx.run("load-buffer", async move {
            let mut child = Command::new(&binary)
                .args(["load-buffer", "-"])
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| spawn_error(&binary, e))?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(content.as_bytes())
                    .await
                    .map_err(|e| NtmError::transport("load-buffer", e))?;
            }
            let output = child
                .wait_with_output()
                .await
                .map_err(|e| NtmError::transport("load-buffer", e))?;
            if !output.status.success() {
                return Err(classify_stderr(
                    "load-buffer",
                    &String::from_utf8_lossy(&output.stderr),
                ));
            }
            Ok(())
        })
        .await?;

        self.exec(ctx, "paste-buffer", &["paste-buffer", "-t", pane_id])
            .await?;
        self.exec(ctx, "send-keys", &["send-keys", "-t", pane_id, "Enter"])
            .await?;

        tracing::debug!(pane_id = %pane_id, content_len = text.len(), "Sent text to pane");
        Ok(())
    }
}

fn spawn_error(binary: &str, e: std::io::Error) -> NtmError {
    if e.kind() == std::io::ErrorKind::NotFound {
        NtmError::unavailable(binary)
    } else {
        NtmError::transport(binary, e)
    }
}

/// Map tmux stderr to a stable error code
fn classify_stderr(op: &str, stderr: &str) -> NtmError {
    let lower = stderr.to_lowercase();
    if lower.contains("can't find session")
        || lower.contains("session not found")
        || lower.contains("can't find pane")
        || lower.contains("can't find window")
    {
        return NtmError::NotFound {
            op: op.to_string(),
            what: stderr.trim().to_string(),
        };
    }
    if lower.contains("no server running") || lower.contains("error connecting") {
        return NtmError::transport(op, stderr.trim());
    }
    NtmError::unknown(op, stderr.trim())
}

/// Parse one `list-panes` line in [`LIST_FORMAT`]
///
/// Returns None for malformed lines (fewer fields, non-numeric index).
pub fn parse_pane_line(line: &str) -> Option<RawPane> {
    let parts: Vec<&str> = line.split(FIELD_SEP).collect();
    if parts.len() < 7 {
        return None;
    }
    let index = parts[1].trim().parse().ok()?;
    let last_activity = parts[6]
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|ts| *ts > 0)
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

    Some(RawPane {
        id: parts[0].trim().to_string(),
        index,
        title: parts[2].to_string(),
        width: parts[3].trim().parse().unwrap_or(0),
        height: parts[4].trim().parse().unwrap_or(0),
        command: parts[5].trim().to_string(),
        last_activity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_parse_pane_line() {
        let line = "%3\t2\tmyproj__cc_1\t120\t40\tnode\t1700000000";
        let pane = parse_pane_line(line).unwrap();
        assert_eq!(pane.id, "%3");
        assert_eq!(pane.index, 2);
        assert_eq!(pane.title, "myproj__cc_1");
        assert_eq!(pane.width, 120);
        assert_eq!(pane.height, 40);
        assert_eq!(pane.command, "node");
        assert_eq!(pane.last_activity.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_pane_line_keeps_tabs_out_of_title() {
        assert!(parse_pane_line("%1\tx\ttitle\t1\t1\tbash\t0").is_none());
        assert!(parse_pane_line("%1\t0\ttitle").is_none());

        let pane = parse_pane_line("%1\t0\t\t80\t24\tzsh\t0").unwrap();
        assert_eq!(pane.title, "");
        assert!(pane.last_activity.is_none());
    }

    #[test]
    fn test_classify_stderr() {
        let err = classify_stderr("list-panes", "can't find session: =nope\n");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = classify_stderr("list-panes", "no server running on /tmp/tmux-1000/default");
        assert_eq!(err.kind(), ErrorKind::Transport);

        let err = classify_stderr("capture-pane", "something odd");
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let client = TmuxClient::new("definitely-not-a-tmux-binary-ntm");
        let ctx = FetchContext::new(std::time::Duration::from_secs(2));
        let err = client.list_panes(&ctx, "main").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }
}

/// In-memory multiplexer shared by tests across the crate
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{Multiplexer, RawPane};
    use crate::context::FetchContext;
    use crate::errors::{NtmError, Result};

    #[derive(Default)]
    pub(crate) struct FakeMux {
        pub panes: Mutex<Vec<RawPane>>,
        pub texts: Mutex<HashMap<String, String>>,
        pub sent: Mutex<Vec<(String, String)>>,
        pub focused: Mutex<Vec<(String, bool)>>,
        pub list_error: Mutex<Option<NtmError>>,
    }

    pub(crate) fn raw(id: &str, index: u32, title: &str, command: &str) -> RawPane {
        RawPane {
            id: id.into(),
            index,
            title: title.into(),
            width: 120,
            height: 40,
            command: command.into(),
            last_activity: None,
        }
    }

    impl FakeMux {
        pub(crate) fn with_panes(panes: Vec<RawPane>) -> Self {
            let mux = Self::default();
            *mux.panes.lock().unwrap() = panes;
            mux
        }

        pub(crate) fn set_text(&self, pane_id: &str, text: &str) {
            self.texts.lock().unwrap().insert(pane_id.into(), text.into());
        }
    }

    #[async_trait]
    impl Multiplexer for FakeMux {
        async fn list_panes(&self, _ctx: &FetchContext, _session: &str) -> Result<Vec<RawPane>> {
            if let Some(err) = self.list_error.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(self.panes.lock().unwrap().clone())
        }

        async fn capture_pane(&self, _ctx: &FetchContext, pane_id: &str, _max_lines: usize) -> Result<String> {
            Ok(self.texts.lock().unwrap().get(pane_id).cloned().unwrap_or_default())
        }

        async fn focus_pane(&self, _ctx: &FetchContext, pane_id: &str, zoom: bool) -> Result<()> {
            self.focused.lock().unwrap().push((pane_id.into(), zoom));
            Ok(())
        }

        async fn send_text(&self, _ctx: &FetchContext, pane_id: &str, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push((pane_id.into(), text.into()));
            Ok(())
        }
    }
}
