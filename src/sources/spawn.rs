//! Staggered spawn progress from `<project>/.ntm/spawn-state.json`
//!
//! Read-only: `ntm spawn` writes the file while it sends prompts to new
//! panes one at a time. While a spawn is active the dashboard polls faster.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{NtmError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnPrompt {
    #[serde(alias = "pane_id")]
    pub pane: String,
    #[serde(default)]
    pub order: u32,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub sent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnState {
    #[serde(default)]
    pub batch_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub stagger_secs: u64,
    #[serde(default)]
    pub prompts: Vec<SpawnPrompt>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SpawnState {
    /// Prompts still queued and the batch not marked complete
    pub fn is_active(&self) -> bool {
        self.completed_at.is_none() && self.prompts.iter().any(|p| !p.sent)
    }

    pub fn sent(&self) -> usize {
        self.prompts.iter().filter(|p| p.sent).count()
    }

    /// Next unsent prompt and seconds until it goes out
    pub fn next_due(&self, now: DateTime<Utc>) -> Option<(&SpawnPrompt, i64)> {
        self.prompts
            .iter()
            .filter(|p| !p.sent)
            .min_by_key(|p| (p.scheduled_at, p.order))
            .map(|p| (p, (p.scheduled_at - now).num_seconds().max(0)))
    }
}

pub fn spawn_state_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".ntm").join("spawn-state.json")
}

pub async fn load_spawn_state(project_dir: &Path) -> Result<Option<SpawnState>> {
    let path = spawn_state_path(project_dir);
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(NtmError::unknown("spawn state", e)),
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&text)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    const ACTIVE: &str = r#"{
        "batch_id": "b1",
        "started_at": "2026-03-01T10:00:00Z",
        "stagger_secs": 30,
        "prompts": [
            {"pane": "%1", "order": 0, "scheduled_at": "2026-03-01T10:00:00Z", "sent": true},
            {"pane_id": "%2", "order": 1, "scheduled_at": "2026-03-01T10:00:30Z"}
        ]
    }"#;

    #[tokio::test]
    async fn test_active_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".ntm")).unwrap();
        std::fs::write(spawn_state_path(tmp.path()), ACTIVE).unwrap();

        let state = load_spawn_state(tmp.path()).await.unwrap().unwrap();
        assert!(state.is_active());
        assert_eq!(state.sent(), 1);
        let now: DateTime<Utc> = "2026-03-01T10:00:10Z".parse().unwrap();
        let (next, wait) = state.next_due(now).unwrap();
        assert_eq!(next.pane, "%2");
        assert_eq!(wait, 20);
    }

    #[tokio::test]
    async fn test_missing_and_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_spawn_state(tmp.path()).await.unwrap().is_none());

        std::fs::create_dir_all(tmp.path().join(".ntm")).unwrap();
        std::fs::write(spawn_state_path(tmp.path()), "{not json").unwrap();
        let err = load_spawn_state(tmp.path()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
