//! Session checkpoints under `<project>/.ntm/checkpoints/<session>/`
//!
//! Each checkpoint is a directory with an optional `metadata.json`. A missing
//! checkpoint directory is not an error: the session simply has none.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{NtmError, Result};

/// Newest checkpoint older than this is flagged stale
pub const STALE_AFTER: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointInfo {
    pub id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub pane_count: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointHealth {
    None,
    Fresh,
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckpointStatus {
    pub count: usize,
    pub latest: Option<CheckpointInfo>,
}

impl CheckpointStatus {
    pub fn health(&self, now: DateTime<Utc>) -> CheckpointHealth {
        match &self.latest {
            None => CheckpointHealth::None,
            Some(c) if (now - c.created_at).to_std().unwrap_or(Duration::ZERO) > STALE_AFTER => {
                CheckpointHealth::Stale
            }
            Some(_) => CheckpointHealth::Fresh,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pane_count: usize,
}

pub fn checkpoint_dir(project_dir: &Path, session: &str) -> PathBuf {
    project_dir.join(".ntm").join("checkpoints").join(session)
}

pub async fn load_checkpoints(project_dir: &Path, session: &str) -> Result<CheckpointStatus> {
    let dir = checkpoint_dir(project_dir, session);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CheckpointStatus::default()),
        Err(e) => return Err(NtmError::unknown("checkpoints", e)),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| NtmError::unknown("checkpoints", e))?
    {
        let path = entry.path();
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().to_string();
        let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::from);

        let parsed = match tokio::fs::read_to_string(path.join("metadata.json")).await {
            Ok(text) => match serde_json::from_str::<Metadata>(&text) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Unreadable checkpoint metadata");
                    None
                }
            },
            Err(_) => None,
        };

        let (id, description, created_at, pane_count) = match parsed {
            Some(m) => (
                m.id.unwrap_or_else(|| dir_name.clone()),
                m.description,
                m.created_at.or(modified),
                m.pane_count,
            ),
            None => (dir_name.clone(), String::new(), modified, 0),
        };
        let Some(created_at) = created_at else {
            continue;
        };
        found.push(CheckpointInfo {
            id,
            description,
            created_at,
            pane_count,
            path,
        });
    }

    found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(CheckpointStatus {
        count: found.len(),
        latest: found.into_iter().next(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let status = load_checkpoints(tmp.path(), "main").await.unwrap();
        assert_eq!(status.count, 0);
        assert_eq!(status.health(Utc::now()), CheckpointHealth::None);
    }

    #[tokio::test]
    async fn test_latest_by_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let root = checkpoint_dir(tmp.path(), "main");
        for (name, ts) in [("a", "2026-01-01T00:00:00Z"), ("b", "2026-01-02T00:00:00Z")] {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("metadata.json"),
                format!(r#"{{"description":"cp {name}","created_at":"{ts}","pane_count":3}}"#),
            )
            .unwrap();
        }
        std::fs::write(root.join("stray.txt"), "x").unwrap();

        let status = load_checkpoints(tmp.path(), "main").await.unwrap();
        assert_eq!(status.count, 2);
        let latest = status.latest.as_ref().unwrap();
        assert_eq!(latest.id, "b");
        assert_eq!(latest.pane_count, 3);

        let soon = latest.created_at + chrono::Duration::minutes(5);
        let later = latest.created_at + chrono::Duration::hours(2);
        assert_eq!(status.health(soon), CheckpointHealth::Fresh);
        assert_eq!(status.health(later), CheckpointHealth::Stale);
    }
}
