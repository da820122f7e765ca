//! Handoff notes under `<project>/.ntm/handoffs/*.md`

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::{NtmError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandoffInfo {
    pub name: String,
    pub title: String,
    pub path: PathBuf,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HandoffStatus {
    pub count: usize,
    pub latest: Option<HandoffInfo>,
}

pub fn handoff_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".ntm").join("handoffs")
}

/// First markdown heading, else the first non-empty line
fn title_of(text: &str) -> String {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.next().unwrap_or_default();
    text.lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix('#').map(|h| h.trim_start_matches('#').trim()))
        .unwrap_or(first)
        .to_string()
}

pub async fn load_handoffs(project_dir: &Path) -> Result<HandoffStatus> {
    let dir = handoff_dir(project_dir);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HandoffStatus::default()),
        Err(e) => return Err(NtmError::unknown("handoffs", e)),
    };

    let mut notes: Vec<(PathBuf, DateTime<Utc>)> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| NtmError::unknown("handoffs", e))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        if let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) {
            notes.push((path, DateTime::from(modified)));
        }
    }

    notes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let count = notes.len();
    let latest = match notes.into_iter().next() {
        Some((path, modified_at)) => {
            let text = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            Some(HandoffInfo {
                name: path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default(),
                title: title_of(&text),
                path,
                modified_at,
            })
        }
        None => None,
    };
    Ok(HandoffStatus { count, latest })
}
