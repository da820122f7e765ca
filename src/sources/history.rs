//! Prompt history at `<config>/ntm/history.jsonl`
//!
//! One JSON object per line, appended by `ntm send`. Malformed lines are
//! skipped; the file is read newest-last.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{NtmError, Result};

/// Entries kept for the history panel
pub const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(alias = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_success")]
    pub success: bool,
}

fn default_success() -> bool {
    true
}

pub fn default_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("/tmp/ntm/history.jsonl"),
        |dirs| dirs.config_dir().join("ntm").join("history.jsonl"),
    )
}

/// Parse history lines for `session`, newest first, at most `limit`
pub fn parse_history(text: &str, session: &str, limit: usize) -> Vec<HistoryEntry> {
    let mut entries: Vec<HistoryEntry> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str::<HistoryEntry>(l) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed history line");
                None
            }
        })
        .filter(|e| e.session.is_empty() || e.session == session)
        .collect();
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries.truncate(limit);
    entries
}

pub async fn load_history(path: &Path, session: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(parse_history(&text, session, limit)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(NtmError::unknown("history", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filters_session_and_orders() {
        let text = r#"{"timestamp":"2026-01-01T00:00:00Z","session":"main","targets":["%1"],"prompt":"first"}
not json
{"timestamp":"2026-01-02T00:00:00Z","session":"other","prompt":"elsewhere"}
{"ts":"2026-01-03T00:00:00Z","session":"main","prompt":"second","success":false}
"#;
        let entries = parse_history(text, "main", 10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].prompt, "second");
        assert!(!entries[0].success);
        assert_eq!(entries[1].targets, vec!["%1"]);

        assert_eq!(parse_history(text, "main", 1).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let entries = load_history(&tmp.path().join("history.jsonl"), "main", 10)
            .await
            .unwrap();
        assert!(entries.is_empty());
    }
}
