//! Session timeline of agent state transitions and markers
//!
//! Append-only within a session. Events are recorded only on transitions;
//! markers annotate the first sighting of an agent (start), its disappearance
//! (stop), `working → idle` (completion), entering `error`, and prompts sent
//! by the dashboard. Memory is bounded by entry count and age; when a sink is
//! attached every entry is also appended to a JSON-lines file.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::panes::PaneId;
use crate::status::StatusKind;

pub const MAX_ENTRIES: usize = 10_000;
pub const MAX_AGE: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    Start,
    Stop,
    Completion,
    Error,
    Prompt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub agent_id: PaneId,
    pub timestamp: DateTime<Utc>,
    pub previous: Option<StatusKind>,
    pub new_state: StatusKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub agent_id: PaneId,
    pub timestamp: DateTime<Utc>,
    pub kind: MarkerKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TimelineEntry {
    Event(AgentEvent),
    Marker(Marker),
}

impl TimelineEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TimelineEntry::Event(e) => e.timestamp,
            TimelineEntry::Marker(m) => m.timestamp,
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            TimelineEntry::Event(e) => &e.agent_id,
            TimelineEntry::Marker(m) => &m.agent_id,
        }
    }
}

/// Appends entries to `timeline.jsonl`
#[derive(Debug)]
struct TimelineSink {
    path: PathBuf,
    file: Option<File>,
    failed: bool,
}

impl TimelineSink {
    fn append(&mut self, entry: &TimelineEntry) {
        if self.failed {
            return;
        }
        if self.file.is_none() {
            let opened = self
                .path
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| OpenOptions::new().create(true).append(true).open(&self.path));
            match opened {
                Ok(f) => self.file = Some(f),
                Err(e) => {
                    tracing::warn!(path = ?self.path, error = %e, "Timeline persistence disabled");
                    self.failed = true;
                    return;
                }
            }
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let line = match serde_json::to_string(entry) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize timeline entry");
                return;
            }
        };
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!(path = ?self.path, error = %e, "Timeline write failed");
            self.failed = true;
        }
    }
}

#[derive(Debug)]
pub struct Timeline {
    entries: VecDeque<TimelineEntry>,
    current: HashMap<PaneId, StatusKind>,
    max_entries: usize,
    max_age: Duration,
    sink: Option<TimelineSink>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new(MAX_ENTRIES, MAX_AGE)
    }
}

impl Timeline {
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            current: HashMap::new(),
            max_entries: max_entries.max(1),
            max_age,
            sink: None,
        }
    }

    /// Persist every new entry to `path` as JSON lines
    pub fn with_sink(mut self, path: impl AsRef<Path>) -> Self {
        self.sink = Some(TimelineSink {
            path: path.as_ref().to_path_buf(),
            file: None,
            failed: false,
        });
        self
    }

    /// Record a state observation; returns true if it was a transition
    pub fn record(&mut self, agent_id: &str, state: StatusKind, at: DateTime<Utc>) -> bool {
        let previous = self.current.get(agent_id).copied();
        if previous == Some(state) {
            return false;
        }

        if previous.is_none() {
            self.push(TimelineEntry::Marker(Marker {
                agent_id: agent_id.to_string(),
                timestamp: at,
                kind: MarkerKind::Start,
                message: format!("first seen as {state}"),
            }));
        }

        self.push(TimelineEntry::Event(AgentEvent {
            agent_id: agent_id.to_string(),
            timestamp: at,
            previous,
            new_state: state,
        }));

        match (previous, state) {
            (Some(StatusKind::Working), StatusKind::Idle) => {
                self.push(TimelineEntry::Marker(Marker {
                    agent_id: agent_id.to_string(),
                    timestamp: at,
                    kind: MarkerKind::Completion,
                    message: "finished work".to_string(),
                }));
            }
            (_, StatusKind::Error) => {
                self.push(TimelineEntry::Marker(Marker {
                    agent_id: agent_id.to_string(),
                    timestamp: at,
                    kind: MarkerKind::Error,
                    message: "entered error state".to_string(),
                }));
            }
            _ => {}
        }

        self.current.insert(agent_id.to_string(), state);
        true
    }

    /// Add a free-form marker for a known agent
    pub fn marker(&mut self, agent_id: &str, kind: MarkerKind, message: impl Into<String>, at: DateTime<Utc>) {
        self.push(TimelineEntry::Marker(Marker {
            agent_id: agent_id.to_string(),
            timestamp: at,
            kind,
            message: message.into(),
        }));
    }

    /// The agent's pane went away
    pub fn stop(&mut self, agent_id: &str, at: DateTime<Utc>) {
        if self.current.remove(agent_id).is_some() {
            self.marker(agent_id, MarkerKind::Stop, "pane closed", at);
        }
    }

    fn push(&mut self, entry: TimelineEntry) {
        if let Some(sink) = self.sink.as_mut() {
            sink.append(&entry);
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    /// Drop entries older than the age limit
    pub fn evict(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.entries.front() {
            let age = (now - front.timestamp()).to_std().unwrap_or(Duration::ZERO);
            if age > self.max_age {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn current_state(&self, agent_id: &str) -> Option<StatusKind> {
        self.current.get(agent_id).copied()
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &TimelineEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read a persisted timeline back
pub fn load_jsonl(path: &Path) -> std::io::Result<Vec<TimelineEntry>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn kinds(tl: &Timeline) -> Vec<String> {
        tl.entries()
            .map(|e| match e {
                TimelineEntry::Event(ev) => format!("event:{}", ev.new_state),
                TimelineEntry::Marker(m) => format!("marker:{:?}", m.kind),
            })
            .collect()
    }

    #[test]
    fn test_transitions_only_with_markers() {
        let mut tl = Timeline::default();
        assert!(tl.record("%1", StatusKind::Working, t(0)));
        assert!(!tl.record("%1", StatusKind::Working, t(1)));
        assert!(tl.record("%1", StatusKind::Idle, t(2)));
        assert!(tl.record("%1", StatusKind::Error, t(3)));

        assert_eq!(
            kinds(&tl),
            vec![
                "marker:Start",
                "event:working",
                "event:idle",
                "marker:Completion",
                "event:error",
                "marker:Error",
            ]
        );
    }

    #[test]
    fn test_stop_marker_only_for_known_agents() {
        let mut tl = Timeline::default();
        tl.stop("%9", t(0));
        assert!(tl.is_empty());

        tl.record("%1", StatusKind::Idle, t(0));
        tl.stop("%1", t(1));
        assert_eq!(tl.current_state("%1"), None);
        assert!(matches!(
            tl.entries().last(),
            Some(TimelineEntry::Marker(Marker { kind: MarkerKind::Stop, .. }))
        ));
    }

    #[test]
    fn test_eviction_by_size_and_age() {
        let mut tl = Timeline::new(3, Duration::from_secs(60));
        for i in 0..5 {
            tl.marker("%1", MarkerKind::Prompt, "p", t(i));
        }
        assert_eq!(tl.len(), 3);

        tl.evict(t(63));
        // Entries at t(2) is 61s old; t(3) and t(4) remain
        assert_eq!(tl.len(), 2);
    }

    #[test]
    fn test_jsonl_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions").join("main").join("timeline.jsonl");
        let mut tl = Timeline::default().with_sink(&path);
        tl.record("%1", StatusKind::Working, t(0));
        tl.record("%1", StatusKind::Idle, t(5));

        let loaded = load_jsonl(&path).unwrap();
        let in_memory: Vec<TimelineEntry> = tl.entries().cloned().collect();
        assert_eq!(loaded, in_memory);
    }
}
