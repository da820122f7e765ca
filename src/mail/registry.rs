//! Session agent registry persistence
//!
//! Maps pane titles (and, as a backup, pane ids) to Agent Mail agent names so
//! the dashboard can address agents that registered themselves. Files live
//! under `<config>/ntm/sessions/<session>/<project-slug>/`, namespaced by a
//! slug of the project directory so a session name reused across projects
//! never reads the wrong registry. All writes are atomic and mode 0600.
//!
//! Older installs wrote the files directly under `<session>/`. Reading those
//! is controlled by [`FallbackMode`].

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, MutexGuard};

use crate::errors::{NtmError, Result};

pub const AGENT_INFO_FILE: &str = "agent.json";
pub const REGISTRY_FILE: &str = "agent_registry.json";

/// Whether pre-namespacing session files are still read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Only the namespaced path is consulted
    #[default]
    Strict,
    /// Fall back to the legacy un-namespaced path when the namespaced file is missing
    LegacyCompat,
}

/// The dashboard's own registration for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAgentInfo {
    pub agent_name: String,
    pub project_key: String,
    pub registered_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAgentRegistry {
    pub session_name: String,
    pub project_key: String,
    /// Pane title → agent name
    #[serde(default)]
    pub agents: BTreeMap<String, String>,
    /// Pane id → agent name
    #[serde(default)]
    pub pane_id_map: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionAgentRegistry {
    pub fn new(session_name: &str, project_key: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_name: session_name.to_string(),
            project_key: project_key.to_string(),
            agents: BTreeMap::new(),
            pane_id_map: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn insert(&mut self, title: &str, pane_id: &str, agent_name: &str, now: DateTime<Utc>) {
        self.agents.insert(title.to_string(), agent_name.to_string());
        self.pane_id_map
            .insert(pane_id.to_string(), agent_name.to_string());
        self.updated_at = now;
    }

    /// Agent name for a pane: by title, then by pane id
    pub fn lookup(&self, title: &str, pane_id: &str) -> Option<&str> {
        self.agents
            .get(title)
            .or_else(|| self.pane_id_map.get(pane_id))
            .map(String::as_str)
    }

    /// Pane id registered for an agent name
    pub fn pane_for(&self, agent_name: &str) -> Option<&str> {
        self.pane_id_map
            .iter()
            .find(|(_, name)| name.as_str() == agent_name)
            .map(|(id, _)| id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.pane_id_map.is_empty()
    }

    /// Every distinct agent name with the pane it was last seen in
    pub fn names(&self) -> BTreeMap<&str, Option<&str>> {
        self.agents
            .values()
            .chain(self.pane_id_map.values())
            .map(|name| (name.as_str(), self.pane_for(name)))
            .collect()
    }
}

/// Session name made safe for a directory component
pub fn sanitize_session(session: &str) -> String {
    let s: String = session
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if s.is_empty() {
        "default".to_string()
    } else {
        s
    }
}

/// `<basename>-<8 hex of sha256(full path)>`
pub fn project_slug(project_key: &str) -> String {
    let trimmed = project_key.trim_end_matches('/');
    let base: String = Path::new(trimmed)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let base = base.trim_matches('-');
    let digest = Sha256::digest(trimmed.as_bytes());
    let hash: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    if base.is_empty() {
        hash
    } else {
        format!("{base}-{hash}")
    }
}

fn io_error(op: &str, path: &Path, e: &std::io::Error) -> NtmError {
    NtmError::unknown(op, format!("{}: {e}", path.display()))
}

/// Write `bytes` to `path` via a temp file in the same directory
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| NtmError::Validation(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(dir).map_err(|e| io_error("registry write", dir, &e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.tmp-{}", std::process::id()));

    let result = (|| -> std::io::Result<()> {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_error("registry write", path, &e));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RegistryStore {
    root: PathBuf,
    mode: FallbackMode,
    /// Shared by clones so the dashboard and coordinator never register
    /// the same pane twice
    writer: Arc<Mutex<()>>,
}

impl RegistryStore {
    /// `root` is the `sessions` directory
    pub fn new(root: impl Into<PathBuf>, mode: FallbackMode) -> Self {
        Self {
            root: root.into(),
            mode,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Held across a load-modify-save of the session files
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    /// `<config>/ntm/sessions`
    pub fn default_root() -> PathBuf {
        directories::BaseDirs::new().map_or_else(
            || PathBuf::from("~/.config/ntm/sessions"),
            |dirs| dirs.config_dir().join("ntm").join("sessions"),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_root(&self, session: &str) -> PathBuf {
        self.root.join(sanitize_session(session))
    }

    pub fn session_dir(&self, session: &str, project_key: &str) -> PathBuf {
        self.session_root(session).join(project_slug(project_key))
    }

    fn read<T: DeserializeOwned>(&self, session: &str, project_key: &str, file: &str) -> Result<Option<T>> {
        let primary = self.session_dir(session, project_key).join(file);
        let path = if primary.exists() {
            primary
        } else if self.mode == FallbackMode::LegacyCompat {
            let legacy = self.session_root(session).join(file);
            if !legacy.exists() {
                return Ok(None);
            }
            tracing::debug!(path = ?legacy, "Reading legacy session file");
            legacy
        } else {
            return Ok(None);
        };

        let content = std::fs::read_to_string(&path).map_err(|e| io_error("registry read", &path, &e))?;
        let value = serde_json::from_str(&content)
            .map_err(|e| NtmError::Validation(format!("{}: {e}", path.display())))?;
        Ok(Some(value))
    }

    fn write<T: Serialize>(&self, session: &str, project_key: &str, file: &str, value: &T) -> Result<()> {
        let path = self.session_dir(session, project_key).join(file);
        let json = serde_json::to_vec_pretty(value)?;
        atomic_write(&path, &json)
    }

    /// Load the registry; a registry for a different project reads as `None`
    pub fn load_registry(&self, session: &str, project_key: &str) -> Result<Option<SessionAgentRegistry>> {
        let reg: Option<SessionAgentRegistry> = self.read(session, project_key, REGISTRY_FILE)?;
        Ok(reg.filter(|r| r.project_key == project_key))
    }

    pub fn save_registry(&self, registry: &SessionAgentRegistry) -> Result<()> {
        self.write(
            &registry.session_name,
            &registry.project_key,
            REGISTRY_FILE,
            registry,
        )?;
        tracing::debug!(
            session = %registry.session_name,
            agents = registry.agents.len(),
            "Saved session agent registry"
        );
        Ok(())
    }

    pub fn load_agent_info(&self, session: &str, project_key: &str) -> Result<Option<SessionAgentInfo>> {
        let info: Option<SessionAgentInfo> = self.read(session, project_key, AGENT_INFO_FILE)?;
        Ok(info.filter(|i| i.project_key == project_key))
    }

    pub fn save_agent_info(&self, session: &str, info: &SessionAgentInfo) -> Result<()> {
        self.write(session, &info.project_key, AGENT_INFO_FILE, info)
    }

    /// Remove the session's registry and agent info
    pub fn delete_session(&self, session: &str, project_key: &str) -> Result<()> {
        let dir = self.session_dir(session, project_key);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("registry delete", &dir, &e)),
        }
        if self.mode == FallbackMode::LegacyCompat {
            for file in [REGISTRY_FILE, AGENT_INFO_FILE] {
                let _ = std::fs::remove_file(self.session_root(session).join(file));
            }
        }
        // Leave the session dir if other projects still use it
        let _ = std::fs::remove_dir(self.session_root(session));
        tracing::info!(session = %session, "Deleted session agent registry");
        Ok(())
    }
}
