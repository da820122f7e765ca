use ratatui::style::Color;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use crate::coordination::conflicts::ConflictMode;
use crate::mail::client::DEFAULT_URL;
use crate::mail::FallbackMode;
use crate::refresh::{SourceId, MIN_INTERVAL};
use crate::status::models::ModelTable;

/// Coordinator poll interval used when the configured one is too short
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Digest interval used when the configured one is too short
pub const DEFAULT_DIGEST_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Shortest digest interval accepted from config
pub const MIN_DIGEST_INTERVAL: Duration = Duration::from_secs(10);

/// Application configuration loaded from file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NtmConfig {
    #[serde(default)]
    pub refresh: RefreshConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub mail: MailConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    /// Merged over the builtin model table
    #[serde(default)]
    pub models: ModelTable,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,
}

/// Refresh cadences and capture limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Source name → cadence in milliseconds
    #[serde(default)]
    pub intervals_ms: BTreeMap<String, u64>,

    /// Panes captured per session refresh
    #[serde(default = "default_capture_budget")]
    pub capture_budget: usize,

    /// Scrollback lines per capture
    #[serde(default = "default_capture_lines")]
    pub capture_lines: usize,

    /// Ready/in-progress items shown in the beads panel
    #[serde(default = "default_beads_limit")]
    pub beads_limit: usize,

    /// CASS search query; the project directory name when unset
    #[serde(default)]
    pub cass_query: Option<String>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            intervals_ms: BTreeMap::new(),
            capture_budget: default_capture_budget(),
            capture_lines: default_capture_lines(),
            beads_limit: default_beads_limit(),
            cass_query: None,
        }
    }
}

fn default_capture_budget() -> usize {
    crate::capture::DEFAULT_BUDGET
}

fn default_capture_lines() -> usize {
    crate::capture::DEFAULT_MAX_LINES
}

fn default_beads_limit() -> usize {
    5
}

/// Background coordinator loops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Check reservations every N monitor cycles
    #[serde(default = "default_conflict_every")]
    pub conflict_every: u32,

    #[serde(default)]
    pub conflict_mode: ConflictMode,

    #[serde(default)]
    pub digest_enabled: bool,

    #[serde(default = "default_digest_interval_secs")]
    pub digest_interval_secs: u64,

    /// Agent Mail name of the human who receives digests
    #[serde(default)]
    pub human_recipient: Option<String>,

    #[serde(default)]
    pub auto_assign: bool,

    /// Seconds an idle agent must be quiet before it gets work
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: default_poll_interval_ms(),
            conflict_every: default_conflict_every(),
            conflict_mode: ConflictMode::default(),
            digest_enabled: false,
            digest_interval_secs: default_digest_interval_secs(),
            human_recipient: None,
            auto_assign: false,
            idle_threshold_secs: default_idle_threshold_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_conflict_every() -> u32 {
    3
}

fn default_digest_interval_secs() -> u64 {
    300
}

fn default_idle_threshold_secs() -> u64 {
    60
}

impl CoordinatorConfig {
    /// Configured poll interval, or the default when below the tick floor
    pub fn poll_interval(&self) -> Duration {
        let d = Duration::from_millis(self.poll_interval_ms);
        if d < MIN_INTERVAL {
            DEFAULT_POLL_INTERVAL
        } else {
            d
        }
    }

    /// Configured digest interval, or the default when below 10 s
    pub fn digest_interval(&self) -> Duration {
        let d = Duration::from_secs(self.digest_interval_secs);
        if d < MIN_DIGEST_INTERVAL {
            DEFAULT_DIGEST_INTERVAL
        } else {
            d
        }
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn conflict_every(&self) -> u32 {
        self.conflict_every.max(1)
    }
}

/// Agent Mail server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_mail_url")]
    pub url: String,

    /// Bearer token
    #[serde(default)]
    pub token: Option<String>,

    /// Project key; the absolute project directory when unset
    #[serde(default)]
    pub project_key: Option<String>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_mail_url(),
            token: None,
            project_key: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_mail_url() -> String {
    DEFAULT_URL.to_string()
}

/// Session registry files
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    #[serde(default)]
    pub fallback: FallbackMode,

    /// Sessions directory; `<config>/ntm/sessions` when unset
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// External tool binaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tmux")]
    pub tmux: String,
    #[serde(default = "default_bv")]
    pub bv: String,
    #[serde(default = "default_ubs")]
    pub ubs: String,
    #[serde(default = "default_cass")]
    pub cass: String,
    #[serde(default = "default_dcg")]
    pub dcg: String,
    #[serde(default = "default_git")]
    pub git: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tmux: default_tmux(),
            bv: default_bv(),
            ubs: default_ubs(),
            cass: default_cass(),
            dcg: default_dcg(),
            git: default_git(),
        }
    }
}

fn default_tmux() -> String {
    "tmux".to_string()
}

fn default_bv() -> String {
    "bv".to_string()
}

fn default_ubs() -> String {
    "ubs".to_string()
}

fn default_cass() -> String {
    "cass".to_string()
}

fn default_dcg() -> String {
    "dcg".to_string()
}

fn default_git() -> String {
    "git".to_string()
}

/// Desktop notifications for agent errors and conflicts
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Parse `NTM_<KEY>_REFRESH_MS` / `NTM_<KEY>_REFRESH_SECS` values
///
/// Milliseconds must be a positive integer and win over seconds; seconds
/// must be a non-negative float. Anything else is ignored.
pub fn parse_env_interval(ms: Option<&str>, secs: Option<&str>) -> Option<Duration> {
    if let Some(ms) = ms.and_then(|v| v.trim().parse::<u64>().ok()).filter(|&v| v > 0) {
        return Some(Duration::from_millis(ms));
    }
    let secs = secs?.trim().parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

/// `<prefix>_MS` / `<prefix>_SECS` through [`parse_env_interval`]
fn env_interval(lookup: &impl Fn(&str) -> Option<String>, prefix: &str) -> Option<Duration> {
    let ms = lookup(&format!("{prefix}_MS"));
    let secs = lookup(&format!("{prefix}_SECS"));
    if ms.is_none() && secs.is_none() {
        return None;
    }
    let parsed = parse_env_interval(ms.as_deref(), secs.as_deref());
    if parsed.is_none() {
        tracing::warn!(prefix, "Ignoring invalid interval override");
    }
    parsed
}

impl NtmConfig {
    /// Load configuration from default path (~/.config/ntm/config.toml)
    pub fn load() -> Self {
        let mut config = Self::load_from_path(Self::default_path());
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Get the default configuration path
    pub fn default_path() -> PathBuf {
        directories::BaseDirs::new().map_or_else(
            || PathBuf::from("~/.config/ntm/config.toml"),
            |dirs| dirs.config_dir().join("ntm").join("config.toml"),
        )
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: PathBuf) -> Self {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for id in SourceId::ALL {
            if let Some(d) = env_interval(&lookup, &format!("NTM_{}_REFRESH", id.env_key())) {
                self.refresh
                    .intervals_ms
                    .insert(id.name().to_string(), d.as_millis() as u64);
            }
        }
        if let Some(d) = env_interval(&lookup, "NTM_COORDINATOR_POLL") {
            self.coordinator.poll_interval_ms = d.as_millis() as u64;
        }
        if let Some(d) = env_interval(&lookup, "NTM_COORDINATOR_DIGEST") {
            self.coordinator.digest_interval_secs = d.as_secs();
        }
        if let Some(url) = lookup("NTM_MAIL_URL").filter(|v| !v.trim().is_empty()) {
            self.mail.url = url;
        }
        if let Some(token) = lookup("NTM_MAIL_TOKEN").filter(|v| !v.trim().is_empty()) {
            self.mail.token = Some(token);
        }
    }

    /// Per-source cadences from `[refresh.intervals_ms]`; unknown names are skipped
    pub fn refresh_intervals(&self) -> HashMap<SourceId, Duration> {
        let mut out = HashMap::new();
        for (name, ms) in &self.refresh.intervals_ms {
            match SourceId::ALL.iter().find(|id| id.name() == name) {
                Some(&id) => {
                    out.insert(id, Duration::from_millis(*ms).max(MIN_INTERVAL));
                }
                None => tracing::warn!(source = %name, "Unknown refresh source in config"),
            }
        }
        out
    }

    /// Builtin model table with `[models]` merged over it
    pub fn model_table(&self) -> ModelTable {
        ModelTable::builtin().merged(&self.models)
    }
}

/// Tokyo Night color palette
pub mod colors {
    use super::Color;

    pub const BG_LIGHT: Color = Color::Rgb(41, 46, 66); // #292e42 lighter bg
    pub const FG: Color = Color::Rgb(192, 202, 245); // #c0caf5
    pub const WORKING: Color = Color::Rgb(122, 162, 247); // #7aa2f7 blue
    pub const ATTENTION: Color = Color::Rgb(255, 158, 100); // #ff9e64 orange
    pub const IDLE: Color = Color::Rgb(86, 95, 137); // #565f89 gray
    pub const COMPACTING: Color = Color::Rgb(224, 175, 104); // #e0af68 yellow
    pub const ERROR: Color = Color::Rgb(247, 118, 142); // #f7768e red
    pub const OK: Color = Color::Rgb(158, 206, 106); // #9ece6a green
    pub const BORDER: Color = Color::Rgb(59, 66, 97); // #3b4261
    pub const HIGHLIGHT: Color = Color::Rgb(187, 154, 247); // #bb9af7 purple
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_env_interval() {
        assert_eq!(parse_env_interval(Some("250"), None), Some(Duration::from_millis(250)));
        assert_eq!(parse_env_interval(Some("250"), Some("9")), Some(Duration::from_millis(250)));
        assert_eq!(parse_env_interval(Some("0"), Some("1.5")), Some(Duration::from_millis(1500)));
        assert_eq!(parse_env_interval(Some("-5"), None), None);
        assert_eq!(parse_env_interval(Some("abc"), None), None);
        assert_eq!(parse_env_interval(None, Some("-1")), None);
        assert_eq!(parse_env_interval(None, Some("NaN")), None);
        assert_eq!(parse_env_interval(None, Some("0")), Some(Duration::ZERO));
    }

    #[test]
    fn test_env_overrides_and_floor() {
        let mut config = NtmConfig::default();
        config.apply_env(env(&[
            ("NTM_SCAN_REFRESH_MS", "30000"),
            ("NTM_ALERTS_REFRESH_SECS", "0.01"),
            ("NTM_BEADS_REFRESH_MS", "soon"),
            ("NTM_MAIL_TOKEN", "secret"),
        ]));
        let intervals = config.refresh_intervals();
        assert_eq!(intervals.get(&SourceId::CodeScan), Some(&Duration::from_secs(30)));
        // Below the tick floor
        assert_eq!(intervals.get(&SourceId::Alerts), Some(&MIN_INTERVAL));
        assert!(!intervals.contains_key(&SourceId::Beads));
        assert_eq!(config.mail.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_coordinator_env_overrides() {
        let mut config = NtmConfig::default();
        config.apply_env(env(&[
            ("NTM_COORDINATOR_POLL_MS", "2500"),
            ("NTM_COORDINATOR_DIGEST_SECS", "120"),
        ]));
        assert_eq!(config.coordinator.poll_interval(), Duration::from_millis(2500));
        assert_eq!(config.coordinator.digest_interval(), Duration::from_secs(120));

        // Too-short values fall back to the defaults; garbage is ignored
        let mut config = NtmConfig::default();
        config.apply_env(env(&[
            ("NTM_COORDINATOR_POLL_SECS", "0.01"),
            ("NTM_COORDINATOR_DIGEST_MS", "later"),
        ]));
        assert_eq!(config.coordinator.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(
            config.coordinator.digest_interval_secs,
            CoordinatorConfig::default().digest_interval_secs
        );
    }

    #[test]
    fn test_coordinator_minima() {
        let config = CoordinatorConfig {
            poll_interval_ms: 10,
            digest_interval_secs: 2,
            conflict_every: 0,
            ..CoordinatorConfig::default()
        };
        assert_eq!(config.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(config.digest_interval(), DEFAULT_DIGEST_INTERVAL);
        assert_eq!(config.conflict_every(), 1);

        let config = CoordinatorConfig {
            poll_interval_ms: 2_000,
            digest_interval_secs: 60,
            ..CoordinatorConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.digest_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[refresh]
capture_budget = 4
[refresh.intervals_ms]
session = 2000

[coordinator]
enabled = true
conflict_mode = "negotiate"

[registry]
fallback = "legacy_compat"

[models.windows]
"my-model" = 64000
"#
        )
        .unwrap();
        let config = NtmConfig::load_from_path(file.path().to_path_buf());
        assert_eq!(config.refresh.capture_budget, 4);
        assert_eq!(config.refresh.capture_lines, crate::capture::DEFAULT_MAX_LINES);
        assert_eq!(
            config.refresh_intervals().get(&SourceId::Session),
            Some(&Duration::from_secs(2))
        );
        assert!(config.coordinator.enabled);
        assert_eq!(config.coordinator.conflict_mode, ConflictMode::Negotiate);
        assert_eq!(config.registry.fallback, FallbackMode::LegacyCompat);
        assert!(config.mail.enabled);
        assert_eq!(config.model_table().context_window("my-model"), Some(64_000));
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "refresh = [not toml").unwrap();
        let config = NtmConfig::load_from_path(file.path().to_path_buf());
        assert_eq!(config.refresh.capture_budget, crate::capture::DEFAULT_BUDGET);
    }
}
