//! Model context windows and token estimation ratios
//!
//! These numbers drift as vendors ship new models, so they live in data:
//! [`ModelTable::builtin`] holds the shipped defaults and the `[models]`
//! config section is merged over them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::panes::AgentType;

/// Bytes per token when neither the model nor the family has a ratio
const FALLBACK_CHARS_PER_TOKEN: f64 = 4.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTable {
    /// Model name (or name fragment) → context window in tokens
    #[serde(default)]
    pub windows: BTreeMap<String, u64>,

    /// Agent family (`claude`, `codex`, `gemini`) → bytes per token
    #[serde(default)]
    pub chars_per_token: BTreeMap<String, f64>,

    /// Agent family → model assumed when the pane title names none
    #[serde(default)]
    pub default_models: BTreeMap<String, String>,
}

impl ModelTable {
    /// Shipped defaults
    pub fn builtin() -> Self {
        let windows = [
            ("opus", 200_000),
            ("sonnet", 200_000),
            ("haiku", 200_000),
            ("claude", 200_000),
            ("gpt-5-codex", 272_000),
            ("gpt-5", 272_000),
            ("o3", 200_000),
            ("gpt-4.1", 1_047_576),
            ("codex", 272_000),
            ("gemini-2.5-pro", 1_048_576),
            ("flash", 1_048_576),
            ("gemini", 1_048_576),
        ];
        let ratios = [("claude", 3.5), ("codex", 4.0), ("gemini", 4.0)];
        let defaults = [
            ("claude", "sonnet"),
            ("codex", "gpt-5-codex"),
            ("gemini", "gemini-2.5-pro"),
        ];

        Self {
            windows: windows
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect(),
            chars_per_token: ratios
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect(),
            default_models: defaults
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    /// Overlay `overrides` on top of `self`; override entries win
    pub fn merged(mut self, overrides: &ModelTable) -> Self {
        for (k, v) in &overrides.windows {
            self.windows.insert(k.to_lowercase(), *v);
        }
        for (k, v) in &overrides.chars_per_token {
            if *v > 0.0 {
                self.chars_per_token.insert(k.to_lowercase(), *v);
            }
        }
        for (k, v) in &overrides.default_models {
            self.default_models.insert(k.to_lowercase(), v.clone());
        }
        self
    }

    /// Model name for a pane: its title variant, else the family default
    pub fn resolve_model(&self, agent_type: AgentType, variant: Option<&str>) -> Option<String> {
        if !agent_type.is_agent() {
            return None;
        }
        variant
            .map(str::to_lowercase)
            .or_else(|| self.default_models.get(agent_type.as_str()).cloned())
    }

    /// Context window for `model`; exact name first, then the longest known fragment
    pub fn context_window(&self, model: &str) -> Option<u64> {
        let model = model.to_lowercase();
        if let Some(w) = self.windows.get(&model) {
            return Some(*w);
        }
        self.windows
            .iter()
            .filter(|(k, _)| model.contains(k.as_str()))
            .max_by_key(|(k, _)| k.len())
            .map(|(_, w)| *w)
    }

    pub fn chars_per_token(&self, agent_type: AgentType) -> f64 {
        self.chars_per_token
            .get(agent_type.as_str())
            .copied()
            .filter(|r| *r > 0.0)
            .unwrap_or(FALLBACK_CHARS_PER_TOKEN)
    }

    /// Rough token count for `bytes` of captured text
    pub fn estimate_tokens(&self, agent_type: AgentType, bytes: usize) -> u64 {
        (bytes as f64 / self.chars_per_token(agent_type)).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_window_prefers_longest_fragment() {
        let table = ModelTable::builtin();
        assert_eq!(table.context_window("gpt-5-codex"), Some(272_000));
        assert_eq!(table.context_window("claude-opus-4"), Some(200_000));
        assert_eq!(table.context_window("gemini-2.5-pro"), Some(1_048_576));
        assert_eq!(table.context_window("mystery-model"), None);
    }

    #[test]
    fn test_resolve_model() {
        let table = ModelTable::builtin();
        assert_eq!(
            table.resolve_model(AgentType::Claude, Some("Opus")),
            Some("opus".to_string())
        );
        assert_eq!(
            table.resolve_model(AgentType::Codex, None),
            Some("gpt-5-codex".to_string())
        );
        assert_eq!(table.resolve_model(AgentType::User, Some("opus")), None);
    }

    #[test]
    fn test_overrides_win() {
        let overrides: ModelTable = toml::from_str(
            r#"
            [windows]
            opus = 1000000
            [chars_per_token]
            claude = 3.0
            "#,
        )
        .unwrap();
        let table = ModelTable::builtin().merged(&overrides);
        assert_eq!(table.context_window("opus"), Some(1_000_000));
        assert_eq!(table.context_window("sonnet"), Some(200_000));
        assert_eq!(table.estimate_tokens(AgentType::Claude, 300), 100);
    }
}
