//! Channel model
//!
//! A channel is one routable backend target: a provider kind, a credential
//! blob, and the routing attributes (priority, weight, groups, models) the
//! selector filters on. Multi-key channels keep several credentials in one
//! blob and rotate among them; per-key disable state is a sparse map where
//! an absent index means the key is enabled.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Channel availability status.
///
/// Transitions:
/// - Enabled → ManuallyDisabled (admin)
/// - Enabled → AutoDisabled (health manager on a durable fault)
/// - ManuallyDisabled / AutoDisabled → Enabled (admin)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            ChannelStatus::Enabled => "enabled",
            ChannelStatus::ManuallyDisabled => "manually_disabled",
            ChannelStatus::AutoDisabled => "auto_disabled",
        }
    }
}

/// How a multi-key channel picks its next credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    #[default]
    Polling,
    Random,
}

/// Why and when a key index was disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDisable {
    pub reason: String,
    /// Unix timestamp (seconds)
    pub disabled_at: u64,
}

/// Multi-key rotation metadata.
///
/// `disabled` is sparse: an index with no entry is enabled. Do not default
/// absent entries to a disabled state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiKeyInfo {
    #[serde(default)]
    pub mode: RotationMode,
    #[serde(default)]
    pub disabled: HashMap<usize, KeyDisable>,
    /// Next polling position, wraps modulo key count
    #[serde(default)]
    pub cursor: usize,
}

/// A configured backend target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: u64,
    pub name: String,
    /// Provider kind tag; the adapter registry resolves it to an adapter
    pub kind: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_status")]
    pub status: ChannelStatus,
    /// Descending preference tier; higher is tried first
    #[serde(default)]
    pub priority: i64,
    /// Intra-tier selection bias; 0 counts as 1 during selection
    #[serde(default)]
    pub weight: u32,
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,
    pub models: Vec<String>,
    /// Whether the health manager may auto-disable this channel
    #[serde(default = "default_auto_ban")]
    pub auto_ban: bool,
    /// Credential blob: a single secret, a JSON array (one credential per
    /// element), or newline-separated credentials
    pub key: String,
    /// Present iff this is a multi-key channel
    #[serde(default)]
    pub multi_key: Option<MultiKeyInfo>,
}

fn default_status() -> ChannelStatus {
    ChannelStatus::Enabled
}

fn default_groups() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_auto_ban() -> bool {
    true
}

impl Channel {
    pub fn is_multi_key(&self) -> bool {
        self.multi_key.is_some()
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    /// Weight used for the intra-tier draw; zero-weight channels still get
    /// a minimum share.
    pub fn selection_weight(&self) -> u32 {
        self.weight.max(1)
    }

    /// Parse the credential blob into individual credentials.
    ///
    /// A blob starting with `[` is tried as a JSON array first, keeping each
    /// element's encoding verbatim (object credentials stay objects).
    /// Anything else is split on newlines.
    pub fn parse_keys(&self) -> Vec<String> {
        parse_key_blob(&self.key)
    }
}

fn parse_key_blob(blob: &str) -> Vec<String> {
    if blob.is_empty() {
        return Vec::new();
    }
    let trimmed = blob.trim();
    if trimmed.starts_with('[')
        && let Ok(elements) = serde_json::from_str::<Vec<Box<serde_json::value::RawValue>>>(trimmed)
    {
        return elements.into_iter().map(|v| v.get().to_string()).collect();
    }
    blob.trim_matches('\n')
        .split('\n')
        .map(str::to_string)
        .collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn parse_keys_splits_newlines() {
        let mut ch = channel(1, 0, 1);
        ch.key = "sk-a\nsk-b\nsk-c".into();
        assert_eq!(ch.parse_keys(), vec!["sk-a", "sk-b", "sk-c"]);
    }

    #[test]
    fn parse_keys_trims_surrounding_newlines_only() {
        let mut ch = channel(1, 0, 1);
        ch.key = "\nsk-a\nsk-b\n".into();
        assert_eq!(ch.parse_keys(), vec!["sk-a", "sk-b"]);
    }

    #[test]
    fn parse_keys_json_array_keeps_elements_verbatim() {
        let mut ch = channel(1, 0, 1);
        ch.key = r#"[{"project":"p1","sa":"a"},{"project":"p2","sa":"b"}]"#.into();
        let keys = ch.parse_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], r#"{"project":"p1","sa":"a"}"#);
        assert_eq!(keys[1], r#"{"project":"p2","sa":"b"}"#);
    }

    #[test]
    fn parse_keys_invalid_json_array_falls_back_to_newline_split() {
        let mut ch = channel(1, 0, 1);
        ch.key = "[not-json\nsecond-line".into();
        assert_eq!(ch.parse_keys(), vec!["[not-json", "second-line"]);
    }

    #[test]
    fn parse_keys_empty_blob_yields_no_keys() {
        let mut ch = channel(1, 0, 1);
        ch.key = String::new();
        assert!(ch.parse_keys().is_empty());
    }

    #[test]
    fn selection_weight_floors_zero_to_one() {
        assert_eq!(channel(1, 0, 0).selection_weight(), 1);
        assert_eq!(channel(1, 0, 7).selection_weight(), 7);
    }

    #[test]
    fn sparse_disable_map_absent_means_enabled() {
        let ch = multi_key_channel(1, &["k0", "k1"], RotationMode::Polling);
        let info = ch.multi_key.as_ref().unwrap();
        assert!(!info.disabled.contains_key(&0));
        assert!(!info.disabled.contains_key(&1));
    }

    #[test]
    fn channel_deserializes_with_defaults() {
        let json = r#"{
            "id": 7,
            "name": "primary",
            "kind": "openai",
            "models": ["gpt-4o"],
            "key": "sk-test"
        }"#;
        let ch: Channel = serde_json::from_str(json).unwrap();
        assert_eq!(ch.status, ChannelStatus::Enabled);
        assert_eq!(ch.groups, vec!["default"]);
        assert!(ch.auto_ban);
        assert_eq!(ch.priority, 0);
        assert!(ch.multi_key.is_none());
    }
}
