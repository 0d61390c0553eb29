use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use enclave_proto::builder::GIFT_WRAP_JITTER_SECS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default)]
    pub default_relays: Vec<String>,
    #[serde(default = "default_backoff")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacySettings {
    /// Gift wraps and seals are back-dated by up to this many seconds.
    #[serde(default = "default_jitter")]
    pub gift_wrap_jitter_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSettings {
    /// Informational entries such as group joins. Policy entries (denials,
    /// policy changes, skipped groups) are written regardless.
    #[serde(alias = "enabled", default = "default_informational")]
    pub informational: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveSettings {
    #[serde(default)]
    pub relays: RelaySettings,
    #[serde(default)]
    pub privacy: PrivacySettings,
    #[serde(default)]
    pub audit: AuditSettings,
}

fn default_backoff() -> u64 {
    5
}

fn default_informational() -> bool {
    true
}

fn default_publish_timeout() -> u64 {
    10
}

fn default_jitter() -> u64 {
    GIFT_WRAP_JITTER_SECS
}

/// Lower bound for the reconnect delay.
pub const MIN_BACKOFF_SECS: u64 = 1;

impl RelaySettings {
    /// Delay between reconnect attempts, never below `MIN_BACKOFF_SECS`.
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs.max(MIN_BACKOFF_SECS))
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            default_relays: vec![],
            reconnect_backoff_secs: default_backoff(),
            publish_timeout_secs: default_publish_timeout(),
        }
    }
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            gift_wrap_jitter_secs: default_jitter(),
        }
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            informational: default_informational(),
        }
    }
}

impl Default for EnclaveSettings {
    fn default() -> Self {
        Self {
            relays: RelaySettings::default(),
            privacy: PrivacySettings::default(),
            audit: AuditSettings::default(),
        }
    }
}

impl EnclaveSettings {
    /// Missing file means defaults. A present but malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read settings {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid settings {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let s = EnclaveSettings::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(s.relays.reconnect_backoff_secs, 5);
        assert!(s.audit.informational);
        assert_eq!(s.privacy.gift_wrap_jitter_secs, GIFT_WRAP_JITTER_SECS);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"relays":{"default_relays":["wss://a"]}}"#).unwrap();
        let s = EnclaveSettings::load(&path).unwrap();
        assert_eq!(s.relays.default_relays, vec!["wss://a".to_string()]);
        assert_eq!(s.relays.publish_timeout_secs, 10);
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut s = EnclaveSettings::default();
        s.relays.reconnect_backoff_secs = 1;
        s.save(&path).unwrap();
        assert_eq!(EnclaveSettings::load(&path).unwrap(), s);
    }

    #[test]
    fn zero_backoff_is_clamped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"relays":{"reconnect_backoff_secs":0}}"#).unwrap();
        let s = EnclaveSettings::load(&path).unwrap();
        assert_eq!(s.relays.reconnect_backoff(), Duration::from_secs(MIN_BACKOFF_SECS));
    }

    #[test]
    fn legacy_audit_flag_maps_to_informational() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"audit":{"enabled":false}}"#).unwrap();
        assert!(!EnclaveSettings::load(&path).unwrap().audit.informational);
    }

    #[test]
    fn malformed_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();
        assert!(EnclaveSettings::load(&path).is_err());
    }
}
