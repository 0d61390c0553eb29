//! Persisted record models. Each maps to one JSON file or one JSONL line.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use enclave_crypto::PublicKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub hash: String,
    pub key: String,
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// MLS group id, hex. Also the file stem.
    pub mls_group_id: String,
    /// Transport routing id (`h` tag), hex.
    pub transport_id: String,
    pub name: String,
    pub description: String,
    pub admins: Vec<PublicKey>,
    pub relays: Vec<String>,
    #[serde(default)]
    pub image: Option<ImageRecord>,
    pub epoch: u64,
    pub member_count: usize,
    /// Base64 copy of the serialized group state. The `.state` file next to
    /// this record is authoritative.
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `created_at` of the newest transport event handled for this group.
    /// Used as the `since` cursor when resubscribing.
    #[serde(default)]
    pub last_event_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPackageRecord {
    /// Hash reference of the key package, hex. Also the file stem.
    pub reference: String,
    /// Id of the transport event that published it, once published.
    #[serde(default)]
    pub event_id: Option<String>,
    /// TLS-serialized public key package, base64.
    pub key_package: String,
    /// Provider storage snapshot holding the private halves, base64.
    pub private_state: String,
    pub last_resort: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Rumor id.
    pub id: String,
    pub group_id: String,
    /// Transport event that carried it; `None` for locally sent messages
    /// until the relay echo is seen.
    #[serde(default)]
    pub event_id: Option<String>,
    pub sender: PublicKey,
    pub content: String,
    pub kind: u16,
    pub created_at: u64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Content withheld by access policy.
    #[serde(default)]
    pub redacted: bool,
}

pub const REDACTED_PLACEHOLDER: &str = "[redacted: sender not allowed]";

impl MessageRecord {
    /// Same envelope, content dropped.
    pub fn redact(mut self) -> Self {
        self.content = REDACTED_PLACEHOLDER.to_string();
        self.tags.clear();
        self.redacted = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    /// Drop content from unknown senders without further noise.
    #[default]
    Ignore,
    /// Drop content but surface the rejection to the operator.
    LogOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlConfig {
    /// The only identity allowed to change this policy.
    #[serde(default)]
    pub owner: Option<PublicKey>,
    #[serde(default)]
    pub default_policy: DefaultPolicy,
    #[serde(default)]
    pub allowed_contacts: BTreeSet<PublicKey>,
    /// MLS group ids, hex.
    #[serde(default)]
    pub allowed_groups: BTreeSet<String>,
    #[serde(default)]
    pub log_rejected: bool,
}

impl AccessControlConfig {
    pub fn for_owner(owner: PublicKey) -> Self {
        Self {
            owner: Some(owner),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_strips_content_and_tags() {
        let m = MessageRecord {
            id: "m1".into(),
            group_id: "g".into(),
            event_id: Some("e".into()),
            sender: PublicKey([1; 32]),
            content: "secret plans".into(),
            kind: 9,
            created_at: 5,
            tags: vec![vec!["e".into(), "parent".into()]],
            redacted: false,
        }
        .redact();
        assert!(m.redacted);
        assert!(!m.content.contains("secret"));
        assert!(m.tags.is_empty());
        assert_eq!(m.id, "m1");
    }

    #[test]
    fn access_config_json_shape() {
        let cfg = AccessControlConfig {
            default_policy: DefaultPolicy::LogOnly,
            ..AccessControlConfig::for_owner(PublicKey([2; 32]))
        };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["default_policy"], "log_only");
        assert_eq!(json["owner"], hex::encode([2u8; 32]));
    }
}
