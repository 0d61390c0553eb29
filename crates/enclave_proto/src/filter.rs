//! Subscription filters, sent to relays in `REQ` and matched locally by the
//! in-memory relay.

use serde::{Deserialize, Serialize};

use enclave_crypto::PublicKey;

use crate::event::Event;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<PublicKey>>,
    #[serde(rename = "#h", default, skip_serializing_if = "Option::is_none")]
    pub h: Option<Vec<String>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub p: Option<Vec<String>>,
    #[serde(rename = "#e", default, skip_serializing_if = "Option::is_none")]
    pub e: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(author);
        self
    }

    pub fn group(mut self, transport_id_hex: impl Into<String>) -> Self {
        self.h.get_or_insert_with(Vec::new).push(transport_id_hex.into());
        self
    }

    pub fn recipient(mut self, recipient: &PublicKey) -> Self {
        self.p.get_or_insert_with(Vec::new).push(recipient.to_hex());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        fn tag_match(wanted: &Option<Vec<String>>, event: &Event, name: &str) -> bool {
            match wanted {
                None => true,
                Some(values) => event
                    .tags
                    .iter()
                    .filter(|t| t.first().map(String::as_str) == Some(name))
                    .filter_map(|t| t.get(1))
                    .any(|v| values.contains(v)),
            }
        }

        self.ids.as_ref().map_or(true, |ids| ids.contains(&event.id))
            && self.kinds.as_ref().map_or(true, |k| k.contains(&event.kind))
            && self
                .authors
                .as_ref()
                .map_or(true, |a| a.contains(&event.pubkey))
            && self.since.map_or(true, |s| event.created_at >= s)
            && self.until.map_or(true, |u| event.created_at <= u)
            && tag_match(&self.h, event, "h")
            && tag_match(&self.p, event, "p")
            && tag_match(&self.e, event, "e")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder;
    use crate::kind;
    use enclave_crypto::Identity;

    #[test]
    fn group_filter_matches_only_its_group() {
        let ev = builder::group_message(&[1; 32], "c".into()).unwrap();
        let hit = Filter::new()
            .kind(kind::GROUP_MESSAGE)
            .group(hex::encode([1u8; 32]));
        let miss = Filter::new()
            .kind(kind::GROUP_MESSAGE)
            .group(hex::encode([2u8; 32]));
        assert!(hit.matches(&ev));
        assert!(!miss.matches(&ev));
        assert!(!Filter::new().kind(kind::GIFT_WRAP).matches(&ev));
    }

    #[test]
    fn since_excludes_older_events() {
        let ev = builder::group_message(&[1; 32], "c".into()).unwrap();
        assert!(Filter::new().since(ev.created_at).matches(&ev));
        assert!(!Filter::new().since(ev.created_at + 1).matches(&ev));
    }

    #[test]
    fn author_filter() {
        let id = Identity::generate();
        let ev = builder::key_package(&id, "AA", &[]).unwrap();
        assert!(Filter::new().author(id.public()).matches(&ev));
        assert!(!Filter::new().author(Identity::generate().public()).matches(&ev));
    }

    #[test]
    fn serializes_tag_keys_with_hash_prefix() {
        let f = Filter::new().kind(445).group("ab").since(10);
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["#h"][0], "ab");
        assert_eq!(json["kinds"][0], 445);
        assert!(json.get("#p").is_none());
    }
}
