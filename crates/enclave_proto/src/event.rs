//! Transport events: what relays store and forward.
//!
//! A relay only ever sees the fields of `Event`. The id commits to every
//! other field except the signature:
//!
//!   id  = SHA-256( JSON [0, pubkey, created_at, kind, tags, content] )
//!   sig = Ed25519(id bytes)
//!
//! `UnsignedEvent` ("rumor") has an id but no signature. Rumors are never
//! published directly; they only travel encrypted inside another event.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use enclave_crypto::{hash, Identity, PublicKey};

use crate::error::ProtoError;

/// `["name", "value", ...]`
pub type Tag = Vec<String>;

pub fn now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

fn compute_id(
    pubkey: &PublicKey,
    created_at: u64,
    kind: u16,
    tags: &[Tag],
    content: &str,
) -> Result<String, ProtoError> {
    let canonical = serde_json::to_string(&serde_json::json!([
        0,
        pubkey.to_hex(),
        created_at,
        kind,
        tags,
        content,
    ]))?;
    Ok(hash::sha256_hex(canonical.as_bytes()))
}

/// First value of the first tag named `name`.
pub fn tag_value<'a>(tags: &'a [Tag], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.first().map(String::as_str) == Some(name))
        .and_then(|t| t.get(1))
        .map(String::as_str)
}

/// All values of the first tag named `name`.
pub fn tag_values<'a>(tags: &'a [Tag], name: &str) -> Vec<&'a str> {
    tags.iter()
        .find(|t| t.first().map(String::as_str) == Some(name))
        .map(|t| t.iter().skip(1).map(String::as_str).collect())
        .unwrap_or_default()
}

pub fn tag(name: &str, values: &[&str]) -> Tag {
    std::iter::once(name)
        .chain(values.iter().copied())
        .map(str::to_owned)
        .collect()
}

// ── Unsigned ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub id: String,
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(
        pubkey: PublicKey,
        created_at: u64,
        kind: u16,
        tags: Vec<Tag>,
        content: impl Into<String>,
    ) -> Result<Self, ProtoError> {
        let content = content.into();
        let id = compute_id(&pubkey, created_at, kind, &tags, &content)?;
        Ok(Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
        })
    }

    pub fn verify_id(&self) -> Result<(), ProtoError> {
        let expected = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if expected != self.id {
            return Err(ProtoError::IdMismatch);
        }
        Ok(())
    }

    /// Sign with `signer`. The signer must be the event's author.
    pub fn sign(self, signer: &Identity) -> Result<Event, ProtoError> {
        if signer.public() != self.pubkey {
            return Err(ProtoError::AuthorMismatch);
        }
        let mut id_bytes = [0u8; 32];
        hex::decode_to_slice(&self.id, &mut id_bytes)?;
        let sig = hex::encode(signer.sign(&id_bytes));
        Ok(Event {
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        })
    }

    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }
}

// ── Signed ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Recompute the id and check the signature over it.
    pub fn verify(&self) -> Result<(), ProtoError> {
        let expected = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if expected != self.id {
            return Err(ProtoError::IdMismatch);
        }
        let mut id_bytes = [0u8; 32];
        hex::decode_to_slice(&self.id, &mut id_bytes)?;
        let sig = hex::decode(&self.sig)?;
        self.pubkey
            .verify(&id_bytes, &sig)
            .map_err(|_| ProtoError::BadSignature)
    }

    pub fn expect_kind(&self, expected: u16) -> Result<(), ProtoError> {
        if self.kind != expected {
            return Err(ProtoError::UnexpectedKind {
                expected,
                actual: self.kind,
            });
        }
        Ok(())
    }

    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }

    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        tag_values(&self.tags, name)
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(identity: &Identity) -> Event {
        UnsignedEvent::new(
            identity.public(),
            1_700_000_000,
            1,
            vec![tag("h", &["abc"])],
            "hello",
        )
        .unwrap()
        .sign(identity)
        .unwrap()
    }

    #[test]
    fn sign_then_verify() {
        let id = Identity::generate();
        let ev = signed(&id);
        assert_eq!(ev.id.len(), 64);
        ev.verify().unwrap();
    }

    #[test]
    fn tampered_content_fails() {
        let id = Identity::generate();
        let mut ev = signed(&id);
        ev.content = "bye".into();
        assert!(matches!(ev.verify(), Err(ProtoError::IdMismatch)));
    }

    #[test]
    fn forged_signature_fails() {
        let id = Identity::generate();
        let other = Identity::generate();
        let mut ev = signed(&id);
        ev.sig = signed(&other).sig;
        assert!(matches!(ev.verify(), Err(ProtoError::BadSignature)));
    }

    #[test]
    fn signer_must_be_author() {
        let id = Identity::generate();
        let other = Identity::generate();
        let rumor = UnsignedEvent::new(id.public(), 0, 9, vec![], "x").unwrap();
        assert!(matches!(rumor.sign(&other), Err(ProtoError::AuthorMismatch)));
    }

    #[test]
    fn tag_lookup() {
        let tags = vec![tag("relays", &["a", "b"]), tag("h", &["xyz"])];
        assert_eq!(tag_value(&tags, "h"), Some("xyz"));
        assert_eq!(tag_values(&tags, "relays"), vec!["a", "b"]);
        assert_eq!(tag_value(&tags, "p"), None);
    }

    #[test]
    fn json_roundtrip_keeps_id_valid() {
        let id = Identity::generate();
        let ev = signed(&id);
        let back = Event::from_json(&ev.to_json().unwrap()).unwrap();
        back.verify().unwrap();
        assert_eq!(back, ev);
    }
}
