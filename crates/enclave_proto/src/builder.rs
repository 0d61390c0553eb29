//! Event builders for every envelope shape the engine emits.
//!
//! | kind | signed by            | relay-visible metadata                 |
//! |------|----------------------|----------------------------------------|
//! | 443  | identity             | protocol/ciphersuite/encoding tags     |
//! | 445  | disposable key       | `h` = transport group id               |
//! | 444  | (rumor, unsigned)    | never published bare                   |
//! | 9    | (rumor, unsigned)    | never published bare                   |
//! | 13   | identity             | never published bare                   |
//! | 1059 | disposable key       | `p` = recipient                        |
//!
//! Welcome delivery: rumor(444) → seal(13) → gift wrap(1059). The seal
//! proves the sender to the recipient; the wrap hides the sender from
//! everybody else.

use rand::Rng;

use enclave_crypto::{ConversationKey, Identity, PublicKey};

use crate::error::ProtoError;
use crate::event::{now, tag, Event, Tag, UnsignedEvent};
use crate::kind;

pub const MLS_PROTOCOL_VERSION: &str = "1.0";
pub const CIPHERSUITE_TAG: &str = "0x0001";
/// Group metadata, last_resort, required_capabilities.
pub const EXTENSION_TAGS: [&str; 3] = ["0xf2ee", "0x000a", "0x0003"];
pub const ENCODING: &str = "base64";

/// Default window for randomizing gift-wrap timestamps (two days).
pub const GIFT_WRAP_JITTER_SECS: u64 = 2 * 24 * 60 * 60;

fn relays_tag(relays: &[String]) -> Tag {
    let refs: Vec<&str> = relays.iter().map(String::as_str).collect();
    tag("relays", &refs)
}

// ── Public events ────────────────────────────────────────────────────────────

/// Kind 443. `key_package_b64` is the TLS-serialized key package, base64.
pub fn key_package(
    identity: &Identity,
    key_package_b64: &str,
    relays: &[String],
) -> Result<Event, ProtoError> {
    let tags = vec![
        tag("mls_protocol_version", &[MLS_PROTOCOL_VERSION]),
        tag("ciphersuite", &[CIPHERSUITE_TAG]),
        tag("extensions", &EXTENSION_TAGS),
        tag("encoding", &[ENCODING]),
        relays_tag(relays),
        tag("-", &[]),
    ];
    UnsignedEvent::new(identity.public(), now(), kind::KEY_PACKAGE, tags, key_package_b64)?
        .sign(identity)
}

/// Kind 445. Signed by a key generated for this message alone, so two
/// messages from the same member are unlinkable at the relay.
pub fn group_message(transport_id: &[u8; 32], content: String) -> Result<Event, ProtoError> {
    let disposable = Identity::generate();
    let tags = vec![tag("h", &[&hex::encode(transport_id)])];
    UnsignedEvent::new(disposable.public(), now(), kind::GROUP_MESSAGE, tags, content)?
        .sign(&disposable)
}

// ── Rumors ───────────────────────────────────────────────────────────────────

/// Kind 444. `key_package_event_id` marks which published package the
/// welcome consumed.
pub fn welcome_rumor(
    author: PublicKey,
    welcome_b64: &str,
    key_package_event_id: &str,
    relays: &[String],
) -> Result<UnsignedEvent, ProtoError> {
    let tags = vec![
        tag("e", &[key_package_event_id]),
        relays_tag(relays),
        tag("encoding", &[ENCODING]),
    ];
    UnsignedEvent::new(author, now(), kind::WELCOME, tags, welcome_b64)
}

/// Kind 9. Authenticity comes from the encryption around it.
pub fn chat_rumor(
    author: PublicKey,
    content: &str,
    tags: Vec<Tag>,
) -> Result<UnsignedEvent, ProtoError> {
    UnsignedEvent::new(author, now(), kind::CHAT, tags, content)
}

// ── Seal / gift wrap ─────────────────────────────────────────────────────────

fn jittered_now(max_jitter_secs: u64) -> u64 {
    let jitter = if max_jitter_secs == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=max_jitter_secs)
    };
    now().saturating_sub(jitter)
}

/// Kind 13: rumor encrypted sender → recipient, signed by the sender.
pub fn seal(
    sender: &Identity,
    rumor: &UnsignedEvent,
    recipient: &PublicKey,
    max_jitter_secs: u64,
) -> Result<Event, ProtoError> {
    if rumor.pubkey != sender.public() {
        return Err(ProtoError::AuthorMismatch);
    }
    let key = ConversationKey::between(&sender.x25519_secret(), &recipient.to_x25519()?)?;
    let content = key.encrypt(serde_json::to_string(rumor)?.as_bytes())?;
    UnsignedEvent::new(
        sender.public(),
        jittered_now(max_jitter_secs),
        kind::SEAL,
        vec![],
        content,
    )?
    .sign(sender)
}

/// Kind 1059: seal encrypted ephemeral → recipient, signed by the ephemeral key.
pub fn gift_wrap(
    seal: &Event,
    recipient: &PublicKey,
    max_jitter_secs: u64,
) -> Result<Event, ProtoError> {
    seal.expect_kind(kind::SEAL)?;
    let ephemeral = Identity::generate();
    let key = ConversationKey::between(&ephemeral.x25519_secret(), &recipient.to_x25519()?)?;
    let content = key.encrypt(serde_json::to_string(seal)?.as_bytes())?;
    UnsignedEvent::new(
        ephemeral.public(),
        jittered_now(max_jitter_secs),
        kind::GIFT_WRAP,
        vec![tag("p", &[&recipient.to_hex()])],
        content,
    )?
    .sign(&ephemeral)
}

/// Seal and wrap `rumor` for `recipient` in one step.
pub fn wrap_for(
    sender: &Identity,
    rumor: &UnsignedEvent,
    recipient: &PublicKey,
    max_jitter_secs: u64,
) -> Result<Event, ProtoError> {
    let sealed = seal(sender, rumor, recipient, max_jitter_secs)?;
    gift_wrap(&sealed, recipient, max_jitter_secs)
}

#[derive(Debug, Clone)]
pub struct Unwrapped {
    /// Real sender, proven by the seal signature.
    pub sender: PublicKey,
    pub rumor: UnsignedEvent,
}

/// Open a gift wrap addressed to `recipient`.
///
/// Checks both signatures, the rumor id and that the rumor author is the
/// seal signer.
pub fn unwrap(recipient: &Identity, wrap: &Event) -> Result<Unwrapped, ProtoError> {
    wrap.expect_kind(kind::GIFT_WRAP)?;
    wrap.verify()?;

    let outer = ConversationKey::between(&recipient.x25519_secret(), &wrap.pubkey.to_x25519()?)?;
    let seal_json = outer.decrypt(&wrap.content)?;
    let seal: Event = serde_json::from_slice(&seal_json)?;
    seal.expect_kind(kind::SEAL)?;
    seal.verify()?;

    let inner = ConversationKey::between(&recipient.x25519_secret(), &seal.pubkey.to_x25519()?)?;
    let rumor_json = inner.decrypt(&seal.content)?;
    let rumor: UnsignedEvent = serde_json::from_slice(&rumor_json)?;
    rumor.verify_id()?;
    if rumor.pubkey != seal.pubkey {
        return Err(ProtoError::AuthorMismatch);
    }

    Ok(Unwrapped {
        sender: seal.pubkey,
        rumor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tag_value;

    #[test]
    fn key_package_event_tags() {
        let id = Identity::generate();
        let ev = key_package(&id, "AAAA", &["wss://r1".into(), "wss://r2".into()]).unwrap();
        ev.verify().unwrap();
        assert_eq!(ev.kind, kind::KEY_PACKAGE);
        assert_eq!(ev.pubkey, id.public());
        assert_eq!(ev.tag_value("mls_protocol_version"), Some("1.0"));
        assert_eq!(ev.tag_value("ciphersuite"), Some("0x0001"));
        assert_eq!(ev.tag_values("extensions"), EXTENSION_TAGS.to_vec());
        assert_eq!(ev.tag_value("encoding"), Some("base64"));
        assert_eq!(ev.tag_values("relays"), vec!["wss://r1", "wss://r2"]);
        assert!(ev.tags.iter().any(|t| t == &vec!["-".to_string()]));
    }

    #[test]
    fn group_messages_use_disposable_keys() {
        let a = group_message(&[7; 32], "x".into()).unwrap();
        let b = group_message(&[7; 32], "x".into()).unwrap();
        a.verify().unwrap();
        assert_ne!(a.pubkey, b.pubkey);
        assert_eq!(a.tags.len(), 1);
        assert_eq!(a.tag_value("h"), Some(hex::encode([7u8; 32]).as_str()));
    }

    #[test]
    fn welcome_rumor_references_key_package() {
        let id = Identity::generate();
        let rumor = welcome_rumor(id.public(), "V0VM", "kp-event", &[]).unwrap();
        assert_eq!(tag_value(&rumor.tags, "e"), Some("kp-event"));
        rumor.verify_id().unwrap();
    }

    #[test]
    fn gift_wrap_roundtrip_hides_sender() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let rumor = welcome_rumor(alice.public(), "V0VM", "kp", &[]).unwrap();
        let wrap = wrap_for(&alice, &rumor, &bob.public(), GIFT_WRAP_JITTER_SECS).unwrap();

        assert_eq!(wrap.kind, kind::GIFT_WRAP);
        assert_ne!(wrap.pubkey, alice.public());
        assert!(!wrap.to_json().unwrap().contains(&alice.public().to_hex()));
        assert_eq!(wrap.tag_value("p"), Some(bob.public().to_hex().as_str()));
        assert!(wrap.created_at <= now());
        assert!(wrap.created_at + GIFT_WRAP_JITTER_SECS + 5 >= now());

        let opened = unwrap(&bob, &wrap).unwrap();
        assert_eq!(opened.sender, alice.public());
        assert_eq!(opened.rumor, rumor);
    }

    #[test]
    fn wrong_recipient_cannot_unwrap() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let eve = Identity::generate();
        let rumor = welcome_rumor(alice.public(), "V0VM", "kp", &[]).unwrap();
        let wrap = wrap_for(&alice, &rumor, &bob.public(), 0).unwrap();
        assert!(unwrap(&eve, &wrap).is_err());
    }

    #[test]
    fn seal_rejects_foreign_rumor() {
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let bob = Identity::generate();
        let rumor = chat_rumor(alice.public(), "hi", vec![]).unwrap();
        assert!(matches!(
            seal(&mallory, &rumor, &bob.public(), 0),
            Err(ProtoError::AuthorMismatch)
        ));
    }
}
