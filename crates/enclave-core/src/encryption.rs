//! Outer encryption of group events and the chat payload carried inside MLS.
//!
//! Every kind-445 event's content is an MLS message sealed under a
//! conversation key derived from the group's export secret for the epoch the
//! message was produced in. Relays see only ciphertext and a routing tag.
//! The MLS application plaintext is the JSON of an unsigned kind-9 rumor.

use zeroize::Zeroizing;

use enclave_crypto::{ConversationKey, CryptoError};
use enclave_proto::{builder, kind, Event, ProtoError, Tag, UnsignedEvent};

/// Seal a serialized MLS message for transport.
pub fn encrypt_group_event(
    export_secret: &[u8; 32],
    mls_message: &[u8],
) -> Result<String, CryptoError> {
    ConversationKey::from_export_secret(export_secret)?.encrypt(mls_message)
}

/// Open a kind-445 content string. Content sealed under any other epoch's
/// secret fails with `CryptoError::AeadDecrypt`.
pub fn decrypt_group_event(
    export_secret: &[u8; 32],
    content: &str,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    ConversationKey::from_export_secret(export_secret)?.decrypt(content)
}

/// Build the kind-445 event carrying `mls_message` for the group routed by
/// `transport_id`.
pub fn seal_group_event(
    export_secret: &[u8; 32],
    transport_id: &[u8; 32],
    mls_message: &[u8],
) -> Result<Event, ProtoError> {
    let content = encrypt_group_event(export_secret, mls_message)?;
    builder::group_message(transport_id, content)
}

// ── Chat payload ─────────────────────────────────────────────────────────────

pub fn encode_chat(rumor: &UnsignedEvent) -> Result<Vec<u8>, ProtoError> {
    Ok(serde_json::to_vec(rumor)?)
}

/// Parse an application plaintext back into a kind-9 rumor and check its id.
pub fn decode_chat(plaintext: &[u8]) -> Result<UnsignedEvent, ProtoError> {
    let rumor: UnsignedEvent = serde_json::from_slice(plaintext)?;
    if rumor.kind != kind::CHAT {
        return Err(ProtoError::UnexpectedKind {
            expected: kind::CHAT,
            actual: rumor.kind,
        });
    }
    rumor.verify_id()?;
    Ok(rumor)
}

/// Chat rumor ready to be handed to the MLS layer.
pub fn chat_payload(
    author: enclave_crypto::PublicKey,
    content: &str,
    tags: Vec<Tag>,
) -> Result<(UnsignedEvent, Vec<u8>), ProtoError> {
    let rumor = builder::chat_rumor(author, content, tags)?;
    let bytes = encode_chat(&rumor)?;
    Ok((rumor, bytes))
}
