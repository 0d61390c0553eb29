//! Conversation keys and the versioned payload format.
//!
//! Two ways to arrive at the same kind of key:
//!
//! - **Group mode** (`from_export_secret`): the per-epoch export secret is
//!   used as an X25519 secret and paired with its own public point. Anyone
//!   holding the epoch's export secret derives the same key; nobody else can.
//! - **Recipient mode** (`between`): ordinary X25519 between a sender secret
//!   and a recipient public key.
//!
//! Either way the shared secret is run through HKDF-SHA256 with the
//! `enclave-conv-v2` salt.
//!
//! Payload (base64, standard alphabet):
//!   [ version = 0x02 | nonce (24) | XChaCha20-Poly1305(padded plaintext) ]

use base64::{engine::general_purpose::STANDARD, Engine};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::{aead, error::CryptoError, kdf};

pub const PAYLOAD_VERSION: u8 = 0x02;

#[derive(ZeroizeOnDrop)]
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    /// Group-mode key from a 32-byte export secret.
    pub fn from_export_secret(export_secret: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = StaticSecret::from(*export_secret);
        let public = X25519Public::from(&secret);
        Self::between(&secret, &public)
    }

    /// Recipient-mode key: DH(secret, public) → HKDF.
    pub fn between(secret: &StaticSecret, public: &X25519Public) -> Result<Self, CryptoError> {
        let shared = secret.diffie_hellman(public);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(
                "non-contributory X25519 shared secret".into(),
            ));
        }
        let derived = kdf::conversation_key(shared.as_bytes())?;
        Ok(Self(derived.0))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let sealed = aead::seal(&self.0, plaintext, &[PAYLOAD_VERSION])?;
        let mut out = Vec::with_capacity(1 + sealed.len());
        out.push(PAYLOAD_VERSION);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    /// Fails closed: a payload sealed under any other key yields
    /// `CryptoError::AeadDecrypt`, never garbage plaintext.
    pub fn decrypt(&self, payload: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let raw = STANDARD.decode(payload.trim())?;
        let (&version, sealed) = raw
            .split_first()
            .ok_or_else(|| CryptoError::MalformedPayload("empty payload".into()))?;
        if version != PAYLOAD_VERSION {
            return Err(CryptoError::UnknownVersion(version));
        }
        aead::open(&self.0, sealed, &[PAYLOAD_VERSION])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn group_mode_roundtrip() {
        let key = ConversationKey::from_export_secret(&[3u8; 32]).unwrap();
        let payload = key.encrypt(b"{\"content\":\"Hello\"}").unwrap();
        let same = ConversationKey::from_export_secret(&[3u8; 32]).unwrap();
        assert_eq!(same.decrypt(&payload).unwrap().as_slice(), b"{\"content\":\"Hello\"}");
    }

    #[test]
    fn identical_plaintext_encrypts_differently() {
        let key = ConversationKey::from_export_secret(&[3u8; 32]).unwrap();
        let a = key.encrypt(b"same").unwrap();
        let b = key.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn other_epoch_secret_fails_closed() {
        let k1 = ConversationKey::from_export_secret(&[1u8; 32]).unwrap();
        let k2 = ConversationKey::from_export_secret(&[2u8; 32]).unwrap();
        let payload = k1.encrypt(b"secret").unwrap();
        assert!(matches!(k2.decrypt(&payload), Err(CryptoError::AeadDecrypt)));
    }

    #[test]
    fn recipient_mode_is_symmetric() {
        let sender = Identity::generate();
        let recipient = Identity::generate();
        let k_send = ConversationKey::between(
            &sender.x25519_secret(),
            &recipient.public().to_x25519().unwrap(),
        )
        .unwrap();
        let k_recv = ConversationKey::between(
            &recipient.x25519_secret(),
            &sender.public().to_x25519().unwrap(),
        )
        .unwrap();
        let payload = k_send.encrypt(b"welcome").unwrap();
        assert_eq!(k_recv.decrypt(&payload).unwrap().as_slice(), b"welcome");
    }

    #[test]
    fn foreign_payloads_are_recognised() {
        let key = ConversationKey::from_export_secret(&[1u8; 32]).unwrap();
        assert!(key.decrypt("not base64 !!").unwrap_err().is_foreign_format());
        let v1 = STANDARD.encode([0x01u8; 64]);
        assert!(matches!(key.decrypt(&v1), Err(CryptoError::UnknownVersion(1))));
    }
}
