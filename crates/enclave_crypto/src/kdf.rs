//! Key derivation functions
//!
//! `hkdf_expand`: HKDF-SHA256 over arbitrary input key material.
//!
//! `conversation_key`: derives the 32-byte AEAD key shared by two parties
//!   from an X25519 shared secret.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// Salt bound into every conversation key. Changing it invalidates all
/// previously encrypted payloads.
pub const CONVERSATION_SALT: &[u8] = b"enclave-conv-v2";

const CONVERSATION_INFO: &[u8] = b"conversation-key";

/// 32-byte symmetric key material. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct DerivedKey(pub [u8; 32]);

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive the conversation key for a given X25519 shared secret.
pub fn conversation_key(shared_secret: &[u8; 32]) -> Result<DerivedKey, CryptoError> {
    let mut key = [0u8; 32];
    hkdf_expand(shared_secret, Some(CONVERSATION_SALT), CONVERSATION_INFO, &mut key)?;
    Ok(DerivedKey(key))
}
