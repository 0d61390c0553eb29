//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes (random).  Tag: 16 bytes.
//!
//! Ciphertext wire format:
//!   [ nonce (24 bytes) | ciphertext + tag ]
//!
//! Plaintext is padded before sealing so ciphertext length only reveals a
//! power-of-two size class:
//!   [ len: u16 BE | plaintext | zero padding ]

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

const MIN_PADDED_LEN: usize = 32;
pub const MAX_PLAINTEXT_LEN: usize = u16::MAX as usize;

/// Encrypt `plaintext` with a 32-byte key, prepending a fresh random nonce.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let padded = pad(plaintext)?;
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: &padded, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag) and strip padding.
pub fn open(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::MalformedPayload(format!(
            "sealed payload too short: {} bytes",
            data.len()
        )));
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce = XNonce::from_slice(nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let padded = Zeroizing::new(
        cipher
            .decrypt(nonce, Payload { msg: ct, aad })
            .map_err(|_| CryptoError::AeadDecrypt)?,
    );
    unpad(&padded)
}

/// Size class for a plaintext of `len` bytes (prefix included).
pub fn padded_len(len: usize) -> usize {
    let needed = len + 2;
    needed.next_power_of_two().max(MIN_PADDED_LEN)
}

fn pad(plaintext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if plaintext.is_empty() {
        return Err(CryptoError::MalformedPayload("plaintext is empty".into()));
    }
    if plaintext.len() > MAX_PLAINTEXT_LEN {
        return Err(CryptoError::MalformedPayload(format!(
            "plaintext of {} bytes exceeds {MAX_PLAINTEXT_LEN}",
            plaintext.len()
        )));
    }
    let target = padded_len(plaintext.len());
    let mut out = Zeroizing::new(Vec::with_capacity(target));
    out.extend_from_slice(&(plaintext.len() as u16).to_be_bytes());
    out.extend_from_slice(plaintext);
    out.resize(target, 0);
    Ok(out)
}

fn unpad(padded: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if padded.len() < 2 {
        return Err(CryptoError::MalformedPayload("missing length prefix".into()));
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len == 0 || 2 + len > padded.len() || padded.len() != padded_len(len) {
        return Err(CryptoError::MalformedPayload("invalid padding".into()));
    }
    Ok(Zeroizing::new(padded[2..2 + len].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"hello enclave", b"aad").unwrap();
        let opened = open(&key, &sealed, b"aad").unwrap();
        assert_eq!(opened.as_slice(), b"hello enclave");
    }

    #[test]
    fn wrong_aad_fails() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"hello", b"one").unwrap();
        assert!(matches!(open(&key, &sealed, b"two"), Err(CryptoError::AeadDecrypt)));
    }

    #[test]
    fn padding_hides_exact_length() {
        assert_eq!(padded_len(1), 32);
        assert_eq!(padded_len(30), 32);
        assert_eq!(padded_len(31), 64);
        assert_eq!(padded_len(1000), 1024);

        let key = [1u8; 32];
        let a = seal(&key, b"a", b"").unwrap();
        let b = seal(&key, b"twenty bytes of text", b"").unwrap();
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn empty_plaintext_rejected() {
        assert!(seal(&[0u8; 32], b"", b"").is_err());
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let err = open(&[0u8; 32], &[0u8; 10], b"").unwrap_err();
        assert!(err.is_foreign_format());
    }
}
