use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch: wrong key or tampering)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Unknown payload version: {0}")]
    UnknownVersion(u8),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Key encoding error: {0}")]
    KeyEncoding(String),

    #[error("Identity file error: {0}")]
    IdentityFile(#[from] std::io::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

impl CryptoError {
    /// True when the input does not look like one of our payloads at all, as
    /// opposed to a payload of ours that failed to authenticate.
    pub fn is_foreign_format(&self) -> bool {
        matches!(
            self,
            CryptoError::UnknownVersion(_)
                | CryptoError::MalformedPayload(_)
                | CryptoError::Base64Decode(_)
        )
    }
}
