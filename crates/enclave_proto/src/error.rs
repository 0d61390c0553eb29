use thiserror::Error;

use enclave_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} trailing bytes after end of structure")]
    TrailingBytes(usize),

    #[error("Field `{field}` is {len} bytes, exceeds u16 length prefix")]
    FieldTooLong { field: &'static str, len: usize },
}

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Unsupported group metadata version: {0}")]
    UnsupportedVersion(u16),

    #[error("Field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("Admin block of {0} bytes is not a multiple of 32")]
    AdminBlockLength(usize),

    #[error("Invalid relay URL: {0:?}")]
    InvalidRelay(String),
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Event id does not match content")]
    IdMismatch,

    #[error("Event signature invalid")]
    BadSignature,

    #[error("Unexpected event kind: expected {expected}, got {actual}")]
    UnexpectedKind { expected: u16, actual: u16 },

    #[error("Missing or invalid tag `{0}`")]
    MissingTag(&'static str),

    #[error("Rumor author does not match seal signer")]
    AuthorMismatch,

    #[error("Malformed relay message: {0}")]
    RelayMessage(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}
