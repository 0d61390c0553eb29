use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid record id: {0:?}")]
    InvalidId(String),

    #[error("Epoch regression for group {group}: stored={stored} attempted={attempted}")]
    EpochRegression {
        group: String,
        stored: u64,
        attempted: u64,
    },
}
