//! MLS error types.

use thiserror::Error;

use enclave_proto::ExtensionError;

/// Errors that can occur during group engine operations.
///
/// None of these leave caller-visible state modified: every operation takes
/// serialized state in and only hands new state out on success.
#[derive(Error, Debug)]
pub enum MlsError {
    /// TLS or state-blob (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Provider storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Cryptographic or protocol operation rejected by the MLS library
    #[error("crypto error: {0}")]
    Crypto(String),

    /// State blob has a version this build does not understand
    #[error("unsupported state version {0}")]
    StateVersion(u8),

    /// State blob does not contain the group it claims to
    #[error("group not found in state")]
    GroupNotFound,

    /// Group context is missing the metadata extension
    #[error("group metadata extension missing")]
    MissingMetadata,

    /// Metadata extension present but malformed
    #[error("group metadata: {0}")]
    Metadata(#[from] ExtensionError),

    /// Caller is not listed as an admin
    #[error("not a group admin")]
    NotAdmin,

    /// A commit was signed by a member who is not an admin
    #[error("commit from non-admin member {0}")]
    NonAdminCommit(String),

    /// Application messages need at least one other member to read them
    #[error("group has {members} member(s); at least 2 are required to send")]
    SingleMemberGroup { members: usize },

    /// Key package failed validation
    #[error("invalid key package: {0}")]
    InvalidKeyPackage(String),

    /// Credential is not a 32-byte basic credential
    #[error("invalid credential: {0}")]
    Credential(String),

    /// Message body was not the expected MLS message type
    #[error("unexpected message type: {0}")]
    UnexpectedMessage(String),

    /// Commit produced no welcome although members were added
    #[error("commit produced no welcome")]
    NoWelcome,
}

impl MlsError {
    /// Errors caused by the caller rather than by incoming data.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::NotAdmin | Self::SingleMemberGroup { .. } | Self::StateVersion(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_errors() {
        assert!(MlsError::NotAdmin.is_local());
        assert!(MlsError::SingleMemberGroup { members: 1 }.is_local());
        assert!(!MlsError::Crypto("bad signature".into()).is_local());
    }
}
