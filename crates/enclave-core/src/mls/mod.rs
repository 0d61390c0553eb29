//! MLS group engine built on OpenMLS.
//!
//! Every operation is a function from serialized state to serialized state.
//! Callers persist the returned state only when the call succeeds; on error
//! they keep what they had. The engine holds no state between calls.
//!
//! # Module layout
//! - `group`:       create / admit / encrypt / process / join / export
//! - `key_package`: key package factory and validation
//! - `provider`:    OpenMLS provider with snapshot-able storage
//! - `constants`:   ciphersuite and fixed join configuration
//! - `error`:       `MlsError`

pub mod constants;
pub mod error;
pub mod group;
pub mod key_package;
pub mod provider;

pub use error::MlsError;
pub use group::{
    admit_member, create_group, derive_epoch_secret, encrypt_application_message, group_summary,
    join_from_welcome, process_incoming_message, Admission, CreatedGroup, Encrypted,
    GroupSummary, Incoming, NewGroup, Processed,
};
pub use key_package::{build_key_package, validate_key_package, KeyPackageArtifact};

use openmls::prelude::{BasicCredential, Credential, CredentialWithKey};
use openmls_basic_credential::SignatureKeyPair;
use openmls_traits::types::SignatureScheme;

use enclave_crypto::{Identity, PublicKey};

/// The identity key doubles as the MLS signature key.
pub(crate) fn signer(identity: &Identity) -> SignatureKeyPair {
    SignatureKeyPair::from_raw(
        SignatureScheme::ED25519,
        identity.secret_bytes().to_vec(),
        identity.public().0.to_vec(),
    )
}

/// Basic credential whose identity is the raw 32-byte public key.
pub(crate) fn credential_with_key(identity: &Identity) -> CredentialWithKey {
    let public = identity.public();
    let credential = BasicCredential::new(public.0.to_vec());
    CredentialWithKey {
        credential: credential.into(),
        signature_key: public.0.as_slice().into(),
    }
}

pub(crate) fn identity_of(credential: &Credential) -> Result<PublicKey, MlsError> {
    let basic = BasicCredential::try_from(credential.clone())
        .map_err(|e| MlsError::Credential(e.to_string()))?;
    PublicKey::from_slice(basic.identity()).map_err(|e| MlsError::Credential(e.to_string()))
}
