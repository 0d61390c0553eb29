//! Key package factory.
//!
//! A key package announces "this identity can be added to a group". The
//! public half is published (kind 443); the private half (HPKE init key,
//! leaf encryption key) stays in a provider storage snapshot until a welcome
//! consumes it.

use openmls::prelude::{ExtensionType, KeyPackage, KeyPackageIn};
use openmls_traits::OpenMlsProvider;
use tls_codec::{Deserialize as _, Serialize as _};
use tracing::debug;

use enclave_crypto::{Identity, PublicKey};
use enclave_proto::extension::EXTENSION_TYPE;

use super::constants::{capabilities, CIPHERSUITE, PROTOCOL_VERSION};
use super::error::MlsError;
use super::provider::EnclaveProvider;
use super::{credential_with_key, identity_of, signer};

#[derive(Debug, Clone)]
pub struct KeyPackageArtifact {
    /// TLS-serialized public key package.
    pub key_package: Vec<u8>,
    /// Hash reference, hex.
    pub reference: String,
    /// Provider snapshot holding the private halves.
    pub private_state: Vec<u8>,
    pub last_resort: bool,
}

pub fn build_key_package(identity: &Identity, last_resort: bool) -> Result<KeyPackageArtifact, MlsError> {
    let provider = EnclaveProvider::default();
    let signer = signer(identity);

    let mut builder = KeyPackage::builder().leaf_node_capabilities(capabilities());
    if last_resort {
        builder = builder.mark_as_last_resort();
    }
    let bundle = builder
        .build(CIPHERSUITE, &provider, &signer, credential_with_key(identity))
        .map_err(|e| MlsError::Crypto(format!("key package build failed: {e}")))?;

    let key_package = bundle
        .key_package()
        .tls_serialize_detached()
        .map_err(|e| MlsError::Serialization(e.to_string()))?;
    let reference = bundle
        .key_package()
        .hash_ref(provider.crypto())
        .map_err(|e| MlsError::Crypto(e.to_string()))?;
    let reference = hex::encode(reference.as_slice());

    debug!(reference = %reference, last_resort, "key package built");
    Ok(KeyPackageArtifact {
        key_package,
        reference,
        private_state: provider.snapshot(None)?,
        last_resort,
    })
}

/// Check signature, protocol version, ciphersuite and that the leaf
/// supports the group metadata extension. Returns the package and the
/// identity in its credential.
pub fn validate_key_package(bytes: &[u8]) -> Result<(KeyPackage, PublicKey), MlsError> {
    let provider = EnclaveProvider::default();
    let kp_in = KeyPackageIn::tls_deserialize_exact(bytes)
        .map_err(|e| MlsError::InvalidKeyPackage(format!("decode: {e}")))?;
    let kp = kp_in
        .validate(provider.crypto(), PROTOCOL_VERSION)
        .map_err(|e| MlsError::InvalidKeyPackage(e.to_string()))?;

    if kp.ciphersuite() != CIPHERSUITE {
        return Err(MlsError::InvalidKeyPackage(format!(
            "unsupported ciphersuite {:?}",
            kp.ciphersuite()
        )));
    }
    let supports_metadata = kp
        .leaf_node()
        .capabilities()
        .extensions()
        .contains(&ExtensionType::Unknown(EXTENSION_TYPE));
    if !supports_metadata {
        return Err(MlsError::InvalidKeyPackage(
            "leaf does not support the group metadata extension".into(),
        ));
    }

    let identity = identity_of(kp.leaf_node().credential())?;
    Ok((kp, identity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_package_validates() {
        let id = Identity::generate();
        let artifact = build_key_package(&id, true).unwrap();
        assert_eq!(artifact.reference.len(), 64);
        assert!(!artifact.private_state.is_empty());

        let (kp, owner) = validate_key_package(&artifact.key_package).unwrap();
        assert_eq!(owner, id.public());
        assert!(kp.extensions().contains(ExtensionType::LastResort));
    }

    #[test]
    fn tampered_package_rejected() {
        let id = Identity::generate();
        let mut bytes = build_key_package(&id, false).unwrap().key_package;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            validate_key_package(&bytes),
            Err(MlsError::InvalidKeyPackage(_))
        ));
    }

    #[test]
    fn garbage_rejected() {
        assert!(validate_key_package(b"not a key package").is_err());
    }
}
