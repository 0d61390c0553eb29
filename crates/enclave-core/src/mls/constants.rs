//! MLS protocol constants and the fixed local configuration re-attached to
//! every group on load.

use openmls::prelude::{
    Capabilities, ExtensionType, MlsGroupJoinConfig, ProtocolVersion,
    RequiredCapabilitiesExtension, SenderRatchetConfiguration,
};
use openmls_traits::types::Ciphersuite;

use enclave_proto::extension::EXTENSION_TYPE;

pub const CIPHERSUITE: Ciphersuite = Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::Mls10;

/// Exporter label and context for the outer encryption secret.
pub const EXPORTER_LABEL: &str = "enclave";
pub const EXPORTER_CONTEXT: &[u8] = b"group-event";
pub const EXPORTER_LENGTH: usize = 32;

/// Application messages are padded by the outer layer, not by MLS.
pub const PADDING_SIZE: usize = 0;

/// How many past generations a receiver keeps per sender ratchet.
pub const OUT_OF_ORDER_TOLERANCE: u32 = 5;
/// How far ahead of the current generation a message may be.
pub const MAXIMUM_FORWARD_DISTANCE: u32 = 1000;

/// Leaf capabilities advertised by every key package and group creator.
pub fn capabilities() -> Capabilities {
    Capabilities::new(
        None,
        Some(&[CIPHERSUITE]),
        Some(&[ExtensionType::Unknown(EXTENSION_TYPE), ExtensionType::LastResort]),
        None,
        None,
    )
}

/// Every member must understand the metadata extension.
pub fn required_capabilities() -> RequiredCapabilitiesExtension {
    RequiredCapabilitiesExtension::new(&[ExtensionType::Unknown(EXTENSION_TYPE)], &[], &[])
}

pub fn sender_ratchet() -> SenderRatchetConfiguration {
    SenderRatchetConfiguration::new(OUT_OF_ORDER_TOLERANCE, MAXIMUM_FORWARD_DISTANCE)
}

/// Local-only group configuration. Not carried in the serialized state, so
/// it is applied again every time a group is loaded or joined.
pub fn join_config() -> MlsGroupJoinConfig {
    MlsGroupJoinConfig::builder()
        .padding_size(PADDING_SIZE)
        .use_ratchet_tree_extension(true)
        .sender_ratchet_configuration(sender_ratchet())
        .build()
}
