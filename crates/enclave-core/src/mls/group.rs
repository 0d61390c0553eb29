//! Group operations.
//!
//! State in, state out. A `LoadedGroup` exists only for the duration of one
//! call: it is rebuilt from the caller's bytes, mutated, and snapshotted
//! again. If anything fails in between, the snapshot is never taken and the
//! caller's bytes remain the truth.

use openmls::prelude::{
    Extension, Extensions, GroupId, MlsGroup, MlsGroupCreateConfig, MlsMessageBodyIn,
    MlsMessageIn, ProcessedMessageContent, ProtocolMessage, StagedWelcome, UnknownExtension,
};
use openmls_traits::OpenMlsProvider;
use rand::RngCore;
use tls_codec::{Deserialize as _, Serialize as _};
use tracing::{debug, info};

use enclave_crypto::{Identity, PublicKey};
use enclave_proto::extension::{GroupMetadata, ImageRef, EXTENSION_TYPE};

use super::constants::{
    capabilities, join_config, required_capabilities, sender_ratchet, CIPHERSUITE,
    EXPORTER_CONTEXT, EXPORTER_LABEL, EXPORTER_LENGTH, PADDING_SIZE,
};
use super::error::MlsError;
use super::key_package::validate_key_package;
use super::provider::EnclaveProvider;
use super::{credential_with_key, identity_of, signer};

// ── Inputs / outputs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct NewGroup {
    pub name: String,
    pub description: String,
    pub relays: Vec<String>,
    /// Additional admins. The creator is always an admin.
    pub admins: Vec<PublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub mls_group_id: Vec<u8>,
    pub epoch: u64,
    pub members: Vec<PublicKey>,
    pub metadata: GroupMetadata,
}

impl GroupSummary {
    pub fn mls_group_id_hex(&self) -> String {
        hex::encode(&self.mls_group_id)
    }
}

#[derive(Debug, Clone)]
pub struct CreatedGroup {
    pub summary: GroupSummary,
    pub state: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Admission {
    pub state: Vec<u8>,
    /// Commit to broadcast to existing members.
    pub commit: Vec<u8>,
    /// Welcome for the new member.
    pub welcome: Option<Vec<u8>>,
    pub summary: GroupSummary,
}

#[derive(Debug, Clone)]
pub struct Encrypted {
    pub ciphertext: Vec<u8>,
    pub state: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Application { sender: PublicKey, plaintext: Vec<u8> },
    Commit { epoch: u64, committer: PublicKey },
    Proposal { sender: PublicKey },
}

#[derive(Debug, Clone)]
pub struct Processed {
    pub result: Incoming,
    pub state: Vec<u8>,
    pub summary: GroupSummary,
}

// ── Loaded group ──────────────────────────────────────────────────────────────

struct LoadedGroup {
    provider: EnclaveProvider,
    group: MlsGroup,
}

impl LoadedGroup {
    fn load(state: &[u8]) -> Result<Self, MlsError> {
        let (provider, group_id) = EnclaveProvider::restore(state)?;
        let group_id = GroupId::from_slice(&group_id.ok_or(MlsError::GroupNotFound)?);
        let mut group = MlsGroup::load(provider.storage(), &group_id)
            .map_err(|e| MlsError::Storage(e.to_string()))?
            .ok_or(MlsError::GroupNotFound)?;
        // local policy is not part of the wire state
        group
            .set_configuration(provider.storage(), &join_config())
            .map_err(|e| MlsError::Storage(e.to_string()))?;
        Ok(Self { provider, group })
    }

    fn save(&self) -> Result<Vec<u8>, MlsError> {
        self.provider.snapshot(Some(self.group.group_id().as_slice()))
    }

    fn metadata(&self) -> Result<GroupMetadata, MlsError> {
        let ext = self
            .group
            .extensions()
            .unknown(EXTENSION_TYPE)
            .ok_or(MlsError::MissingMetadata)?;
        Ok(GroupMetadata::decode(&ext.0)?)
    }

    fn members(&self) -> Result<Vec<PublicKey>, MlsError> {
        self.group
            .members()
            .map(|m| identity_of(&m.credential))
            .collect()
    }

    fn summary(&self) -> Result<GroupSummary, MlsError> {
        Ok(GroupSummary {
            mls_group_id: self.group.group_id().to_vec(),
            epoch: self.group.epoch().as_u64(),
            members: self.members()?,
            metadata: self.metadata()?,
        })
    }
}

fn random_id() -> [u8; 32] {
    let mut id = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut id);
    id
}

// ── Operations ────────────────────────────────────────────────────────────────

/// Create a group with `identity` as its only member and first admin.
///
/// The MLS group id and the transport id are drawn independently.
pub fn create_group(identity: &Identity, params: NewGroup) -> Result<CreatedGroup, MlsError> {
    let mut admins = params.admins;
    if !admins.contains(&identity.public()) {
        admins.insert(0, identity.public());
    }
    let metadata = GroupMetadata {
        transport_id: random_id(),
        name: params.name,
        description: params.description,
        admins,
        relays: params.relays,
        image: ImageRef::default(),
    };

    let extensions = Extensions::from_vec(vec![
        Extension::Unknown(EXTENSION_TYPE, UnknownExtension(metadata.encode()?)),
        Extension::RequiredCapabilities(required_capabilities()),
    ])
    .map_err(|e| MlsError::Crypto(e.to_string()))?;

    let config = MlsGroupCreateConfig::builder()
        .ciphersuite(CIPHERSUITE)
        .use_ratchet_tree_extension(true)
        .padding_size(PADDING_SIZE)
        .sender_ratchet_configuration(sender_ratchet())
        .capabilities(capabilities())
        .with_group_context_extensions(extensions)
        .map_err(|e| MlsError::Crypto(e.to_string()))?
        .build();

    let provider = EnclaveProvider::default();
    let group = MlsGroup::new_with_group_id(
        &provider,
        &signer(identity),
        &config,
        GroupId::from_slice(&random_id()),
        credential_with_key(identity),
    )
    .map_err(|e| MlsError::Crypto(format!("group creation failed: {e}")))?;

    let loaded = LoadedGroup { provider, group };
    let summary = loaded.summary()?;
    info!(
        group = %summary.mls_group_id_hex(),
        name = %summary.metadata.name,
        "group created"
    );
    Ok(CreatedGroup {
        state: loaded.save()?,
        summary,
    })
}

/// Add the owner of `key_package` to the group. Advances the epoch by one.
pub fn admit_member(
    identity: &Identity,
    state: &[u8],
    key_package: &[u8],
) -> Result<Admission, MlsError> {
    let mut loaded = LoadedGroup::load(state)?;
    if !loaded.metadata()?.is_admin(&identity.public()) {
        return Err(MlsError::NotAdmin);
    }
    let (kp, invitee) = validate_key_package(key_package)?;
    let epoch_before = loaded.group.epoch().as_u64();

    let (commit, welcome, _group_info) = loaded
        .group
        .add_members(&loaded.provider, &signer(identity), &[kp])
        .map_err(|e| MlsError::Crypto(format!("add member failed: {e}")))?;
    loaded
        .group
        .merge_pending_commit(&loaded.provider)
        .map_err(|e| MlsError::Crypto(format!("merge failed: {e}")))?;

    let commit = commit
        .tls_serialize_detached()
        .map_err(|e| MlsError::Serialization(e.to_string()))?;
    let welcome = welcome
        .tls_serialize_detached()
        .map_err(|e| MlsError::Serialization(e.to_string()))?;

    let summary = loaded.summary()?;
    debug_assert_eq!(summary.epoch, epoch_before + 1);
    info!(
        group = %summary.mls_group_id_hex(),
        epoch = summary.epoch,
        member = %invitee.short(),
        "member admitted"
    );
    Ok(Admission {
        state: loaded.save()?,
        commit,
        welcome: Some(welcome),
        summary,
    })
}

/// Encrypt `plaintext` as an MLS application message.
///
/// Refuses groups with a single member: there is nobody to read it, and the
/// MLS library cannot produce a complete message encoding in that case.
pub fn encrypt_application_message(
    identity: &Identity,
    state: &[u8],
    plaintext: &[u8],
) -> Result<Encrypted, MlsError> {
    let mut loaded = LoadedGroup::load(state)?;
    let members = loaded.group.members().count();
    if members < 2 {
        return Err(MlsError::SingleMemberGroup { members });
    }
    let message = loaded
        .group
        .create_message(&loaded.provider, &signer(identity), plaintext)
        .map_err(|e| MlsError::Crypto(format!("create message failed: {e}")))?;
    let ciphertext = message
        .tls_serialize_detached()
        .map_err(|e| MlsError::Serialization(e.to_string()))?;
    Ok(Encrypted {
        ciphertext,
        state: loaded.save()?,
    })
}

/// Process an application message, proposal or commit.
///
/// Commits are only merged if their sender is an admin under the current
/// (pre-commit) metadata.
pub fn process_incoming_message(state: &[u8], message: &[u8]) -> Result<Processed, MlsError> {
    let mut loaded = LoadedGroup::load(state)?;

    let message = MlsMessageIn::tls_deserialize_exact(message)
        .map_err(|e| MlsError::Serialization(format!("MLS message decode: {e}")))?;
    let protocol_message = ProtocolMessage::try_from(message)
        .map_err(|e| MlsError::UnexpectedMessage(format!("{e:?}")))?;

    let processed = loaded
        .group
        .process_message(&loaded.provider, protocol_message)
        .map_err(|e| MlsError::Crypto(format!("process failed: {e}")))?;
    let sender = identity_of(processed.credential())?;

    let result = match processed.into_content() {
        ProcessedMessageContent::ApplicationMessage(app) => Incoming::Application {
            sender,
            plaintext: app.into_bytes(),
        },
        ProcessedMessageContent::ProposalMessage(proposal) => {
            loaded
                .group
                .store_pending_proposal(loaded.provider.storage(), *proposal)
                .map_err(|e| MlsError::Storage(e.to_string()))?;
            debug!(sender = %sender.short(), "proposal stored");
            Incoming::Proposal { sender }
        }
        ProcessedMessageContent::ExternalJoinProposalMessage(_) => {
            return Err(MlsError::UnexpectedMessage(
                "external join proposals are not accepted".into(),
            ));
        }
        ProcessedMessageContent::StagedCommitMessage(staged) => {
            if !loaded.metadata()?.is_admin(&sender) {
                return Err(MlsError::NonAdminCommit(sender.short()));
            }
            loaded
                .group
                .merge_staged_commit(&loaded.provider, *staged)
                .map_err(|e| MlsError::Crypto(format!("merge failed: {e}")))?;
            Incoming::Commit {
                epoch: loaded.group.epoch().as_u64(),
                committer: sender,
            }
        }
    };

    Ok(Processed {
        result,
        summary: loaded.summary()?,
        state: loaded.save()?,
    })
}

/// Join a group from a welcome, using the key package private state that
/// the welcome was addressed to.
pub fn join_from_welcome(
    identity: &Identity,
    key_package_state: &[u8],
    welcome: &[u8],
) -> Result<CreatedGroup, MlsError> {
    let (provider, _) = EnclaveProvider::restore(key_package_state)?;
    let message = MlsMessageIn::tls_deserialize_exact(welcome)
        .map_err(|e| MlsError::Serialization(format!("welcome decode: {e}")))?;
    let welcome = match message.extract() {
        MlsMessageBodyIn::Welcome(w) => w,
        _ => return Err(MlsError::UnexpectedMessage("expected a welcome".into())),
    };

    let group = StagedWelcome::new_from_welcome(&provider, &join_config(), welcome, None)
        .map_err(|e| MlsError::Crypto(format!("welcome rejected: {e}")))?
        .into_group(&provider)
        .map_err(|e| MlsError::Crypto(format!("join failed: {e}")))?;

    let loaded = LoadedGroup { provider, group };
    let summary = loaded.summary()?;
    if !summary.members.contains(&identity.public()) {
        return Err(MlsError::UnexpectedMessage(
            "welcome does not include this identity".into(),
        ));
    }
    info!(
        group = %summary.mls_group_id_hex(),
        epoch = summary.epoch,
        "joined group from welcome"
    );
    Ok(CreatedGroup {
        state: loaded.save()?,
        summary,
    })
}

/// MLS exporter secret for the current epoch. Depends only on `state`.
pub fn derive_epoch_secret(state: &[u8]) -> Result<[u8; 32], MlsError> {
    let loaded = LoadedGroup::load(state)?;
    let secret = loaded
        .group
        .export_secret(
            loaded.provider.crypto(),
            EXPORTER_LABEL,
            EXPORTER_CONTEXT,
            EXPORTER_LENGTH,
        )
        .map_err(|e| MlsError::Crypto(format!("export secret failed: {e}")))?;
    secret
        .as_slice()
        .try_into()
        .map_err(|_| MlsError::Crypto(format!("exporter returned {} bytes", secret.len())))
}

pub fn group_summary(state: &[u8]) -> Result<GroupSummary, MlsError> {
    LoadedGroup::load(state)?.summary()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mls::key_package::build_key_package;

    fn new_group(identity: &Identity) -> CreatedGroup {
        create_group(
            identity,
            NewGroup {
                name: "Test Group".into(),
                description: "unit".into(),
                relays: vec!["wss://relay.one".into(), "wss://relay.two".into()],
                admins: vec![],
            },
        )
        .unwrap()
    }

    /// Alice creates, admits Bob, Bob joins.
    fn two_member_group() -> (Identity, Identity, Vec<u8>, Vec<u8>) {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let created = new_group(&alice);
        let kp = build_key_package(&bob, false).unwrap();
        let admission = admit_member(&alice, &created.state, &kp.key_package).unwrap();
        let joined = join_from_welcome(
            &bob,
            &kp.private_state,
            admission.welcome.as_ref().unwrap(),
        )
        .unwrap();
        (alice, bob, admission.state, joined.state)
    }

    #[test]
    fn create_group_sets_metadata() {
        let alice = Identity::generate();
        let created = new_group(&alice);
        let s = &created.summary;
        assert_eq!(s.epoch, 0);
        assert_eq!(s.members, vec![alice.public()]);
        assert_eq!(s.metadata.name, "Test Group");
        assert_eq!(s.metadata.relays.len(), 2);
        assert_eq!(s.metadata.admins, vec![alice.public()]);
        assert_ne!(s.mls_group_id, s.metadata.transport_id.to_vec());
        assert_eq!(group_summary(&created.state).unwrap(), created.summary);
    }

    #[test]
    fn state_roundtrip_preserves_group() {
        let alice = Identity::generate();
        let created = new_group(&alice);
        let loaded = LoadedGroup::load(&created.state).unwrap();
        assert_eq!(loaded.save().unwrap(), created.state);
    }

    #[test]
    fn epoch_secret_is_pure() {
        let alice = Identity::generate();
        let created = new_group(&alice);
        let a = derive_epoch_secret(&created.state).unwrap();
        let b = derive_epoch_secret(&created.state).unwrap();
        assert_eq!(hex::encode(a), hex::encode(b));
    }

    #[test]
    fn single_member_send_refused() {
        let alice = Identity::generate();
        let created = new_group(&alice);
        assert!(matches!(
            encrypt_application_message(&alice, &created.state, b"hello"),
            Err(MlsError::SingleMemberGroup { members: 1 })
        ));
    }

    #[test]
    fn admit_advances_epoch_and_members_agree() {
        let (alice, bob, alice_state, bob_state) = two_member_group();
        let a = group_summary(&alice_state).unwrap();
        let b = group_summary(&bob_state).unwrap();
        assert_eq!(a.epoch, 1);
        assert_eq!(b.epoch, 1);
        assert_eq!(a.mls_group_id, b.mls_group_id);
        assert_eq!(b.metadata, a.metadata);
        assert!(b.members.contains(&alice.public()));
        assert!(b.members.contains(&bob.public()));
        assert_eq!(
            derive_epoch_secret(&alice_state).unwrap(),
            derive_epoch_secret(&bob_state).unwrap()
        );
    }

    #[test]
    fn application_message_roundtrip() {
        let (alice, _bob, alice_state, bob_state) = two_member_group();
        let enc = encrypt_application_message(&alice, &alice_state, b"hi bob").unwrap();
        let processed = process_incoming_message(&bob_state, &enc.ciphertext).unwrap();
        assert_eq!(
            processed.result,
            Incoming::Application {
                sender: alice.public(),
                plaintext: b"hi bob".to_vec()
            }
        );
    }

    #[test]
    fn non_admin_cannot_admit() {
        let (_alice, bob, _alice_state, bob_state) = two_member_group();
        let carol = Identity::generate();
        let kp = build_key_package(&carol, false).unwrap();
        assert!(matches!(
            admit_member(&bob, &bob_state, &kp.key_package),
            Err(MlsError::NotAdmin)
        ));
    }

    #[test]
    fn commit_from_admin_is_merged() {
        let (alice, _bob, alice_state, bob_state) = two_member_group();
        let carol = Identity::generate();
        let kp = build_key_package(&carol, false).unwrap();
        let admission = admit_member(&alice, &alice_state, &kp.key_package).unwrap();

        let processed = process_incoming_message(&bob_state, &admission.commit).unwrap();
        assert_eq!(
            processed.result,
            Incoming::Commit {
                epoch: 2,
                committer: alice.public()
            }
        );
        assert_eq!(processed.summary.members.len(), 3);
    }

    #[test]
    fn commit_from_non_admin_is_rejected() {
        let (_alice, bob, alice_state, bob_state) = two_member_group();
        let carol = Identity::generate();
        let kp = build_key_package(&carol, false).unwrap();
        let (kp, _) = validate_key_package(&kp.key_package).unwrap();

        // bob commits through the library directly, skipping the admin check
        let mut loaded = LoadedGroup::load(&bob_state).unwrap();
        let (commit, _, _) = loaded
            .group
            .add_members(&loaded.provider, &signer(&bob), &[kp])
            .unwrap();
        let commit = commit.tls_serialize_detached().unwrap();

        assert!(matches!(
            process_incoming_message(&alice_state, &commit),
            Err(MlsError::NonAdminCommit(_))
        ));
        assert_eq!(group_summary(&alice_state).unwrap().epoch, 1);
    }

    #[test]
    fn failed_processing_returns_no_state() {
        let (_alice, _bob, _alice_state, bob_state) = two_member_group();
        assert!(process_incoming_message(&bob_state, b"garbage").is_err());
        // caller's state is still usable
        assert_eq!(group_summary(&bob_state).unwrap().epoch, 1);
    }
}
