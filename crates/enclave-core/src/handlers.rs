//! Command handlers.
//!
//! `Enclave` bundles the local identity with its store, settings, policy and
//! audit log. Each operation returns what it produced (events to publish,
//! records written) and leaves printing and publishing to the caller.
//!
//! Ordering contract for `invite`: publish `commit` before `welcome`, so
//! existing members can advance before the new one starts talking.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use tracing::{debug, info, warn};

use enclave_crypto::{Identity, PublicKey};
use enclave_proto::{builder, kind, Event, Filter, ProtoError, Tag};
use enclave_store::{GroupRecord, ImageRecord, KeyPackageRecord, MessageRecord, Store};

use crate::access::{AccessControl, AccessError};
use crate::audit::{self, AuditLog};
use crate::encryption::{chat_payload, seal_group_event};
use crate::mls::{self, GroupSummary, NewGroup};
use crate::paths;
use crate::settings::EnclaveSettings;

// ── Results ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PublishedKeyPackage {
    pub event: Event,
    pub reference: String,
}

#[derive(Debug, Clone)]
pub struct Invitation {
    /// Kind 445 carrying the add commit. Publish first.
    pub commit: Event,
    /// Kind 1059 gift wrap for the invitee.
    pub welcome: Event,
    pub invitee: PublicKey,
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub struct JoinedGroup {
    pub record: GroupRecord,
    /// Who sent the welcome, proven by the seal signature.
    pub inviter: PublicKey,
    /// Fresh key package to publish when the join used up the last one.
    pub replacement: Option<PublishedKeyPackage>,
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub event: Event,
    pub message: MessageRecord,
}

// ── Record helpers ────────────────────────────────────────────────────────────

/// Group record reflecting `summary`, keeping creation time and subscription
/// cursor from `previous`.
pub fn group_record(
    summary: &GroupSummary,
    state: &[u8],
    previous: Option<&GroupRecord>,
) -> GroupRecord {
    let now = Utc::now();
    let meta = &summary.metadata;
    let image = meta.image.is_set().then(|| ImageRecord {
        hash: hex::encode(meta.image.hash),
        key: hex::encode(meta.image.key),
        nonce: hex::encode(meta.image.nonce),
    });
    GroupRecord {
        mls_group_id: summary.mls_group_id_hex(),
        transport_id: meta.transport_id_hex(),
        name: meta.name.clone(),
        description: meta.description.clone(),
        admins: meta.admins.clone(),
        relays: meta.relays.clone(),
        image,
        epoch: summary.epoch,
        member_count: summary.members.len(),
        state: STANDARD.encode(state),
        created_at: previous.map(|p| p.created_at).unwrap_or(now),
        updated_at: now,
        last_event_at: previous.and_then(|p| p.last_event_at),
    }
}

pub fn transport_id_bytes(record: &GroupRecord) -> Result<[u8; 32]> {
    let mut id = [0u8; 32];
    hex::decode_to_slice(&record.transport_id, &mut id)
        .with_context(|| format!("bad transport id for group {}", record.mls_group_id))?;
    Ok(id)
}

// ── Enclave ───────────────────────────────────────────────────────────────────

pub struct Enclave {
    root: PathBuf,
    identity: Identity,
    store: Store,
    settings: EnclaveSettings,
    audit: Arc<AuditLog>,
    access: Arc<AccessControl>,
}

impl Enclave {
    /// Create identity, settings and access policy under `root` if missing.
    /// Returns whether a new identity was generated.
    pub fn init(root: &Path) -> Result<(Self, bool)> {
        let store = Store::open(root).context("cannot open store")?;
        let (identity, created) = Identity::load_or_generate(&paths::identity_path(root))
            .context("cannot load identity")?;
        let settings_path = paths::settings_path(root);
        if !settings_path.exists() {
            EnclaveSettings::default().save(&settings_path)?;
        }
        let settings = EnclaveSettings::load(&settings_path)?;
        let audit = Arc::new(AuditLog::new(
            paths::audit_dir(root),
            clone_identity(&identity)?,
            settings.audit.informational,
        )?);
        let access = AccessControl::initialize(store.clone(), audit.clone(), identity.public())?;
        if created {
            info!(identity = %identity.public().short(), "identity generated");
        }
        Ok((
            Self {
                root: root.to_path_buf(),
                identity,
                store,
                settings,
                audit,
                access: Arc::new(access),
            },
            created,
        ))
    }

    /// Open an initialized enclave. A missing identity or access policy is
    /// an error.
    pub fn open(root: &Path) -> Result<Self> {
        let identity_path = paths::identity_path(root);
        if !identity_path.exists() {
            bail!(
                "no identity at {}; run `enclave init` first",
                identity_path.display()
            );
        }
        let identity = Identity::load(&identity_path).context("cannot load identity")?;
        let store = Store::open(root).context("cannot open store")?;
        let settings = EnclaveSettings::load(&paths::settings_path(root))?;
        let audit = Arc::new(AuditLog::new(
            paths::audit_dir(root),
            clone_identity(&identity)?,
            settings.audit.informational,
        )?);
        let access = AccessControl::load(store.clone(), audit.clone())
            .context("access control policy is unusable")?;
        Ok(Self {
            root: root.to_path_buf(),
            identity,
            store,
            settings,
            audit,
            access: Arc::new(access),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn public(&self) -> PublicKey {
        self.identity.public()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn settings(&self) -> &EnclaveSettings {
        &self.settings
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn access(&self) -> &Arc<AccessControl> {
        &self.access
    }

    /// Relays to use when the caller gives none.
    pub fn relays_or_default(&self, relays: &[String]) -> Vec<String> {
        if relays.is_empty() {
            self.settings.relays.default_relays.clone()
        } else {
            relays.to_vec()
        }
    }

    // ── Key packages ──────────────────────────────────────────────────────

    pub fn publish_key_package(
        &self,
        relays: &[String],
        last_resort: bool,
    ) -> Result<PublishedKeyPackage> {
        let artifact = mls::build_key_package(&self.identity, last_resort)?;
        let event = builder::key_package(
            &self.identity,
            &STANDARD.encode(&artifact.key_package),
            relays,
        )?;
        self.store.save_key_package(&KeyPackageRecord {
            reference: artifact.reference.clone(),
            event_id: Some(event.id.clone()),
            key_package: STANDARD.encode(&artifact.key_package),
            private_state: STANDARD.encode(&artifact.private_state),
            last_resort,
            created_at: Utc::now(),
        })?;
        info!(reference = %artifact.reference, event_id = %event.id, "key package ready");
        Ok(PublishedKeyPackage {
            event,
            reference: artifact.reference,
        })
    }

    /// Filter for the newest key package published by `author`.
    pub fn key_package_filter(author: PublicKey) -> Filter {
        Filter::new().kind(kind::KEY_PACKAGE).author(author).limit(1)
    }

    /// Filter for gift wraps addressed to this identity.
    pub fn welcome_filter(&self) -> Filter {
        Filter::new()
            .kind(kind::GIFT_WRAP)
            .recipient(&self.identity.public())
    }

    // ── Groups ────────────────────────────────────────────────────────────

    pub fn create_group(&self, params: NewGroup) -> Result<GroupRecord> {
        let created = mls::create_group(&self.identity, params)?;
        let record = group_record(&created.summary, &created.state, None);
        self.store.save_group(&record, &created.state)?;
        self.allow_own_group(&record.mls_group_id)?;
        Ok(record)
    }

    /// Admit the publisher of `key_package_event` to `group_id`.
    ///
    /// The local state advances before anything is published. If the
    /// commit never reaches the relays the other members stay behind.
    pub fn invite(&self, group_id: &str, key_package_event: &Event) -> Result<Invitation> {
        key_package_event.expect_kind(kind::KEY_PACKAGE)?;
        key_package_event.verify()?;
        let key_package = STANDARD
            .decode(key_package_event.content.trim())
            .context("key package content is not base64")?;
        let (_, invitee) = mls::validate_key_package(&key_package)?;
        if invitee != key_package_event.pubkey {
            bail!("key package credential does not match its publisher");
        }

        let record = self.require_group(group_id)?;
        let state = self.store.load_group_state(group_id)?;
        // the commit travels under the epoch it was created in
        let pre_commit_secret = mls::derive_epoch_secret(&state)?;
        let admission = mls::admit_member(&self.identity, &state, &key_package)?;

        let commit = seal_group_event(
            &pre_commit_secret,
            &transport_id_bytes(&record)?,
            &admission.commit,
        )?;
        let welcome_bytes = admission
            .welcome
            .as_ref()
            .ok_or_else(|| anyhow!("commit produced no welcome"))?;
        let rumor = builder::welcome_rumor(
            self.identity.public(),
            &STANDARD.encode(welcome_bytes),
            &key_package_event.id,
            &record.relays,
        )?;
        let welcome = builder::wrap_for(
            &self.identity,
            &rumor,
            &invitee,
            self.settings.privacy.gift_wrap_jitter_secs,
        )?;

        let updated = group_record(&admission.summary, &admission.state, Some(&record));
        self.store.save_group(&updated, &admission.state)?;
        self.store.mark_processed(group_id, &commit.id)?;
        info!(
            group = %group_id,
            epoch = updated.epoch,
            invitee = %invitee.short(),
            "invitation prepared"
        );
        Ok(Invitation {
            commit,
            welcome,
            invitee,
            epoch: updated.epoch,
        })
    }

    /// Join the group a gift-wrapped welcome points at.
    pub fn accept_welcome(&self, wrap: &Event) -> Result<JoinedGroup> {
        let opened = builder::unwrap(&self.identity, wrap)?;
        let rumor = opened.rumor;
        if rumor.kind != kind::WELCOME {
            return Err(ProtoError::UnexpectedKind {
                expected: kind::WELCOME,
                actual: rumor.kind,
            }
            .into());
        }
        let kp_event_id = rumor
            .tag_value("e")
            .ok_or(ProtoError::MissingTag("e"))?
            .to_string();
        let kp = self
            .store
            .find_key_package_by_event(&kp_event_id)?
            .ok_or_else(|| anyhow!("no local key package for event {kp_event_id}"))?;

        let welcome = STANDARD
            .decode(rumor.content.trim())
            .context("welcome content is not base64")?;
        let private_state = STANDARD.decode(&kp.private_state)?;
        let joined = mls::join_from_welcome(&self.identity, &private_state, &welcome)?;

        let group_id = joined.summary.mls_group_id_hex();
        let previous = self.store.load_group(&group_id)?;
        let record = group_record(&joined.summary, &joined.state, previous.as_ref());
        self.store.save_group(&record, &joined.state)?;
        self.store.consume_key_package(&kp.reference)?;
        let replacement = if self.store.list_key_packages()?.is_empty() {
            let fresh = self.publish_key_package(&self.relays_or_default(&[]), false)?;
            debug!(reference = %fresh.reference, "replacing consumed key package");
            Some(fresh)
        } else {
            None
        };
        self.allow_own_group(&group_id)?;
        self.audit.record(
            audit::GROUP_JOINED,
            true,
            Some(&opened.sender),
            Some(&group_id),
            "joined from welcome",
        )?;
        info!(group = %group_id, epoch = record.epoch, "joined group");
        Ok(JoinedGroup {
            record,
            inviter: opened.sender,
            replacement,
        })
    }

    pub fn send_message(&self, group_id: &str, content: &str, tags: Vec<Tag>) -> Result<SentMessage> {
        let record = self.require_group(group_id)?;
        let state = self.store.load_group_state(group_id)?;
        let secret = mls::derive_epoch_secret(&state)?;

        let (rumor, payload) = chat_payload(self.identity.public(), content, tags)?;
        let encrypted = mls::encrypt_application_message(&self.identity, &state, &payload)?;
        let event = seal_group_event(&secret, &transport_id_bytes(&record)?, &encrypted.ciphertext)?;

        let mut updated = record;
        updated.state = STANDARD.encode(&encrypted.state);
        updated.updated_at = Utc::now();
        self.store.save_group(&updated, &encrypted.state)?;

        let message = MessageRecord {
            id: rumor.id,
            group_id: group_id.to_string(),
            event_id: Some(event.id.clone()),
            sender: rumor.pubkey,
            content: rumor.content,
            kind: rumor.kind,
            created_at: rumor.created_at,
            tags: rumor.tags,
            redacted: false,
        };
        self.store.append_message(&message)?;
        // our own echo from the relay must not be processed again
        self.store.mark_processed(group_id, &event.id)?;
        Ok(SentMessage { event, message })
    }

    pub fn groups(&self) -> Result<Vec<GroupRecord>> {
        Ok(self.store.list_groups()?)
    }

    pub fn messages(&self, group_id: &str) -> Result<Vec<MessageRecord>> {
        self.require_group(group_id)?;
        Ok(self.store.list_messages(group_id)?)
    }

    fn require_group(&self, group_id: &str) -> Result<GroupRecord> {
        self.store
            .load_group(group_id)?
            .ok_or_else(|| anyhow!("unknown group {group_id}"))
    }

    /// Groups this identity creates or joins are served by default, when it
    /// owns the policy.
    fn allow_own_group(&self, group_id: &str) -> Result<()> {
        match self.access.allow_group(&self.identity.public(), group_id) {
            Ok(_) => Ok(()),
            Err(AccessError::NotOwner) => {
                warn!(group = %group_id, "not policy owner; group left disallowed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn clone_identity(identity: &Identity) -> Result<Identity> {
    Ok(Identity::from_secret_bytes(identity.secret_bytes())?)
}
