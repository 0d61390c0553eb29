//! Owner-administered access policy.
//!
//! Decides whose messages are delivered in full and which groups the daemon
//! serves. Only the owner identity may change the policy; every attempt,
//! allowed or denied, lands in the audit log. The policy file is written
//! atomically and swapped in memory only after the write succeeded.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use enclave_crypto::PublicKey;
use enclave_store::{AccessControlConfig, DefaultPolicy, Store, StoreError};

use crate::audit::{self, AuditLog};

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("only the policy owner may change access control")]
    NotOwner,

    #[error("access control policy not found at {0}; run `enclave init` first")]
    MissingPolicy(String),

    #[error("access control policy has no owner")]
    NoOwner,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    NotFound,
}

/// Outcome of gating one sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied {
        policy: DefaultPolicy,
        log_rejected: bool,
    },
}

pub struct AccessControl {
    store: Store,
    audit: Arc<AuditLog>,
    config: RwLock<AccessControlConfig>,
}

impl AccessControl {
    /// Load the persisted policy. A missing file, unreadable file or
    /// owner-less policy is an error; callers treat it as fatal.
    pub fn load(store: Store, audit: Arc<AuditLog>) -> Result<Self, AccessError> {
        let config = store
            .load_access_control()?
            .ok_or_else(|| AccessError::MissingPolicy(store.access_control_path().display().to_string()))?;
        if config.owner.is_none() {
            return Err(AccessError::NoOwner);
        }
        Ok(Self {
            store,
            audit,
            config: RwLock::new(config),
        })
    }

    /// Load the policy, creating one owned by `owner` if none exists yet.
    pub fn initialize(
        store: Store,
        audit: Arc<AuditLog>,
        owner: PublicKey,
    ) -> Result<Self, AccessError> {
        if store.load_access_control()?.is_none() {
            store.save_access_control(&AccessControlConfig::for_owner(owner))?;
            audit.record(audit::POLICY_INIT, true, Some(&owner), None, "policy created")?;
            info!(owner = %owner.short(), "access control initialized");
        }
        Self::load(store, audit)
    }

    pub fn snapshot(&self) -> AccessControlConfig {
        self.config.read().clone()
    }

    pub fn owner(&self) -> Option<PublicKey> {
        self.config.read().owner
    }

    /// The owner is always allowed.
    pub fn is_sender_allowed(&self, sender: &PublicKey) -> bool {
        let config = self.config.read();
        config.owner.as_ref() == Some(sender) || config.allowed_contacts.contains(sender)
    }

    pub fn is_group_allowed(&self, mls_group_id: &str) -> bool {
        self.config.read().allowed_groups.contains(mls_group_id)
    }

    pub fn decide(&self, sender: &PublicKey) -> Decision {
        if self.is_sender_allowed(sender) {
            return Decision::Allowed;
        }
        let config = self.config.read();
        Decision::Denied {
            policy: config.default_policy,
            log_rejected: config.log_rejected,
        }
    }

    // ── Owner-only mutations ───────────────────────────────────────────────

    fn mutate<T>(
        &self,
        actor: &PublicKey,
        action: &str,
        apply: impl FnOnce(&mut AccessControlConfig) -> T,
    ) -> Result<T, AccessError> {
        let mut guard = self.config.write();
        if guard.owner.as_ref() != Some(actor) {
            drop(guard);
            warn!(actor = %actor.short(), action, "policy change denied");
            self.audit.record(
                audit::POLICY_CHANGE,
                false,
                Some(actor),
                None,
                &format!("{action}: not owner"),
            )?;
            return Err(AccessError::NotOwner);
        }
        let mut next = guard.clone();
        let out = apply(&mut next);
        self.store.save_access_control(&next)?;
        *guard = next;
        drop(guard);

        info!(action, "policy updated");
        self.audit
            .record(audit::POLICY_CHANGE, true, Some(actor), None, action)?;
        Ok(out)
    }

    /// Returns `false` if the contact was already allowed.
    pub fn add_contact(&self, actor: &PublicKey, contact: &PublicKey) -> Result<bool, AccessError> {
        let action = format!("allow contact {}", contact.short());
        self.mutate(actor, &action, |c| c.allowed_contacts.insert(*contact))
    }

    pub fn remove_contact(
        &self,
        actor: &PublicKey,
        contact: &PublicKey,
    ) -> Result<Removal, AccessError> {
        let action = format!("remove contact {}", contact.short());
        self.mutate(actor, &action, |c| {
            if c.allowed_contacts.remove(contact) {
                Removal::Removed
            } else {
                Removal::NotFound
            }
        })
    }

    pub fn allow_group(&self, actor: &PublicKey, mls_group_id: &str) -> Result<bool, AccessError> {
        let action = format!("allow group {mls_group_id}");
        self.mutate(actor, &action, |c| c.allowed_groups.insert(mls_group_id.to_string()))
    }

    pub fn revoke_group(
        &self,
        actor: &PublicKey,
        mls_group_id: &str,
    ) -> Result<Removal, AccessError> {
        let action = format!("revoke group {mls_group_id}");
        self.mutate(actor, &action, |c| {
            if c.allowed_groups.remove(mls_group_id) {
                Removal::Removed
            } else {
                Removal::NotFound
            }
        })
    }

    pub fn set_default_policy(
        &self,
        actor: &PublicKey,
        policy: DefaultPolicy,
    ) -> Result<(), AccessError> {
        let action = format!("default policy {policy:?}");
        self.mutate(actor, &action, |c| c.default_policy = policy)
    }

    pub fn set_log_rejected(&self, actor: &PublicKey, enabled: bool) -> Result<(), AccessError> {
        let action = format!("log rejected {enabled}");
        self.mutate(actor, &action, |c| c.log_rejected = enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_crypto::Identity;
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> (AccessControl, Identity, Arc<AuditLog>) {
        let owner = Identity::generate();
        let store = Store::open(dir.join("store")).unwrap();
        let audit = Arc::new(
            AuditLog::new(dir.join("audit"), Identity::from_secret_bytes(owner.secret_bytes()).unwrap(), true)
                .unwrap(),
        );
        let acl = AccessControl::initialize(store, audit.clone(), owner.public()).unwrap();
        (acl, owner, audit)
    }

    #[test]
    fn owner_always_allowed() {
        let dir = tempdir().unwrap();
        let (acl, owner, _) = setup(dir.path());
        assert!(acl.is_sender_allowed(&owner.public()));
        assert!(!acl.is_sender_allowed(&Identity::generate().public()));
    }

    #[test]
    fn add_remove_contact() {
        let dir = tempdir().unwrap();
        let (acl, owner, _) = setup(dir.path());
        let bob = Identity::generate().public();
        assert!(acl.add_contact(&owner.public(), &bob).unwrap());
        assert!(!acl.add_contact(&owner.public(), &bob).unwrap());
        assert!(acl.is_sender_allowed(&bob));
        assert_eq!(acl.remove_contact(&owner.public(), &bob).unwrap(), Removal::Removed);
        assert_eq!(acl.remove_contact(&owner.public(), &bob).unwrap(), Removal::NotFound);
        assert!(!acl.is_sender_allowed(&bob));
    }

    #[test]
    fn non_owner_denied_and_audited() {
        let dir = tempdir().unwrap();
        let (acl, _owner, audit) = setup(dir.path());
        let mallory = Identity::generate().public();
        assert!(matches!(
            acl.add_contact(&mallory, &mallory),
            Err(AccessError::NotOwner)
        ));
        assert!(!acl.is_sender_allowed(&mallory));
        let last = audit.read_recent(1).unwrap().remove(0);
        assert!(!last.allowed);
        assert_eq!(last.event_type, audit::POLICY_CHANGE);
        assert_eq!(last.sender, Some(mallory.short()));
    }

    #[test]
    fn changes_persist_across_reload() {
        let dir = tempdir().unwrap();
        let (acl, owner, audit) = setup(dir.path());
        acl.allow_group(&owner.public(), "abcd").unwrap();
        acl.set_default_policy(&owner.public(), DefaultPolicy::LogOnly).unwrap();
        acl.set_log_rejected(&owner.public(), true).unwrap();

        let store = Store::open(dir.path().join("store")).unwrap();
        let reloaded = AccessControl::load(store, audit).unwrap();
        assert!(reloaded.is_group_allowed("abcd"));
        let snap = reloaded.snapshot();
        assert_eq!(snap.default_policy, DefaultPolicy::LogOnly);
        assert!(snap.log_rejected);
    }

    #[test]
    fn decide_reports_policy() {
        let dir = tempdir().unwrap();
        let (acl, owner, _) = setup(dir.path());
        acl.set_log_rejected(&owner.public(), true).unwrap();
        let stranger = Identity::generate().public();
        assert_eq!(
            acl.decide(&stranger),
            Decision::Denied {
                policy: DefaultPolicy::Ignore,
                log_rejected: true
            }
        );
        assert_eq!(acl.decide(&owner.public()), Decision::Allowed);
    }

    #[test]
    fn missing_policy_is_error() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let audit = Arc::new(AuditLog::new(dir.path().join("audit"), Identity::generate(), true).unwrap());
        assert!(matches!(
            AccessControl::load(store, audit),
            Err(AccessError::MissingPolicy(_))
        ));
    }

    #[test]
    fn ownerless_policy_is_error() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.save_access_control(&AccessControlConfig::default()).unwrap();
        let audit = Arc::new(AuditLog::new(dir.path().join("audit"), Identity::generate(), true).unwrap());
        assert!(matches!(
            AccessControl::load(store, audit),
            Err(AccessError::NoOwner)
        ));
    }
}
