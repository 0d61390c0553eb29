//! enclave_store: File-based storage for Darklock Enclave protocol state
//!
//! No database: every entity is a small JSON (or JSONL) file under a root
//! directory the caller chooses. The store holds no global state; two
//! `Store` values on different roots are fully independent.
//!
//! Secrets at rest (group state, private key-package halves) rely on file
//! permissions and the OS disk encryption, not on an application vault.

pub mod error;
pub mod models;
pub mod store;

pub use error::StoreError;
pub use models::{
    AccessControlConfig, DefaultPolicy, GroupRecord, ImageRecord, KeyPackageRecord,
    MessageRecord,
};
pub use store::Store;
