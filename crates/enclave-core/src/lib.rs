//! enclave-core: group engine and local services for Darklock Enclave
//!
//! # Layers
//! - `mls`: OpenMLS-backed group state machine. Pure state in, state out.
//! - `encryption`: outer XChaCha20-Poly1305 layer keyed by the epoch
//!   export secret, plus the kind-9 chat payload.
//! - `access` / `audit`: owner-administered sender policy and the signed,
//!   hash-chained audit trail.
//! - `handlers`: the `Enclave` facade used by the CLI and the daemon.
//!
//! Nothing here talks to the network. Events come in and go out as values.

pub mod access;
pub mod audit;
pub mod encryption;
pub mod handlers;
pub mod mls;
pub mod paths;
pub mod settings;

pub use access::{AccessControl, AccessError, Decision, Removal};
pub use audit::{AuditEntry, AuditLog, ChainReport};
pub use handlers::Enclave;
pub use mls::MlsError;
pub use settings::EnclaveSettings;
