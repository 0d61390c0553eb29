//! OpenMLS provider with a serializable storage backend.
//!
//! OpenMLS keeps all group and key-package state in its `StorageProvider`.
//! We run it on `MemoryStorage` and persist the storage contents as an opaque
//! snapshot, so one snapshot is exactly one group's state (or one key
//! package's private half). Nothing lives in the provider between calls:
//! every operation rebuilds it from a snapshot and snapshots it again on
//! success.
//!
//! Snapshot format (JSON):
//! ```text
//! { "version": 1, "group_id": "<hex>" | null, "entries": [["<b64 key>", "<b64 value>"], ...] }
//! ```

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use openmls_memory_storage::MemoryStorage;
use openmls_rust_crypto::RustCrypto;
use openmls_traits::OpenMlsProvider;
use serde::{Deserialize, Serialize};

use super::error::MlsError;

pub const STATE_VERSION: u8 = 1;

#[derive(Default)]
pub struct EnclaveProvider {
    crypto: RustCrypto,
    storage: MemoryStorage,
}

impl OpenMlsProvider for EnclaveProvider {
    type CryptoProvider = RustCrypto;
    type RandProvider = RustCrypto;
    type StorageProvider = MemoryStorage;

    fn crypto(&self) -> &Self::CryptoProvider {
        &self.crypto
    }

    fn rand(&self) -> &Self::RandProvider {
        &self.crypto
    }

    fn storage(&self) -> &Self::StorageProvider {
        &self.storage
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u8,
    group_id: Option<String>,
    entries: Vec<(String, String)>,
}

impl EnclaveProvider {
    /// Serialize the storage contents. Entries are sorted so identical
    /// storage always produces identical bytes.
    pub fn snapshot(&self, group_id: Option<&[u8]>) -> Result<Vec<u8>, MlsError> {
        let values = self
            .storage
            .values
            .read()
            .map_err(|_| MlsError::Storage("storage lock poisoned".into()))?;
        let mut entries: Vec<(String, String)> = values
            .iter()
            .map(|(k, v)| (STANDARD.encode(k), STANDARD.encode(v)))
            .collect();
        entries.sort();
        let snapshot = Snapshot {
            version: STATE_VERSION,
            group_id: group_id.map(hex::encode),
            entries,
        };
        serde_json::to_vec(&snapshot).map_err(|e| MlsError::Serialization(e.to_string()))
    }

    /// Rebuild a provider from a snapshot. Returns the group id recorded in
    /// the snapshot, if any.
    pub fn restore(bytes: &[u8]) -> Result<(Self, Option<Vec<u8>>), MlsError> {
        let snapshot: Snapshot =
            serde_json::from_slice(bytes).map_err(|e| MlsError::Serialization(e.to_string()))?;
        if snapshot.version != STATE_VERSION {
            return Err(MlsError::StateVersion(snapshot.version));
        }
        let mut values = HashMap::with_capacity(snapshot.entries.len());
        for (k, v) in snapshot.entries {
            let k = STANDARD
                .decode(k)
                .map_err(|e| MlsError::Serialization(e.to_string()))?;
            let v = STANDARD
                .decode(v)
                .map_err(|e| MlsError::Serialization(e.to_string()))?;
            values.insert(k, v);
        }
        let group_id = snapshot
            .group_id
            .map(hex::decode)
            .transpose()
            .map_err(|e| MlsError::Serialization(e.to_string()))?;

        let provider = Self::default();
        {
            let mut guard = provider
                .storage
                .values
                .write()
                .map_err(|_| MlsError::Storage("storage lock poisoned".into()))?;
            *guard = values;
        }
        Ok((provider, group_id))
    }
}
