//! File-based store rooted at an injected directory.
//!
//! Layout:
//! ```text
//! <root>/
//!   groups/<mls-id>.json        GroupRecord
//!   groups/<mls-id>.state       serialized group state (authoritative)
//!   key_packages/<ref>.json     KeyPackageRecord
//!   messages/<mls-id>.jsonl     MessageRecord per line, append order
//!   processed/<mls-id>.list     handled transport event ids, one per line
//!   access_control.json         AccessControlConfig
//!   .staging/                   in-flight atomic writes
//! ```
//!
//! Every write except message appends goes through `write_atomic`: staging
//! file, fsync, rename, fsync of the parent directory. A crash leaves either
//! the old or the new file, never a torn one. Message logs are append-only;
//! a torn trailing line left by a crash is cut off the next time the log is
//! indexed. Files are 0600, directories 0700.
//!
//! Files are keyed by group, so concurrent writers for different groups
//! never touch the same path. Two writers for the same group are not
//! coordinated here.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::StoreError;
use crate::models::{AccessControlConfig, GroupRecord, KeyPackageRecord, MessageRecord};

const GROUPS_DIR: &str = "groups";
const KEY_PACKAGES_DIR: &str = "key_packages";
const MESSAGES_DIR: &str = "messages";
const PROCESSED_DIR: &str = "processed";
const STAGING_DIR: &str = ".staging";
const ACCESS_CONTROL_FILE: &str = "access_control.json";

/// Processed-id lists keep only the newest entries.
pub const MAX_PROCESSED_IDS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    /// Stored message ids per group, loaded on first append.
    message_ids: Arc<Mutex<HashMap<String, HashSet<String>>>>,
}

impl Store {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [
            root.clone(),
            root.join(GROUPS_DIR),
            root.join(KEY_PACKAGES_DIR),
            root.join(MESSAGES_DIR),
            root.join(PROCESSED_DIR),
            root.join(STAGING_DIR),
        ] {
            fs::create_dir_all(&dir)?;
            restrict_dir_permissions(&dir);
        }
        let store = Self {
            root,
            message_ids: Arc::default(),
        };
        store.cleanup_staging();
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── Groups ────────────────────────────────────────────────────────────

    fn group_record_path(&self, group_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(GROUPS_DIR).join(format!("{}.json", checked_id(group_id)?)))
    }

    fn group_state_path(&self, group_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(GROUPS_DIR).join(format!("{}.state", checked_id(group_id)?)))
    }

    /// Persist a group record together with its serialized state.
    ///
    /// Refuses to move the stored epoch backwards. The state blob is written
    /// before the record, so the record never points at an epoch whose
    /// state is missing.
    pub fn save_group(&self, record: &GroupRecord, state: &[u8]) -> Result<(), StoreError> {
        self.check_epoch(record)?;
        let mut record = record.clone();
        record.state = STANDARD.encode(state);
        record.updated_at = Utc::now();
        self.write_atomic(&self.group_state_path(&record.mls_group_id)?, state)?;
        self.write_json(&self.group_record_path(&record.mls_group_id)?, &record)?;
        debug!(group = %record.mls_group_id, epoch = record.epoch, "group state saved");
        Ok(())
    }

    fn check_epoch(&self, record: &GroupRecord) -> Result<(), StoreError> {
        if let Some(existing) = self.load_group(&record.mls_group_id)? {
            if record.epoch < existing.epoch {
                return Err(StoreError::EpochRegression {
                    group: record.mls_group_id.clone(),
                    stored: existing.epoch,
                    attempted: record.epoch,
                });
            }
        }
        Ok(())
    }

    pub fn load_group(&self, group_id: &str) -> Result<Option<GroupRecord>, StoreError> {
        self.read_json(&self.group_record_path(group_id)?)
    }

    pub fn load_group_state(&self, group_id: &str) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let path = self.group_state_path(group_id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Zeroizing::new(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("group state {group_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_groups(&self) -> Result<Vec<GroupRecord>, StoreError> {
        let mut groups: Vec<GroupRecord> = self.list_json(&self.root.join(GROUPS_DIR))?;
        groups.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(groups)
    }

    // ── Key packages ──────────────────────────────────────────────────────

    fn key_package_path(&self, reference: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join(KEY_PACKAGES_DIR)
            .join(format!("{}.json", checked_id(reference)?)))
    }

    pub fn save_key_package(&self, record: &KeyPackageRecord) -> Result<(), StoreError> {
        self.write_json(&self.key_package_path(&record.reference)?, record)
    }

    pub fn load_key_package(&self, reference: &str) -> Result<Option<KeyPackageRecord>, StoreError> {
        self.read_json(&self.key_package_path(reference)?)
    }

    pub fn list_key_packages(&self) -> Result<Vec<KeyPackageRecord>, StoreError> {
        let mut kps: Vec<KeyPackageRecord> = self.list_json(&self.root.join(KEY_PACKAGES_DIR))?;
        kps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(kps)
    }

    pub fn find_key_package_by_event(
        &self,
        event_id: &str,
    ) -> Result<Option<KeyPackageRecord>, StoreError> {
        Ok(self
            .list_key_packages()?
            .into_iter()
            .find(|kp| kp.event_id.as_deref() == Some(event_id)))
    }

    /// Mark a key package as used. Deleted unless it is last-resort.
    pub fn consume_key_package(&self, reference: &str) -> Result<(), StoreError> {
        let path = self.key_package_path(reference)?;
        let record: KeyPackageRecord = self
            .read_json(&path)?
            .ok_or_else(|| StoreError::NotFound(format!("key package {reference}")))?;
        if record.last_resort {
            debug!(reference, "last-resort key package retained after use");
            return Ok(());
        }
        fs::remove_file(&path)?;
        fsync_dir(&self.root.join(KEY_PACKAGES_DIR))?;
        Ok(())
    }

    // ── Messages ──────────────────────────────────────────────────────────

    fn messages_path(&self, group_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join(MESSAGES_DIR)
            .join(format!("{}.jsonl", checked_id(group_id)?)))
    }

    /// Append a message as one line of the group's log. Returns `false` if
    /// a message with the same id is already stored.
    pub fn append_message(&self, message: &MessageRecord) -> Result<bool, StoreError> {
        let path = self.messages_path(&message.group_id)?;
        let mut index = self.message_ids.lock();
        let ids = match index.entry(message.group_id.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(load_message_ids(&path)?),
        };
        if ids.contains(&message.id) {
            return Ok(false);
        }

        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let created = !path.exists();
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        if created {
            fsync_dir(&self.root.join(MESSAGES_DIR))?;
        }
        ids.insert(message.id.clone());
        Ok(true)
    }

    /// Messages for a group, oldest first. Ties keep append order. A torn
    /// final line is skipped.
    pub fn list_messages(&self, group_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let lines = self.read_lines(&self.messages_path(group_id)?)?;
        let last = lines.len().saturating_sub(1);
        let mut messages = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<MessageRecord>(line) {
                Ok(m) => messages.push(m),
                Err(e) if i == last => {
                    warn!(group = %group_id, error = %e, "skipping torn message line");
                }
                Err(e) => return Err(e.into()),
            }
        }
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    // ── Processed events ──────────────────────────────────────────────────

    fn processed_path(&self, group_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join(PROCESSED_DIR)
            .join(format!("{}.list", checked_id(group_id)?)))
    }

    pub fn is_processed(&self, group_id: &str, event_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .read_lines(&self.processed_path(group_id)?)?
            .iter()
            .any(|l| l == event_id))
    }

    pub fn mark_processed(&self, group_id: &str, event_id: &str) -> Result<(), StoreError> {
        let path = self.processed_path(group_id)?;
        let mut ids = self.read_lines(&path)?;
        if ids.iter().any(|l| l == event_id) {
            return Ok(());
        }
        ids.push(event_id.to_string());
        if ids.len() > MAX_PROCESSED_IDS {
            let excess = ids.len() - MAX_PROCESSED_IDS;
            ids.drain(..excess);
        }
        let mut out = ids.join("\n");
        out.push('\n');
        self.write_atomic(&path, out.as_bytes())
    }

    // ── Access control ────────────────────────────────────────────────────

    pub fn access_control_path(&self) -> PathBuf {
        self.root.join(ACCESS_CONTROL_FILE)
    }

    pub fn load_access_control(&self) -> Result<Option<AccessControlConfig>, StoreError> {
        self.read_json(&self.access_control_path())
    }

    pub fn save_access_control(&self, config: &AccessControlConfig) -> Result<(), StoreError> {
        self.write_json(&self.access_control_path(), config)
    }

    // ── Primitives ────────────────────────────────────────────────────────

    fn write_json<T: serde::Serialize>(&self, dest: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_atomic(dest, &bytes)
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_json<T: serde::de::DeserializeOwned>(&self, dir: &Path) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(v) = self.read_json(&path)? {
                out.push(v);
            }
        }
        Ok(out)
    }

    fn read_lines(&self, path: &Path) -> Result<Vec<String>, StoreError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }

    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let staging_root = self.root.join(STAGING_DIR);
        let staging_path = staging_root.join(format!("{}.staging", Uuid::new_v4()));
        {
            let mut opts = OpenOptions::new();
            opts.write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            let mut file = opts.open(&staging_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&staging_path, dest)?;
        if let Some(parent) = dest.parent() {
            fsync_dir(parent)?;
        }
        Ok(())
    }

    /// Remove leftover staging files from a previous crash.
    fn cleanup_staging(&self) {
        if let Ok(entries) = fs::read_dir(self.root.join(STAGING_DIR)) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().ends_with(".staging") {
                    warn!(path = %entry.path().display(), "removing orphaned staging file");
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }
}

/// Ids of every complete line in a message log. Bytes after the last newline
/// are an interrupted append and are truncated away.
fn load_message_ids(path: &Path) -> Result<HashSet<String>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e.into()),
    };
    let complete = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    if complete < bytes.len() {
        warn!(path = %path.display(), "truncating torn message line");
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(complete as u64)?;
        file.sync_data()?;
    }
    let mut ids = HashSet::new();
    for line in bytes[..complete].split(|&b| b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let stored: MessageRecord = serde_json::from_slice(line)?;
        ids.insert(stored.id);
    }
    Ok(ids)
}

/// Ids become file names, so only hex is accepted.
fn checked_id(id: &str) -> Result<&str, StoreError> {
    if id.is_empty() || id.len() > 128 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(id)
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
}

fn fsync_dir(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
