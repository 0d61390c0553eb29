//! Tamper-evident audit trail.
//!
//! One JSONL file per UTC day under `audit/`, named `YYYY-MM-DD.jsonl`.
//! Entries are hash chained (each carries the previous entry's hash, the
//! first ever carries `CHAIN_START`) and the chain continues across day
//! files. Each hash is signed with the local identity.
//!
//! Entries record *that* something happened, never message content: the
//! entry type has no field that could hold it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use enclave_crypto::{Identity, PublicKey};

pub const CHAIN_START: &str = "CHAIN_START";
pub const MAX_DETAIL_CHARS: usize = 120;

// Entry types
pub const POLICY_INIT: &str = "POLICY_INIT";
pub const POLICY_CHANGE: &str = "POLICY_CHANGE";
pub const MESSAGE_REDACTED: &str = "MESSAGE_REDACTED";
pub const GROUP_SKIPPED: &str = "GROUP_SKIPPED";
pub const GROUP_JOINED: &str = "GROUP_JOINED";

/// Entry types written regardless of settings.
pub const POLICY_TYPES: [&str; 4] = [POLICY_INIT, POLICY_CHANGE, MESSAGE_REDACTED, GROUP_SKIPPED];

pub fn is_policy_relevant(event_type: &str) -> bool {
    POLICY_TYPES.contains(&event_type)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub allowed: bool,
    /// First 16 hex chars of the identity involved.
    pub sender: Option<String>,
    pub group: Option<String>,
    pub detail: String,
    pub prev_hash: String,
    pub hash: String,
    pub signature: String,
}

impl AuditEntry {
    fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "seq": self.seq,
            "timestamp": self.timestamp,
            "event_type": self.event_type,
            "allowed": self.allowed,
            "sender": self.sender,
            "group": self.group,
            "detail": self.detail,
            "prev_hash": self.prev_hash,
        })
    }

    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.body().to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    pub day: NaiveDate,
    pub seq: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainReport {
    pub days: usize,
    pub entries: usize,
    pub first_break: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

#[derive(Debug)]
struct LogState {
    last_seq: u64,
    last_hash: String,
}

pub struct AuditLog {
    dir: PathBuf,
    signer: Identity,
    informational: bool,
    inner: Mutex<LogState>,
}

impl AuditLog {
    /// `informational` controls entries outside `POLICY_TYPES`; policy
    /// entries are always written.
    pub fn new<P: AsRef<Path>>(dir: P, signer: Identity, informational: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create audit directory {}", dir.display()))?;
        restrict_dir_permissions(&dir);
        let (last_seq, last_hash) = Self::load_state(&dir)?;
        Ok(Self {
            dir,
            signer,
            informational,
            inner: Mutex::new(LogState {
                last_seq,
                last_hash,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn day_path(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.jsonl", day.format("%Y-%m-%d")))
    }

    fn load_state(dir: &Path) -> Result<(u64, String)> {
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        if let Some(day) = list_days(dir)?.last() {
            if let Some(entry) = read_file(&dir.join(format!("{}.jsonl", day.format("%Y-%m-%d"))))?
                .pop()
            {
                last_seq = entry.seq;
                last_hash = entry.hash;
            }
        }
        Ok((last_seq, last_hash))
    }

    /// Append an entry. Returns `None` for an informational entry while
    /// informational auditing is off.
    pub fn record(
        &self,
        event_type: &str,
        allowed: bool,
        sender: Option<&PublicKey>,
        group: Option<&str>,
        detail: &str,
    ) -> Result<Option<AuditEntry>> {
        if !self.informational && !is_policy_relevant(event_type) {
            return Ok(None);
        }
        let mut state = self.inner.lock();
        let mut entry = AuditEntry {
            seq: state.last_seq + 1,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            allowed,
            sender: sender.map(PublicKey::short),
            group: group.map(str::to_string),
            detail: detail.chars().take(MAX_DETAIL_CHARS).collect(),
            prev_hash: state.last_hash.clone(),
            hash: String::new(),
            signature: String::new(),
        };
        entry.hash = entry.compute_hash();
        let hash_bytes = hex::decode(&entry.hash)?;
        entry.signature = general_purpose::STANDARD.encode(self.signer.sign(&hash_bytes));

        self.write_entry(&entry)?;
        state.last_seq = entry.seq;
        state.last_hash = entry.hash.clone();
        Ok(Some(entry))
    }

    fn write_entry(&self, entry: &AuditEntry) -> Result<()> {
        let path = self.day_path(entry.timestamp.date_naive());
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&path)
            .with_context(|| format!("cannot open audit file {}", path.display()))?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn days(&self) -> Result<Vec<NaiveDate>> {
        list_days(&self.dir)
    }

    pub fn read_day(&self, day: NaiveDate) -> Result<Vec<AuditEntry>> {
        read_file(&self.day_path(day))
    }

    /// Most recent entries first, across days.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut out = Vec::new();
        for day in self.days()?.into_iter().rev() {
            let mut entries = self.read_day(day)?;
            entries.reverse();
            for entry in entries {
                if out.len() == limit {
                    return Ok(out);
                }
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Walk every day file in order and check sequence numbers, hash links,
    /// hashes and signatures. Stops at the first inconsistency.
    pub fn verify_chain(&self, signer: &PublicKey) -> Result<ChainReport> {
        let mut report = ChainReport::default();
        let mut expected_prev = CHAIN_START.to_string();
        let mut expected_seq = 1;

        for day in self.days()? {
            report.days += 1;
            for entry in self.read_day(day)? {
                let fail = |reason: &str| ChainBreak {
                    day,
                    seq: entry.seq,
                    reason: reason.to_string(),
                };
                if entry.seq != expected_seq {
                    report.first_break = Some(fail("sequence gap"));
                    return Ok(report);
                }
                if entry.prev_hash != expected_prev {
                    report.first_break = Some(fail("broken hash link"));
                    return Ok(report);
                }
                if entry.compute_hash() != entry.hash {
                    report.first_break = Some(fail("hash mismatch"));
                    return Ok(report);
                }
                let signature_ok = hex::decode(&entry.hash)
                    .ok()
                    .zip(general_purpose::STANDARD.decode(&entry.signature).ok())
                    .map(|(hash, sig)| signer.verify(&hash, &sig).is_ok())
                    .unwrap_or(false);
                if !signature_ok {
                    report.first_break = Some(fail("bad signature"));
                    return Ok(report);
                }
                report.entries += 1;
                expected_seq += 1;
                expected_prev = entry.hash;
            }
        }
        Ok(report)
    }
}

fn list_days(dir: &Path) -> Result<Vec<NaiveDate>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut days = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".jsonl") {
            if let Ok(day) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                days.push(day);
            }
        }
    }
    days.sort();
    Ok(days)
}

fn read_file(path: &Path) -> Result<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line)
            .with_context(|| format!("corrupt audit line in {}", path.display()))?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(unix)]
fn restrict_dir_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_path: &Path) {}
