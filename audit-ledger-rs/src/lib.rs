// audit-ledger-rs/src/lib.rs
// Append-only audit ledger for remediation execution outcomes.
//
// - Append-only on disk, one length-prefixed bincode entry per record
// - Each entry participates in a SHA-256 hash chain for tamper detection
// - Opening a ledger rebuilds and verifies the chain head
// - Public API:
//     * AuditLedger::open
//     * AuditLedger::append
//     * AuditLedger::read_all / AuditLedger::verify

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Identifier of a single appended audit entry.
pub type LedgerEntryId = Uuid;

/// Why the record was written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditEvent {
    /// The request reached Completed, Failed or Skipped.
    Terminal,
    /// Final write while the request is being removed.
    Deleted,
}

/// What gets persisted for every terminal transition and deletion cleanup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub request_uid: String,
    pub request_name: String,
    pub namespace: Option<String>,
    pub target: String,
    /// `name@version` of the remediation workflow.
    pub workflow: String,
    pub phase: String,
    pub event: AuditEvent,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Success, Failure or Skipped; absent when the request never finished.
    pub outcome: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

/// A record as it was read back from disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub recorded_at: DateTime<Utc>,
    pub record: AuditRecord,
}

/// On-disk representation of a single entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerFileEntry {
    /// SHA-256(prev_hash || payload)
    hash_chain: [u8; 32],
    /// bincode-encoded LedgerEntry
    payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] bincode::Error),

    #[error("ledger file truncated at byte {0}")]
    Truncated(usize),

    #[error("ledger hash chain mismatch at entry {0}; possible tampering")]
    ChainMismatch(usize),

    #[error("ledger lock poisoned")]
    Poisoned,
}

/// Append-only audit ledger backed by a single file.
pub struct AuditLedger {
    path: PathBuf,
    /// Last hash in the chain (all zeros for an empty file).
    last_hash: Mutex<[u8; 32]>,
}

impl AuditLedger {
    /// Open (or create) the ledger at `path`, validating the existing chain.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let (last_hash, count) = scan(&path, |_| Ok(()))?;
        tracing::debug!(path = %path.display(), entries = count, "audit ledger opened");

        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Earlier entries are never rewritten.
    pub fn append(&self, record: AuditRecord) -> Result<LedgerEntryId, LedgerError> {
        let entry = LedgerEntry {
            id: LedgerEntryId::new_v4(),
            recorded_at: Utc::now(),
            record,
        };
        let payload = bincode::serialize(&entry)?;

        let mut last = self.last_hash.lock().map_err(|_| LedgerError::Poisoned)?;
        let hash_chain = chain_hash(&last, &payload);
        let encoded = bincode::serialize(&LedgerFileEntry {
            hash_chain,
            payload,
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // u32 length prefix + bytes
        file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.flush()?;

        *last = hash_chain;
        Ok(entry.id)
    }

    /// Read every entry in append order, verifying the chain on the way.
    pub fn read_all(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut entries = Vec::new();
        scan(&self.path, |payload| {
            entries.push(bincode::deserialize::<LedgerEntry>(payload)?);
            Ok(())
        })?;
        Ok(entries)
    }

    /// Re-verify the full file and return the number of entries.
    pub fn verify(&self) -> Result<usize, LedgerError> {
        scan(&self.path, |_| Ok(())).map(|(_, count)| count)
    }
}

fn chain_hash(prev: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev);
    hasher.update(payload);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Walk the file, checking chain continuity, and hand each payload to `visit`.
///
/// A missing file is an empty ledger.
fn scan<F>(path: &Path, mut visit: F) -> Result<([u8; 32], usize), LedgerError>
where
    F: FnMut(&[u8]) -> Result<(), LedgerError>,
{
    if !path.exists() {
        return Ok(([0u8; 32], 0));
    }

    let mut buf = Vec::new();
    OpenOptions::new().read(true).open(path)?.read_to_end(&mut buf)?;

    let mut cursor = 0usize;
    let mut last_hash = [0u8; 32];
    let mut count = 0usize;

    while cursor < buf.len() {
        let len_bytes: [u8; 4] = buf
            .get(cursor..cursor + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or(LedgerError::Truncated(cursor))?;
        cursor += 4;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let slice = buf
            .get(cursor..cursor + len)
            .ok_or(LedgerError::Truncated(cursor))?;
        cursor += len;

        let entry: LedgerFileEntry = bincode::deserialize(slice)?;
        if entry.hash_chain != chain_hash(&last_hash, &entry.payload) {
            return Err(LedgerError::ChainMismatch(count));
        }

        visit(&entry.payload)?;
        last_hash = entry.hash_chain;
        count += 1;
    }

    Ok((last_hash, count))
}
