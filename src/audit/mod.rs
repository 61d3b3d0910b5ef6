//! Hash-chained append-only log, used both for the audit trail
//! (`audit.log`) and the autopilot decision trace
//! (`autopilot_decisions.jsonl`) — same mechanism, two instances (spec §4.8,
//! §4.10).
//!
//! On-disk layout is the literal wire format from spec §6: each record is
//! `uvarint len ‖ payload_json ‖ 32-byte entry_hash`, where `len` is the byte
//! length of `payload_json` and `payload_json` serializes the object
//! `{seq, ts, kind, prev_hash, data}`. `entry_hash = SHA-256(payload_json)`,
//! so each entry transitively commits to every prior one through the chained
//! `prev_hash` field. No crate in the dependency table speaks unsigned
//! LEB128, so the varint codec below is hand-rolled; everything else
//! (buffered writer behind a mutex, fsync-before-advance) still follows
//! `battysh-batty/src/log/mod.rs::ExecutionLog`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::AuditError;

const GENESIS_PREV_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// The wire-format payload object, keyed exactly as spec §6 names it.
#[derive(Debug, Serialize, Deserialize)]
struct WireRecord {
    seq: u64,
    ts: DateTime<Utc>,
    kind: String,
    prev_hash: String,
    data: Value,
}

/// One committed entry in the chain, as handed back to callers. Field names
/// here are this crate's own vocabulary and are independent of the on-disk
/// `WireRecord` key names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_kind: String,
    pub payload: Value,
    pub prev_hash: String,
    pub entry_hash: String,
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").unwrap();
    }
    s
}

fn encode_uvarint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Reads one uvarint, or `Ok(None)` if `reader` is at a clean end-of-file
/// (no bytes at all before the length prefix).
fn decode_uvarint<R: Read>(reader: &mut R) -> std::io::Result<Option<u64>> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte)?;
        if n == 0 {
            if first {
                return Ok(None);
            }
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated uvarint"));
        }
        first = false;
        result |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(result));
        }
        shift += 7;
    }
}

fn hash_record(payload_json: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload_json);
    hasher.finalize().into()
}

fn record_to_entry(record: WireRecord, entry_hash: [u8; 32]) -> Entry {
    Entry {
        seq: record.seq,
        timestamp: record.ts,
        event_kind: record.kind,
        payload: record.data,
        prev_hash: record.prev_hash,
        entry_hash: hex_encode(&entry_hash),
    }
}

/// Reads one `uvarint len ‖ payload_json ‖ 32-byte entry_hash` record,
/// returning `Ok(None)` at a clean end-of-file.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<(WireRecord, Vec<u8>, [u8; 32])>, AuditError> {
    let len = match decode_uvarint(reader)? {
        Some(len) => len,
        None => return Ok(None),
    };
    let mut payload_json = vec![0u8; len as usize];
    reader.read_exact(&mut payload_json)?;
    let mut hash_bytes = [0u8; 32];
    reader.read_exact(&mut hash_bytes)?;
    let record: WireRecord = serde_json::from_slice(&payload_json)?;
    Ok(Some((record, payload_json, hash_bytes)))
}

struct State {
    file: File,
    seq: u64,
    last_hash: String,
}

/// A single hash-chained append-only log file.
pub struct HashChainLog {
    path: PathBuf,
    state: Mutex<State>,
}

impl HashChainLog {
    /// Open (creating if absent) the log at `path`, replaying existing
    /// records to recover the next `seq` and the tail `entry_hash` so
    /// `append` can continue the chain.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Ensure the file exists before the read pass; a fresh log starts
        // from genesis with seq 0.
        OpenOptions::new().create(true).append(true).open(path)?;

        let mut read_file = File::open(path)?;
        let mut seq = 0u64;
        let mut last_hash = GENESIS_PREV_HASH.to_string();
        while let Some((record, _payload_json, hash_bytes)) = read_record(&mut read_file)? {
            seq = record.seq + 1;
            last_hash = hex_encode(&hash_bytes);
        }

        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(State { file, seq, last_hash }),
        })
    }

    /// Append one event, fsyncing before returning so the chain's durability
    /// matches its logical commit point. Returns the new entry's hex-encoded
    /// `entry_hash`.
    pub fn append(&self, event_kind: &str, payload: Value) -> Result<String, AuditError> {
        let mut state = self.state.lock().unwrap();
        let record = WireRecord {
            seq: state.seq,
            ts: Utc::now(),
            kind: event_kind.to_string(),
            prev_hash: state.last_hash.clone(),
            data: payload,
        };
        let payload_json = serde_json::to_vec(&record)?;
        let entry_hash = hash_record(&payload_json);

        let mut frame = Vec::with_capacity(payload_json.len() + 40);
        encode_uvarint(payload_json.len() as u64, &mut frame);
        frame.extend_from_slice(&payload_json);
        frame.extend_from_slice(&entry_hash);

        state.file.write_all(&frame)?;
        state.file.sync_all()?;

        let entry_hash_hex = hex_encode(&entry_hash);
        state.seq += 1;
        state.last_hash = entry_hash_hex.clone();
        Ok(entry_hash_hex)
    }

    /// Re-derive every record's hash and chain link from disk and compare
    /// against what's stored. Returns `Ok(())` if the full chain verifies,
    /// or the first broken link as an error.
    pub fn verify(&self) -> Result<(), AuditError> {
        let mut file = File::open(&self.path)?;
        let mut expected_prev = GENESIS_PREV_HASH.to_string();
        let mut expected_seq = 0u64;
        while let Some((record, payload_json, hash_bytes)) = read_record(&mut file)? {
            if record.seq != expected_seq {
                return Err(AuditError::Fatal(format!(
                    "out-of-order seq: expected {expected_seq}, found {}",
                    record.seq
                )));
            }
            if record.prev_hash != expected_prev {
                return Err(AuditError::Fatal(format!(
                    "entry {} has prev_hash mismatch",
                    record.seq
                )));
            }
            let recomputed = hash_record(&payload_json);
            if recomputed != hash_bytes {
                return Err(AuditError::Fatal(format!(
                    "entry {} hash does not match its contents",
                    record.seq
                )));
            }
            expected_prev = hex_encode(&hash_bytes);
            expected_seq += 1;
        }
        Ok(())
    }

    /// Read back every entry, in order. Used by `promptrelay logs`.
    pub fn read_all(&self) -> Result<Vec<Entry>, AuditError> {
        let mut file = File::open(&self.path)?;
        let mut entries = Vec::new();
        while let Some((record, _payload_json, hash_bytes)) = read_record(&mut file)? {
            entries.push(record_to_entry(record, hash_bytes));
        }
        Ok(entries)
    }

    /// Reset the chain to a fresh root, recording the prior tail hash in the
    /// new root marker so a truncation is itself auditable.
    pub fn reset_with_marker(&self, reason: &str) -> Result<(), AuditError> {
        let mut state = self.state.lock().unwrap();
        let prior_tail = state.last_hash.clone();
        drop(state);
        std::fs::remove_file(&self.path).ok();
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut state = self.state.lock().unwrap();
        state.file = file;
        state.seq = 0;
        state.last_hash = GENESIS_PREV_HASH.to_string();
        drop(state);
        self.append(
            "CHAIN_RESET",
            serde_json::json!({ "reason": reason, "prior_tail": prior_tail }),
        )?;
        Ok(())
    }
}
