//! Core data types shared across the storage engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// File extension for append-only CRDT update logs.
pub const LOG_EXTENSION: &str = "crdtlog";

/// File extension for document snapshots.
pub const SNAPSHOT_EXTENSION: &str = "snapshot";

/// One decoded log-record frame: either a payload-carrying record or the
/// termination sentinel that marks a finalized file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// A CRDT update record.
    Record(LogRecord),
    /// Zero-length frame: the file is finalized, nothing follows.
    Terminator,
}

/// A single CRDT update as stored in a `.crdtlog` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Wall-clock write time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Per-(note, instance) sequence, monotonic and contiguous from 1.
    pub sequence: u64,
    /// Opaque CRDT update bytes.
    pub data: Vec<u8>,
}

/// Snapshot header status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// Payload may be partial; written before the final fsync.
    Incomplete,
    /// All payload bytes are durable; safe to load alone.
    Complete,
}

impl SnapshotStatus {
    /// The on-disk status byte.
    pub fn as_byte(self) -> u8 {
        match self {
            SnapshotStatus::Incomplete => 0x00,
            SnapshotStatus::Complete => 0x01,
        }
    }

    /// Parse a status byte; anything outside {0x00, 0x01} is rejected.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(SnapshotStatus::Incomplete),
            0x01 => Ok(SnapshotStatus::Complete),
            other => Err(StoreError::BadStatus(other)),
        }
    }
}

/// Per-instance position inside a vector clock.
///
/// Says: "all records from this instance up to `sequence` are incorporated;
/// they end in `file`, and the next byte to read from that file is `offset`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEntry {
    /// Highest incorporated sequence for this instance.
    pub sequence: u64,
    /// Byte offset just past the last incorporated record in `file`.
    pub offset: u64,
    /// Basename of the log file the last incorporated record lives in.
    pub file: String,
}

/// Vector clock: how far into each peer's log a document state has absorbed.
///
/// Keys are writer keys (the filename prefix before the timestamp, normally
/// a bare instance id). A `BTreeMap` keeps serialization deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, ClockEntry>);

impl VectorClock {
    /// Empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the entry for an instance.
    pub fn get(&self, instance_id: &str) -> Option<&ClockEntry> {
        self.0.get(instance_id)
    }

    /// Insert or replace an entry.
    pub fn set(&mut self, instance_id: impl Into<String>, entry: ClockEntry) {
        self.0.insert(instance_id.into(), entry);
    }

    /// Highest incorporated sequence for an instance, 0 if absent.
    pub fn sequence_of(&self, instance_id: &str) -> u64 {
        self.0.get(instance_id).map(|e| e.sequence).unwrap_or(0)
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ClockEntry)> {
        self.0.iter()
    }

    /// Number of instances in the clock.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no instance is tracked.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize to the JSON form stored in the sync-state cache.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the JSON form stored in the sync-state cache.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Parsed pieces of a `{writerKey}_{timestampMs}.{ext}` storage file name.
///
/// The writer key is everything before the final `_{digits}` component.
/// Current builds write a bare instance id there; files from older builds
/// carry a `{profileId}_{instanceId}` prefix, which is matched by suffix
/// (see [`ParsedFileName::matches_instance`]) rather than re-split, because
/// base64url instance ids may themselves contain `_`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFileName {
    /// Full filename including extension.
    pub filename: String,
    /// Writer key: filename prefix before the trailing timestamp.
    pub instance_id: String,
    /// Creation timestamp encoded in the name, ms since the Unix epoch.
    pub timestamp_ms: i64,
}

impl ParsedFileName {
    /// Parse a file name with the given extension (`"crdtlog"`, `"snapshot"`,
    /// `"log"`). Returns `None` for names that do not match the pattern.
    pub fn parse(filename: &str, extension: &str) -> Option<Self> {
        let stem = filename.strip_suffix(&format!(".{extension}"))?;
        let (prefix, ts) = stem.rsplit_once('_')?;
        if prefix.is_empty() || ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let timestamp_ms: i64 = ts.parse().ok()?;
        Some(Self {
            filename: filename.to_string(),
            instance_id: prefix.to_string(),
            timestamp_ms,
        })
    }

    /// Whether this file was written by `instance_id`, honoring both naming
    /// eras: a bare `{instanceId}` prefix and a legacy
    /// `{profileId}_{instanceId}` prefix.
    pub fn matches_instance(&self, instance_id: &str) -> bool {
        writer_key_matches(&self.instance_id, instance_id)
    }
}

/// Whether a writer key (a filename prefix or vector-clock key) belongs to
/// `instance_id`, honoring the legacy profile-prefixed naming era.
pub fn writer_key_matches(key: &str, instance_id: &str) -> bool {
    key == instance_id
        || key
            .strip_suffix(instance_id)
            .is_some_and(|rest| rest.ends_with('_'))
}

/// Convert a dashed 36-char UUID note id to its 22-char base64url compact
/// form. Ids already in compact form (or unrecognized) pass through.
pub fn compact_note_id(id: &str) -> String {
    use base64::Engine;
    match uuid::Uuid::parse_str(id) {
        Ok(uuid) => base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(uuid.as_bytes()),
        Err(_) => id.to_string(),
    }
}

/// Convert a 22-char base64url compact note id to its dashed 36-char UUID
/// form. Ids already dashed (or unrecognized) pass through.
pub fn expand_note_id(id: &str) -> String {
    use base64::Engine;
    if id.len() != 22 {
        return id.to_string();
    }
    let Ok(bytes) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(id) else {
        return id.to_string();
    };
    match <[u8; 16]>::try_from(bytes.as_slice()) {
        Ok(raw) => uuid::Uuid::from_bytes(raw).to_string(),
        Err(_) => id.to_string(),
    }
}
