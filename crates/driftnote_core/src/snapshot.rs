//! Snapshot files: compact document state plus a vector clock.
//!
//! A snapshot is written in two phases: the full payload goes to disk with
//! status `0x00` (incomplete) and is fsynced, then the status byte at offset
//! 5 is flipped to `0x01` (complete) and fsynced again. The resulting
//! invariant is that no file ever claims completeness before its payload is
//! durable, so a reader may trust any complete snapshot in isolation.

use std::path::{Path, PathBuf};

use crate::codec;
use crate::crdt::CrdtDoc;
use crate::error::{Result, StoreError};
use crate::fs::StorageFs;
use crate::types::{
    ClockEntry, ParsedFileName, SnapshotStatus, VectorClock, SNAPSHOT_EXTENSION,
};

/// A snapshot file discovered in a `snapshots/` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFileInfo {
    /// File basename, e.g. `inst-a_1700000000000.snapshot`.
    pub filename: String,
    /// Full path to the file.
    pub path: PathBuf,
    /// Writer key parsed from the name.
    pub instance_id: String,
    /// Creation timestamp parsed from the name.
    pub timestamp_ms: i64,
}

/// A fully parsed snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Status byte from the header.
    pub status: SnapshotStatus,
    /// How far into each peer's log this state has absorbed.
    pub vector_clock: VectorClock,
    /// Encoded CRDT document state.
    pub state: Vec<u8>,
}

/// List every `.snapshot` in `dir` matching the storage pattern, sorted by
/// creation timestamp descending (newest first).
pub async fn list_snapshot_files(fs: &dyn StorageFs, dir: &Path) -> Result<Vec<SnapshotFileInfo>> {
    let mut files = Vec::new();
    for path in fs.list_files(dir).await? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(parsed) = ParsedFileName::parse(name, SNAPSHOT_EXTENSION) else {
            continue;
        };
        files.push(SnapshotFileInfo {
            filename: parsed.filename,
            path: path.clone(),
            instance_id: parsed.instance_id,
            timestamp_ms: parsed.timestamp_ms,
        });
    }
    files.sort_by(|a, b| {
        b.timestamp_ms
            .cmp(&a.timestamp_ms)
            .then_with(|| b.filename.cmp(&a.filename))
    });
    Ok(files)
}

/// Parse only the header of a snapshot and report whether it is complete.
pub async fn is_complete(fs: &dyn StorageFs, path: &Path) -> Result<bool> {
    let bytes = fs.read_file(path).await?;
    Ok(codec::read_snapshot_header(&bytes)? == SnapshotStatus::Complete)
}

/// Read and parse an entire snapshot file.
pub async fn read_snapshot(fs: &dyn StorageFs, path: &Path) -> Result<Snapshot> {
    let bytes = fs.read_file(path).await?;
    let status = codec::read_snapshot_header(&bytes)?;
    let (vector_clock, clock_len) =
        codec::decode_vector_clock(&bytes, codec::SNAPSHOT_HEADER_LEN)?;
    let state = bytes[codec::SNAPSHOT_HEADER_LEN + clock_len..].to_vec();
    Ok(Snapshot {
        status,
        vector_clock,
        state,
    })
}

/// Find the newest complete snapshot in `dir`.
///
/// Iterates newest-first and returns the first file whose status byte is
/// `0x01`. Incomplete and unparseable files are skipped; if every file is
/// incomplete the result is `None` — an incomplete snapshot is never loaded.
pub async fn find_best_snapshot(
    fs: &dyn StorageFs,
    dir: &Path,
) -> Result<Option<(SnapshotFileInfo, Snapshot)>> {
    for info in list_snapshot_files(fs, dir).await? {
        match read_snapshot(fs, &info.path).await {
            Ok(snapshot) if snapshot.status == SnapshotStatus::Complete => {
                return Ok(Some((info, snapshot)));
            }
            Ok(_) => continue,
            Err(e) => {
                log::warn!(
                    "[Snapshot] skipping unreadable snapshot {}: {}",
                    info.filename,
                    e
                );
            }
        }
    }
    Ok(None)
}

/// Write a snapshot with the two-phase protocol and return its basename.
pub async fn write_snapshot(
    fs: &dyn StorageFs,
    dir: &Path,
    instance_id: &str,
    clock: &VectorClock,
    state: &[u8],
) -> Result<String> {
    fs.create_dir_all(dir).await?;

    let mut timestamp = chrono::Utc::now().timestamp_millis();
    let (filename, path) = loop {
        let filename = format!("{instance_id}_{timestamp}.{SNAPSHOT_EXTENSION}");
        let path = dir.join(&filename);
        if !fs.exists(&path).await {
            break (filename, path);
        }
        timestamp += 1;
    };

    // Phase one: full payload with status incomplete, durable on return.
    let bytes = codec::create_snapshot_file(clock, state, false);
    fs.write_file(&path, &bytes).await?;

    // Phase two: flip the status byte in place, durable on return.
    fs.seek_write(
        &path,
        codec::SNAPSHOT_STATUS_OFFSET,
        &[SnapshotStatus::Complete.as_byte()],
    )
    .await?;

    log::debug!("[Snapshot] wrote {} ({} state bytes)", filename, state.len());
    Ok(filename)
}

/// Document state under construction, tracking the vector clock of what it
/// has absorbed and enforcing per-peer sequence contiguity.
pub struct DocumentSnapshot {
    doc: Box<dyn CrdtDoc>,
    clock: VectorClock,
}

impl DocumentSnapshot {
    /// Start from an empty document and clock.
    pub fn new(doc: Box<dyn CrdtDoc>) -> Self {
        Self {
            doc,
            clock: VectorClock::new(),
        }
    }

    /// Start from a loaded state (e.g. a prior snapshot) and its clock.
    pub fn from_parts(doc: Box<dyn CrdtDoc>, clock: VectorClock) -> Self {
        Self { doc, clock }
    }

    /// Apply one update from `instance_id`.
    ///
    /// `sequence` must be exactly one past the clock's current sequence for
    /// that instance; anything else is a [`StoreError::SequenceViolation`]
    /// (fatal at the call site — the caller's bookkeeping is broken).
    pub fn apply_update(
        &mut self,
        instance_id: &str,
        sequence: u64,
        offset: u64,
        file: &str,
        data: &[u8],
    ) -> Result<()> {
        let expected = self.clock.sequence_of(instance_id) + 1;
        if sequence != expected {
            return Err(StoreError::SequenceViolation {
                instance_id: instance_id.to_string(),
                expected,
                got: sequence,
            });
        }
        self.doc.apply_update(data)?;
        self.clock.set(
            instance_id,
            ClockEntry {
                sequence,
                offset,
                file: file.to_string(),
            },
        );
        Ok(())
    }

    /// The clock of everything absorbed so far.
    pub fn vector_clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Encode the current document state.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.encode_state()
    }

    /// Consume into the document and clock.
    pub fn into_parts(self) -> (Box<dyn CrdtDoc>, VectorClock) {
        (self.doc, self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{CrdtFactory, YrsCrdt};
    use crate::fs::MemoryFs;

    fn sample_clock() -> VectorClock {
        let mut clock = VectorClock::new();
        clock.set(
            "inst-a",
            ClockEntry {
                sequence: 3,
                offset: 77,
                file: "inst-a_100.crdtlog".to_string(),
            },
        );
        clock
    }

    #[tokio::test]
    async fn two_phase_write_then_read() {
        let fs = MemoryFs::new();
        let dir = Path::new("snapshots");

        let filename = write_snapshot(&fs, dir, "inst-a", &sample_clock(), &[1, 2, 3])
            .await
            .unwrap();
        let path = dir.join(&filename);

        assert!(is_complete(&fs, &path).await.unwrap());
        let snapshot = read_snapshot(&fs, &path).await.unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Complete);
        assert_eq!(snapshot.vector_clock, sample_clock());
        assert_eq!(snapshot.state, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn best_snapshot_ignores_incomplete() {
        let fs = MemoryFs::new();
        let dir = Path::new("snapshots");
        fs.create_dir_all(dir).await.unwrap();

        // Older, complete.
        let complete = codec::create_snapshot_file(&sample_clock(), &[0x01], true);
        fs.write_file(&dir.join("inst-a_100.snapshot"), &complete)
            .await
            .unwrap();
        // Newer, but crashed before the status flip.
        let incomplete = codec::create_snapshot_file(&sample_clock(), &[0x02], false);
        fs.write_file(&dir.join("inst-a_200.snapshot"), &incomplete)
            .await
            .unwrap();

        let (info, snapshot) = find_best_snapshot(&fs, dir).await.unwrap().unwrap();
        assert_eq!(info.filename, "inst-a_100.snapshot");
        assert_eq!(snapshot.state, vec![0x01]);
    }

    #[tokio::test]
    async fn all_incomplete_returns_none() {
        let fs = MemoryFs::new();
        let dir = Path::new("snapshots");
        let incomplete = codec::create_snapshot_file(&VectorClock::new(), &[0x02], false);
        fs.write_file(&dir.join("inst-a_100.snapshot"), &incomplete)
            .await
            .unwrap();

        assert!(find_best_snapshot(&fs, dir).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_snapshot_is_skipped() {
        let fs = MemoryFs::new();
        let dir = Path::new("snapshots");
        fs.write_file(&dir.join("inst-a_300.snapshot"), b"garbage")
            .await
            .unwrap();
        let complete = codec::create_snapshot_file(&sample_clock(), &[0x01], true);
        fs.write_file(&dir.join("inst-a_100.snapshot"), &complete)
            .await
            .unwrap();

        let (info, _) = find_best_snapshot(&fs, dir).await.unwrap().unwrap();
        assert_eq!(info.filename, "inst-a_100.snapshot");
    }

    #[tokio::test]
    async fn listing_is_newest_first() {
        let fs = MemoryFs::new();
        let dir = Path::new("snapshots");
        fs.write_file(&dir.join("inst-a_100.snapshot"), b"x")
            .await
            .unwrap();
        fs.write_file(&dir.join("inst-a_300.snapshot"), b"x")
            .await
            .unwrap();
        fs.write_file(&dir.join("inst-a_200.snapshot"), b"x")
            .await
            .unwrap();

        let files = list_snapshot_files(&fs, dir).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(
            names,
            [
                "inst-a_300.snapshot",
                "inst-a_200.snapshot",
                "inst-a_100.snapshot"
            ]
        );
    }

    #[test]
    fn document_snapshot_enforces_contiguity() {
        let factory = YrsCrdt::new();
        let mut snap = DocumentSnapshot::new(factory.new_doc());

        // An empty document's state is a valid no-op update for sequencing
        // tests.
        let update = factory.new_doc().encode_state();

        snap.apply_update("peer", 1, 10, "peer_1.crdtlog", &update)
            .unwrap();
        snap.apply_update("peer", 2, 20, "peer_1.crdtlog", &update)
            .unwrap();

        let err = snap
            .apply_update("peer", 4, 30, "peer_1.crdtlog", &update)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::SequenceViolation {
                expected: 3,
                got: 4,
                ..
            }
        ));

        assert_eq!(snap.vector_clock().sequence_of("peer"), 2);
        assert_eq!(snap.vector_clock().get("peer").unwrap().offset, 20);
    }
}
