//! Startup crash recovery and storage hygiene.
//!
//! Run once per note directory on startup: incomplete snapshots (a crash
//! between the two write phases) are deleted, old snapshots are pruned, and
//! log files fully covered by the newest complete snapshot's vector clock
//! are removed. Log integrity can be validated file by file for diagnostics.

use std::path::Path;

use crate::codec;
use crate::crdt::{CrdtDoc, CrdtFactory};
use crate::error::{Result, StoreError};
use crate::fs::StorageFs;
use crate::log_reader::list_log_files;
use crate::note_store::merge_logs;
use crate::snapshot::{find_best_snapshot, list_snapshot_files};
use crate::types::{LogEntry, SnapshotStatus, VectorClock};

/// Delete every snapshot whose status byte is not `0x01`.
///
/// Returns the deleted basenames. Files whose header cannot be parsed at all
/// are left alone — they may still be mid-delivery from a peer.
pub async fn cleanup_incomplete_snapshots(
    fs: &dyn StorageFs,
    snapshots_dir: &Path,
) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for info in list_snapshot_files(fs, snapshots_dir).await? {
        let Ok(bytes) = fs.read_file(&info.path).await else {
            continue;
        };
        let incomplete = match codec::read_snapshot_header(&bytes) {
            Ok(SnapshotStatus::Complete) => false,
            Ok(SnapshotStatus::Incomplete) | Err(StoreError::BadStatus(_)) => true,
            Err(_) => continue,
        };
        if incomplete {
            if fs.delete_file(&info.path).await.is_ok() {
                log::info!("[Recovery] deleted incomplete snapshot {}", info.filename);
                deleted.push(info.filename);
            }
        }
    }
    Ok(deleted)
}

/// Keep only the `keep` most recent complete snapshots, deleting the rest.
pub async fn prune_snapshots(
    fs: &dyn StorageFs,
    snapshots_dir: &Path,
    keep: usize,
) -> Result<Vec<String>> {
    let mut complete = Vec::new();
    for info in list_snapshot_files(fs, snapshots_dir).await? {
        match crate::snapshot::is_complete(fs, &info.path).await {
            Ok(true) => complete.push(info),
            _ => continue,
        }
    }

    let mut deleted = Vec::new();
    // Listing is newest-first, so everything past `keep` is older.
    for info in complete.into_iter().skip(keep) {
        if fs.delete_file(&info.path).await.is_ok() {
            log::info!("[Recovery] pruned old snapshot {}", info.filename);
            deleted.push(info.filename);
        }
    }
    Ok(deleted)
}

/// Delete log files fully covered by the given snapshot vector clock.
///
/// A file is covered when the clock names the same writer and a
/// lexicographically later filename. Files from writers the clock does not
/// mention are kept — their history is not yet folded into any snapshot.
pub async fn prune_logs(
    fs: &dyn StorageFs,
    logs_dir: &Path,
    clock: &VectorClock,
) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for file in list_log_files(fs, logs_dir).await? {
        let Some(entry) = clock.get(&file.instance_id) else {
            continue;
        };
        if file.filename.as_str() < entry.file.as_str() {
            if fs.delete_file(&file.path).await.is_ok() {
                log::info!("[Recovery] pruned covered log {}", file.filename);
                deleted.push(file.filename);
            }
        }
    }
    Ok(deleted)
}

/// Result of a log-file integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Whether the whole file parsed cleanly.
    pub valid: bool,
    /// Records parsed successfully before any failure.
    pub record_count: usize,
    /// Human-readable description of the first failure, if any.
    pub error: Option<String>,
}

/// Validate one log file: header plus every record frame.
///
/// Corruption is reported, not raised — a partial count means that many
/// records parsed before the file went bad.
pub async fn validate_log_integrity(fs: &dyn StorageFs, path: &Path) -> Result<IntegrityReport> {
    let bytes = fs.read_file(path).await?;

    if let Err(e) = codec::read_log_header(&bytes) {
        return Ok(IntegrityReport {
            valid: false,
            record_count: 0,
            error: Some(format!("corrupt log: {e}")),
        });
    }

    let mut pos = codec::LOG_HEADER_LEN;
    let mut record_count = 0;
    while pos < bytes.len() {
        match codec::decode_entry(&bytes, pos) {
            Ok(decoded) => match decoded.entry {
                LogEntry::Terminator => break,
                LogEntry::Record(_) => {
                    record_count += 1;
                    pos += decoded.bytes_read;
                }
            },
            Err(e) => {
                return Ok(IntegrityReport {
                    valid: false,
                    record_count,
                    error: Some(format!("corrupt log: {e}")),
                });
            }
        }
    }

    Ok(IntegrityReport {
        valid: true,
        record_count,
        error: None,
    })
}

/// Rebuild a note document from its directories: best complete snapshot (if
/// any) plus every log record past it. `None` when the note has no snapshot
/// and no log files at all.
pub async fn recover_document(
    fs: &dyn StorageFs,
    crdt: &dyn CrdtFactory,
    snapshots_dir: &Path,
    logs_dir: &Path,
) -> Result<Option<(Box<dyn CrdtDoc>, VectorClock)>> {
    let mut doc = crdt.new_doc();
    let mut clock = VectorClock::new();

    let snapshot = find_best_snapshot(fs, snapshots_dir).await?;
    let logs = list_log_files(fs, logs_dir).await?;
    if snapshot.is_none() && logs.is_empty() {
        return Ok(None);
    }

    if let Some((_, snap)) = snapshot {
        doc.apply_update(&snap.state)?;
        clock = snap.vector_clock;
    }
    merge_logs(fs, doc.as_mut(), &mut clock, logs_dir).await?;
    Ok(Some((doc, clock)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::YrsCrdt;
    use crate::fs::MemoryFs;
    use crate::types::{ClockEntry, LogRecord};
    use std::path::PathBuf;

    fn snapshot_bytes(state: &[u8], complete: bool) -> Vec<u8> {
        codec::create_snapshot_file(&VectorClock::new(), state, complete)
    }

    #[tokio::test]
    async fn incomplete_snapshots_are_deleted_complete_survive() {
        let fs = MemoryFs::new();
        let dir = Path::new("snapshots");
        fs.write_file(&dir.join("a_100.snapshot"), &snapshot_bytes(&[1], true))
            .await
            .unwrap();
        fs.write_file(&dir.join("a_200.snapshot"), &snapshot_bytes(&[2], false))
            .await
            .unwrap();

        let deleted = cleanup_incomplete_snapshots(&fs, dir).await.unwrap();
        assert_eq!(deleted, vec!["a_200.snapshot"]);

        // The older complete snapshot is still the best one.
        let (info, _) = find_best_snapshot(&fs, dir).await.unwrap().unwrap();
        assert_eq!(info.filename, "a_100.snapshot");
    }

    #[tokio::test]
    async fn prune_keeps_n_most_recent() {
        let fs = MemoryFs::new();
        let dir = Path::new("snapshots");
        for ts in [100, 200, 300] {
            fs.write_file(
                &dir.join(format!("a_{ts}.snapshot")),
                &snapshot_bytes(&[1], true),
            )
            .await
            .unwrap();
        }

        let deleted = prune_snapshots(&fs, dir, 2).await.unwrap();
        assert_eq!(deleted, vec!["a_100.snapshot"]);
        assert_eq!(list_snapshot_files(&fs, dir).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn prune_logs_follows_watermark() {
        let fs = MemoryFs::new();
        let dir = Path::new("logs");
        for name in [
            "inst-a_100.crdtlog",
            "inst-a_200.crdtlog",
            "inst-b_150.crdtlog",
        ] {
            fs.write_file(&dir.join(name), b"x").await.unwrap();
        }

        let mut clock = VectorClock::new();
        clock.set(
            "inst-a",
            ClockEntry {
                sequence: 10,
                offset: 99,
                file: "inst-a_200.crdtlog".to_string(),
            },
        );

        let deleted = prune_logs(&fs, dir, &clock).await.unwrap();
        // Strictly older file of the clocked instance goes; the referenced
        // file and the unclocked instance's file stay.
        assert_eq!(deleted, vec!["inst-a_100.crdtlog"]);
        assert_eq!(list_log_files(&fs, dir).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn integrity_reports_partial_counts() {
        let fs = MemoryFs::new();
        let path = PathBuf::from("logs/a_1.crdtlog");
        let records = vec![
            LogRecord {
                timestamp_ms: 1,
                sequence: 1,
                data: vec![0xaa],
            },
            LogRecord {
                timestamp_ms: 2,
                sequence: 2,
                data: vec![0xbb; 32],
            },
        ];
        let mut bytes = codec::create_log_file(&records, false).unwrap();
        bytes.truncate(bytes.len() - 10);
        fs.write_file(&path, &bytes).await.unwrap();

        let report = validate_log_integrity(&fs, &path).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.record_count, 1);
        assert!(report.error.unwrap().contains("corrupt log"));
    }

    #[tokio::test]
    async fn integrity_accepts_clean_files() {
        let fs = MemoryFs::new();
        let path = PathBuf::from("logs/a_1.crdtlog");
        let records = vec![LogRecord {
            timestamp_ms: 1,
            sequence: 1,
            data: vec![0xaa],
        }];
        fs.write_file(&path, &codec::create_log_file(&records, true).unwrap())
            .await
            .unwrap();

        let report = validate_log_integrity(&fs, &path).await.unwrap();
        assert_eq!(
            report,
            IntegrityReport {
                valid: true,
                record_count: 1,
                error: None,
            }
        );
    }

    #[tokio::test]
    async fn integrity_flags_bad_header() {
        let fs = MemoryFs::new();
        let path = PathBuf::from("logs/a_1.crdtlog");
        fs.write_file(&path, b"WRONGMAGIC").await.unwrap();

        let report = validate_log_integrity(&fs, &path).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.record_count, 0);
    }

    #[tokio::test]
    async fn recover_empty_note_is_none() {
        let fs = MemoryFs::new();
        let factory = YrsCrdt::new();
        let recovered = recover_document(
            &fs,
            &factory,
            Path::new("snapshots"),
            Path::new("logs"),
        )
        .await
        .unwrap();
        assert!(recovered.is_none());
    }
}
