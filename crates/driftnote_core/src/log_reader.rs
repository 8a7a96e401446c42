//! Stateless reading of `.crdtlog` files.

use std::path::{Path, PathBuf};

use crate::codec;
use crate::error::Result;
use crate::fs::StorageFs;
use crate::types::{LogEntry, ParsedFileName, LOG_EXTENSION};

/// A log file discovered in a `logs/` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileInfo {
    /// File basename, e.g. `inst-a_1700000000000.crdtlog`.
    pub filename: String,
    /// Full path to the file.
    pub path: PathBuf,
    /// Writer key parsed from the name.
    pub instance_id: String,
    /// Creation timestamp parsed from the name, ms since the Unix epoch.
    pub timestamp_ms: i64,
    /// File size in bytes at listing time.
    pub size: u64,
}

/// A record yielded by [`read_records`], with its position in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    /// Wall-clock write time from the record.
    pub timestamp_ms: i64,
    /// Per-(note, instance) sequence.
    pub sequence: u64,
    /// Opaque CRDT update bytes.
    pub data: Vec<u8>,
    /// Byte offset where this record's frame starts.
    pub offset: u64,
    /// Total frame size, length prefix included.
    pub bytes_read: usize,
}

/// List every `.crdtlog` in `dir` whose name matches the storage pattern,
/// sorted by parsed creation timestamp ascending.
///
/// Files that cannot be stat'ed (deleted between listing and stat by a peer
/// or the sync service) are skipped.
pub async fn list_log_files(fs: &dyn StorageFs, dir: &Path) -> Result<Vec<LogFileInfo>> {
    let mut files = Vec::new();
    for path in fs.list_files(dir).await? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(parsed) = ParsedFileName::parse(name, LOG_EXTENSION) else {
            continue;
        };
        let Ok(stat) = fs.stat(&path).await else {
            continue;
        };
        files.push(LogFileInfo {
            filename: parsed.filename,
            path: path.clone(),
            instance_id: parsed.instance_id,
            timestamp_ms: parsed.timestamp_ms,
            size: stat.size,
        });
    }
    files.sort_by(|a, b| {
        a.timestamp_ms
            .cmp(&b.timestamp_ms)
            .then_with(|| a.filename.cmp(&b.filename))
    });
    Ok(files)
}

/// Read the records of one log file.
///
/// With no `start_offset` the header is validated and iteration starts just
/// past it; with an offset (from a vector clock) iteration jumps straight
/// there. Stops cleanly at a termination sentinel or the end of the buffer;
/// a frame cut short propagates [`crate::StoreError::Truncated`] so the
/// caller can retry once cloud sync delivers the rest.
pub async fn read_records(
    fs: &dyn StorageFs,
    path: &Path,
    start_offset: Option<u64>,
) -> Result<Vec<ReadRecord>> {
    let buf = fs.read_file(path).await?;

    let mut pos = match start_offset {
        Some(offset) => offset as usize,
        None => {
            codec::read_log_header(&buf)?;
            codec::LOG_HEADER_LEN
        }
    };

    let mut records = Vec::new();
    while pos < buf.len() {
        let decoded = codec::decode_entry(&buf, pos)?;
        match decoded.entry {
            LogEntry::Terminator => break,
            LogEntry::Record(record) => {
                records.push(ReadRecord {
                    timestamp_ms: record.timestamp_ms,
                    sequence: record.sequence,
                    data: record.data,
                    offset: pos as u64,
                    bytes_read: decoded.bytes_read,
                });
                pos += decoded.bytes_read;
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::fs::MemoryFs;
    use crate::types::LogRecord;

    fn two_records() -> Vec<LogRecord> {
        vec![
            LogRecord {
                timestamp_ms: 1000,
                sequence: 1,
                data: vec![0xaa],
            },
            LogRecord {
                timestamp_ms: 2000,
                sequence: 2,
                data: vec![0xbb],
            },
        ]
    }

    #[tokio::test]
    async fn roundtrip_unterminated_then_finalized() {
        let fs = MemoryFs::new();
        let path = Path::new("logs/a_1.crdtlog");

        fs.write_file(path, &codec::create_log_file(&two_records(), false).unwrap())
            .await
            .unwrap();
        let records = read_records(&fs, path, None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[0].data, vec![0xaa]);
        assert_eq!(records[0].offset, codec::LOG_HEADER_LEN as u64);
        assert_eq!(records[1].sequence, 2);
        assert_eq!(
            records[1].offset,
            records[0].offset + records[0].bytes_read as u64
        );

        // Finalizing the file leaves the records unchanged.
        fs.write_file(path, &codec::create_log_file(&two_records(), true).unwrap())
            .await
            .unwrap();
        let finalized = read_records(&fs, path, None).await.unwrap();
        assert_eq!(finalized, records);
    }

    #[tokio::test]
    async fn start_offset_skips_earlier_records() {
        let fs = MemoryFs::new();
        let path = Path::new("logs/a_1.crdtlog");
        fs.write_file(path, &codec::create_log_file(&two_records(), false).unwrap())
            .await
            .unwrap();

        let all = read_records(&fs, path, None).await.unwrap();
        let from_second = read_records(&fs, path, Some(all[1].offset)).await.unwrap();
        assert_eq!(from_second.len(), 1);
        assert_eq!(from_second[0].sequence, 2);
    }

    #[tokio::test]
    async fn truncated_record_propagates() {
        let fs = MemoryFs::new();
        let path = Path::new("logs/a_1.crdtlog");
        let mut bytes = codec::create_log_file(&two_records(), false).unwrap();
        bytes.truncate(bytes.len() - 1);
        fs.write_file(path, &bytes).await.unwrap();

        let err = read_records(&fs, path, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Truncated(_)));
    }

    #[tokio::test]
    async fn bad_magic_propagates() {
        let fs = MemoryFs::new();
        let path = Path::new("logs/a_1.crdtlog");
        fs.write_file(path, b"JUNK\x01rest").await.unwrap();

        let err = read_records(&fs, path, None).await.unwrap_err();
        assert!(matches!(err, StoreError::BadMagic { .. }));
    }

    #[tokio::test]
    async fn listing_filters_and_sorts() {
        let fs = MemoryFs::new();
        let dir = Path::new("logs");
        fs.write_file(&dir.join("inst_200.crdtlog"), b"x").await.unwrap();
        fs.write_file(&dir.join("inst_100.crdtlog"), b"xy").await.unwrap();
        fs.write_file(&dir.join("notalog.txt"), b"x").await.unwrap();
        fs.write_file(&dir.join("badname.crdtlog"), b"x").await.unwrap();

        let files = list_log_files(&fs, dir).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].filename, "inst_100.crdtlog");
        assert_eq!(files[0].size, 2);
        assert_eq!(files[1].filename, "inst_200.crdtlog");
        assert_eq!(files[1].instance_id, "inst");
    }

    #[tokio::test]
    async fn listing_missing_dir_is_empty() {
        let fs = MemoryFs::new();
        let files = list_log_files(&fs, Path::new("nope")).await.unwrap();
        assert!(files.is_empty());
    }
}
