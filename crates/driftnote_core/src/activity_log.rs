//! Per-instance activity and deletion logs.
//!
//! Every local write appends one line `{noteId}|{instanceId}_{sequence}\n`
//! to `activity/{instanceId}.log`. Peers tail these files to learn which
//! CRDT logs to fetch. Consecutive lines for the same note are never
//! coalesced — peers consume the stream incrementally and must see every
//! intermediate sequence. Each file is owned and mutated only by its
//! instance.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::fs::StorageFs;

/// Default compaction threshold.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// One parsed activity-log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityLine {
    /// Note the write belongs to.
    pub note_id: String,
    /// Instance that performed the write.
    pub instance_id: String,
    /// Sequence the write was assigned.
    pub sequence: u64,
}

/// Parse `{noteId}|{instanceId}_{sequence}`. Returns `None` for anything
/// malformed; readers skip such lines.
pub fn parse_activity_line(line: &str) -> Option<ActivityLine> {
    let (note_id, entry) = line.split_once('|')?;
    let (instance_id, seq) = entry.rsplit_once('_')?;
    if note_id.is_empty() || instance_id.is_empty() {
        return None;
    }
    let sequence: u64 = seq.parse().ok()?;
    Some(ActivityLine {
        note_id: note_id.to_string(),
        instance_id: instance_id.to_string(),
        sequence,
    })
}

/// Split file content into complete lines.
///
/// A trailing fragment without its `\n` is a line still being delivered by
/// cloud sync and is treated as absent. Empty lines are dropped.
pub fn complete_lines(content: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = content.split('\n').collect();
    if !content.ends_with('\n') {
        lines.pop();
    }
    lines.into_iter().filter(|l| !l.is_empty()).collect()
}

/// Writer for this instance's activity log.
pub struct ActivityLogger {
    fs: Arc<dyn StorageFs>,
    path: PathBuf,
    instance_id: String,
    max_entries: usize,
}

impl ActivityLogger {
    /// Create a logger writing to `{activity_dir}/{instanceId}.log`.
    pub fn new(fs: Arc<dyn StorageFs>, activity_dir: PathBuf, instance_id: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        Self {
            path: activity_dir.join(format!("{instance_id}.log")),
            fs,
            instance_id,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    /// Override the compaction threshold.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Path of the owned log file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append one activity line for a local write.
    pub async fn record_note_activity(&self, note_id: &str, sequence: u64) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            self.fs.create_dir_all(dir).await?;
        }
        let line = format!("{note_id}|{}_{sequence}\n", self.instance_id);
        self.fs.append_file(&self.path, line.as_bytes()).await?;
        Ok(())
    }

    /// Rewrite the file with only the last `max_entries` lines when it has
    /// grown past the threshold. Returns how many lines were dropped.
    pub async fn compact(&self) -> Result<usize> {
        let content = match self.fs.read_file(&self.path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let lines = complete_lines(&content);
        if lines.len() <= self.max_entries {
            return Ok(0);
        }

        let dropped = lines.len() - self.max_entries;
        let mut rewritten = lines[dropped..].join("\n");
        rewritten.push('\n');
        self.fs.write_file(&self.path, rewritten.as_bytes()).await?;
        log::info!(
            "[ActivityLog] compacted {}: dropped {} lines",
            self.path.display(),
            dropped
        );
        Ok(dropped)
    }
}

/// Writer for this instance's deletion log: `{noteId}|{timestampMs}\n`.
pub struct DeletionLogger {
    fs: Arc<dyn StorageFs>,
    path: PathBuf,
}

impl DeletionLogger {
    /// Create a logger writing to `{deletion_dir}/{instanceId}.log`.
    pub fn new(fs: Arc<dyn StorageFs>, deletion_dir: PathBuf, instance_id: &str) -> Self {
        Self {
            path: deletion_dir.join(format!("{instance_id}.log")),
            fs,
        }
    }

    /// Record that a note was permanently deleted.
    pub async fn record_deletion(&self, note_id: &str) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            self.fs.create_dir_all(dir).await?;
        }
        let line = format!("{note_id}|{}\n", chrono::Utc::now().timestamp_millis());
        self.fs.append_file(&self.path, line.as_bytes()).await?;
        Ok(())
    }
}
