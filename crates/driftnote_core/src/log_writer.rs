//! Append-only log writer, scoped to one (note, instance) pair.
//!
//! The writer owns the current `.crdtlog` file for its note: it creates
//! files named `{instanceId}_{timestampMs}.crdtlog`, appends framed records,
//! rotates at a size threshold (terminating the old file with a sentinel),
//! and on restart resumes into an existing non-finalized file — truncating a
//! partial trailing record left by a crash.
//!
//! The writer assumes exclusive access within the instance to its own files;
//! cross-task ordering is enforced by the note store's per-note lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec;
use crate::error::{Result, StoreError};
use crate::fs::{BoxFuture, StorageFs};
use crate::types::{ParsedFileName, LOG_EXTENSION};

/// Configuration for [`LogWriter`].
#[derive(Debug, Clone)]
pub struct LogWriterConfig {
    /// Rotate before a record would push the file past this size.
    pub rotation_size_bytes: u64,
}

impl Default for LogWriterConfig {
    fn default() -> Self {
        Self {
            rotation_size_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Details of a completed rotation, passed to the rotate hook.
#[derive(Debug, Clone)]
pub struct RotateEvent {
    /// Basename of the file that was just finalized.
    pub finalized_file: String,
}

/// Hook invoked after a file is finalized during rotation and before the
/// next file is created. The note store uses it to cut a snapshot covering
/// the finalized file.
pub type RotateHook = Arc<dyn Fn(RotateEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Where an appended record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    /// Basename of the log file written to.
    pub file: String,
    /// Byte offset where the record's frame starts.
    pub offset: u64,
}

struct CurrentFile {
    filename: String,
    path: PathBuf,
    offset: u64,
}

/// Append-only writer for one note's log directory.
pub struct LogWriter {
    fs: Arc<dyn StorageFs>,
    logs_dir: PathBuf,
    instance_id: String,
    config: LogWriterConfig,
    rotate_hook: Option<RotateHook>,
    current: Option<CurrentFile>,
    finalized: bool,
}

impl LogWriter {
    /// Create a writer. No I/O happens until the first append.
    pub fn new(
        fs: Arc<dyn StorageFs>,
        logs_dir: PathBuf,
        instance_id: impl Into<String>,
        config: LogWriterConfig,
    ) -> Self {
        Self {
            fs,
            logs_dir,
            instance_id: instance_id.into(),
            config,
            rotate_hook: None,
            current: None,
            finalized: false,
        }
    }

    /// Install the rotation hook.
    pub fn set_rotate_hook(&mut self, hook: RotateHook) {
        self.rotate_hook = Some(hook);
    }

    /// Basename of the file currently being written, if any.
    pub fn current_file(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.filename.as_str())
    }

    /// Next append offset in the current file, if any.
    pub fn current_offset(&self) -> Option<u64> {
        self.current.as_ref().map(|c| c.offset)
    }

    /// Append one record, rotating first if it would overflow the current
    /// file. Returns the file and the offset where the record starts.
    pub async fn append_record(
        &mut self,
        timestamp_ms: i64,
        sequence: u64,
        data: &[u8],
    ) -> Result<AppendResult> {
        if self.finalized {
            return Err(StoreError::Finalized);
        }
        if self.current.is_none() {
            self.initialize().await?;
        }

        let frame = codec::encode_record(timestamp_ms, sequence, data)?;
        let needs_rotation = {
            let current = self.current.as_ref().expect("initialized above");
            current.offset + frame.len() as u64 > self.config.rotation_size_bytes
        };
        if needs_rotation {
            self.rotate().await?;
        }

        let current = self.current.as_mut().expect("initialized above");
        let offset = current.offset;
        self.fs.append_file(&current.path, &frame).await?;
        current.offset += frame.len() as u64;

        Ok(AppendResult {
            file: current.filename.clone(),
            offset,
        })
    }

    /// Write the termination sentinel and refuse further appends.
    ///
    /// Idempotent: a second call leaves exactly one sentinel on disk.
    pub async fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        if let Some(current) = &self.current {
            self.fs
                .append_file(&current.path, &codec::TERMINATION_SENTINEL)
                .await?;
        }
        self.finalized = true;
        Ok(())
    }

    /// Finalize the current file, fire the rotate hook, start a fresh file.
    async fn rotate(&mut self) -> Result<()> {
        let finalized_file = {
            let current = self.current.as_ref().expect("rotate without current file");
            self.fs
                .append_file(&current.path, &codec::TERMINATION_SENTINEL)
                .await?;
            current.filename.clone()
        };
        log::debug!(
            "[LogWriter] rotated {} for instance {}",
            finalized_file,
            self.instance_id
        );

        if let Some(hook) = &self.rotate_hook {
            hook(RotateEvent {
                finalized_file: finalized_file.clone(),
            })
            .await;
        }

        self.create_file().await
    }

    /// Find a resumable file or create a fresh one.
    async fn initialize(&mut self) -> Result<()> {
        self.fs.create_dir_all(&self.logs_dir).await?;

        let mut candidates: Vec<ParsedFileName> = Vec::new();
        for path in self.fs.list_files(&self.logs_dir).await? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(parsed) = ParsedFileName::parse(name, LOG_EXTENSION) {
                if parsed.matches_instance(&self.instance_id) {
                    candidates.push(parsed);
                }
            }
        }
        candidates.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));

        for parsed in candidates {
            let path = self.logs_dir.join(&parsed.filename);
            let bytes = match self.fs.read_file(&path).await {
                Ok(b) => b,
                Err(_) => continue,
            };
            let Some(offset) = Self::scan_resume_offset(&bytes) else {
                continue;
            };
            if offset >= self.config.rotation_size_bytes {
                continue;
            }
            if (offset as usize) < bytes.len() {
                // Crash left a partial trailing record; truncate so the next
                // append overwrites it.
                self.fs.write_file(&path, &bytes[..offset as usize]).await?;
                log::warn!(
                    "[LogWriter] truncated partial record in {} at offset {}",
                    parsed.filename,
                    offset
                );
            }
            log::debug!(
                "[LogWriter] resuming {} at offset {}",
                parsed.filename,
                offset
            );
            self.current = Some(CurrentFile {
                filename: parsed.filename,
                path,
                offset,
            });
            return Ok(());
        }

        self.create_file().await
    }

    /// Walk a file's frames using only length prefixes. Returns the offset
    /// where appends may resume, or `None` if the file is finalized or its
    /// header is unreadable.
    fn scan_resume_offset(bytes: &[u8]) -> Option<u64> {
        codec::read_log_header(bytes).ok()?;
        let mut pos = codec::LOG_HEADER_LEN;
        loop {
            if pos >= bytes.len() {
                return Some(pos as u64);
            }
            match codec::decode_varint(bytes, pos) {
                Ok((0, _)) => return None, // sentinel: file is finalized
                Ok((payload_len, prefix_len)) => {
                    let end = (pos + prefix_len).checked_add(payload_len as usize);
                    match end {
                        Some(end) if end <= bytes.len() => pos = end,
                        // Incomplete trailing record from a prior crash.
                        _ => return Some(pos as u64),
                    }
                }
                // A broken varint reads as end-of-file.
                Err(_) => return Some(pos as u64),
            }
        }
    }

    /// Create a new log file with a unique creation timestamp and write its
    /// header.
    async fn create_file(&mut self) -> Result<()> {
        let mut timestamp = chrono::Utc::now().timestamp_millis();
        let (filename, path) = loop {
            let filename = format!("{}_{}.{}", self.instance_id, timestamp, LOG_EXTENSION);
            let path = self.logs_dir.join(&filename);
            if !self.fs.exists(&path).await {
                break (filename, path);
            }
            timestamp += 1;
        };

        let mut header = Vec::with_capacity(codec::LOG_HEADER_LEN);
        codec::write_log_header(&mut header);
        self.fs.write_file(&path, &header).await?;

        log::debug!("[LogWriter] created {}", filename);
        self.current = Some(CurrentFile {
            filename,
            path,
            offset: codec::LOG_HEADER_LEN as u64,
        });
        Ok(())
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("instance_id", &self.instance_id)
            .field("current_file", &self.current_file())
            .field("current_offset", &self.current_offset())
            .field("finalized", &self.finalized)
            .finish()
    }
}
