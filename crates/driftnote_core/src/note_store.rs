//! Note storage manager: loading, merging, and writing note documents.
//!
//! One `NoteStore` per process coordinates every note across every sync
//! directory the instance has open. It owns the per-note sequence counters
//! and the per-note write gates that serialize appends — at most one append
//! per `(sdId, noteId)` is in flight, and appends resolve in call order.
//! Writes to different notes proceed in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{NoteSyncCache, NoteSyncState};
use crate::crdt::{CrdtDoc, CrdtFactory};
use crate::error::{Result, StoreError};
use crate::fs::{BoxFuture, StorageFs};
use crate::log_reader::{list_log_files, read_records};
use crate::log_writer::{LogWriter, LogWriterConfig, RotateEvent};
use crate::snapshot::find_best_snapshot;
use crate::types::{writer_key_matches, ClockEntry, VectorClock};

/// Filesystem locations of one note's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotePaths {
    /// Directory holding the note's `.crdtlog` files.
    pub logs: PathBuf,
    /// Directory holding the note's `.snapshot` files.
    pub snapshots: PathBuf,
}

/// A loaded note document and the clock of everything merged into it.
pub struct LoadedNote {
    /// The reconstructed CRDT document.
    pub doc: Box<dyn CrdtDoc>,
    /// How far into each writer's logs the document has absorbed.
    pub vector_clock: VectorClock,
}

impl std::fmt::Debug for LoadedNote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedNote")
            .field("vector_clock", &self.vector_clock)
            .finish()
    }
}

/// Where a saved update landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveResult {
    /// Sequence assigned to the update.
    pub sequence: u64,
    /// Byte offset of the record in its file.
    pub offset: u64,
    /// Basename of the log file written to.
    pub file: String,
}

/// Hook invoked when a note's log file rotates; the application uses it to
/// cut a snapshot covering the finalized file.
pub type NoteRotateHook =
    Arc<dyn Fn(String, String, RotateEvent) -> BoxFuture<'static, ()> + Send + Sync>;

struct NoteState {
    /// Serializes appends; also guards lazy writer creation.
    write_gate: tokio::sync::Mutex<Option<LogWriter>>,
    /// Highest sequence this instance has written for the note.
    counter: AtomicU64,
}

/// Per-process manager of note documents.
pub struct NoteStore {
    fs: Arc<dyn StorageFs>,
    crdt: Arc<dyn CrdtFactory>,
    cache: Option<Arc<dyn NoteSyncCache>>,
    instance_id: String,
    writer_config: LogWriterConfig,
    rotate_hook: Option<NoteRotateHook>,
    notes: Mutex<HashMap<(String, String), Arc<NoteState>>>,
}

impl NoteStore {
    /// Create a store for one instance.
    pub fn new(
        fs: Arc<dyn StorageFs>,
        crdt: Arc<dyn CrdtFactory>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            fs,
            crdt,
            cache: None,
            instance_id: instance_id.into(),
            writer_config: LogWriterConfig::default(),
            rotate_hook: None,
            notes: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the sync-state cache used by the fast load path.
    pub fn with_cache(mut self, cache: Arc<dyn NoteSyncCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Override the log writer configuration (rotation threshold).
    pub fn with_writer_config(mut self, config: LogWriterConfig) -> Self {
        self.writer_config = config;
        self
    }

    /// Install the rotation hook applied to every note's writer.
    pub fn set_rotate_hook(&mut self, hook: NoteRotateHook) {
        self.rotate_hook = Some(hook);
    }

    /// The instance id this store writes under.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Highest sequence this instance has written for a note, 0 if none.
    pub fn current_sequence(&self, sd_id: &str, note_id: &str) -> u64 {
        self.note_state(sd_id, note_id).counter.load(Ordering::SeqCst)
    }

    /// Load a note from scratch: best complete snapshot plus every log
    /// record past it.
    ///
    /// Also re-seeds the note's sequence counter from the merged clock, so
    /// an instance restarted with a stable id never re-issues sequence 1.
    pub async fn load_note(
        &self,
        sd_id: &str,
        note_id: &str,
        paths: &NotePaths,
    ) -> Result<LoadedNote> {
        let mut doc = self.crdt.new_doc();
        let mut clock = VectorClock::new();

        if let Some((info, snapshot)) = find_best_snapshot(self.fs.as_ref(), &paths.snapshots).await?
        {
            doc.apply_update(&snapshot.state)?;
            clock = snapshot.vector_clock;
            log::debug!(
                "[NoteStore] {} loaded from snapshot {}",
                note_id,
                info.filename
            );
        }

        merge_logs(self.fs.as_ref(), doc.as_mut(), &mut clock, &paths.logs).await?;
        self.seed_counter(sd_id, note_id, &clock);

        Ok(LoadedNote {
            doc,
            vector_clock: clock,
        })
    }

    /// Fast load path: start from the cached state, then merge anything
    /// written since the cache row. `None` when no row exists.
    pub async fn load_note_from_cache(
        &self,
        sd_id: &str,
        note_id: &str,
        paths: &NotePaths,
    ) -> Result<Option<LoadedNote>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        let Some(row) = cache.get_note_sync_state(note_id, sd_id)? else {
            return Ok(None);
        };

        let mut doc = self.crdt.new_doc();
        doc.apply_update(&row.document_state)?;
        let mut clock = VectorClock::from_json(&row.vector_clock_json)?;

        merge_logs(self.fs.as_ref(), doc.as_mut(), &mut clock, &paths.logs).await?;
        self.seed_counter(sd_id, note_id, &clock);

        Ok(Some(LoadedNote {
            doc,
            vector_clock: clock,
        }))
    }

    /// Append one update for a note, assigning the next sequence.
    ///
    /// Appends for the same `(sdId, noteId)` serialize through the note's
    /// write gate; the pre-write counter is the canonical "next sequence"
    /// source.
    pub async fn save_update(
        &self,
        sd_id: &str,
        note_id: &str,
        paths: &NotePaths,
        data: &[u8],
    ) -> Result<SaveResult> {
        let state = self.note_state(sd_id, note_id);
        let mut writer_slot = state.write_gate.lock().await;

        if writer_slot.is_none() {
            let mut writer = LogWriter::new(
                self.fs.clone(),
                paths.logs.clone(),
                self.instance_id.clone(),
                self.writer_config.clone(),
            );
            if let Some(hook) = &self.rotate_hook {
                let hook = hook.clone();
                let sd = sd_id.to_string();
                let note = note_id.to_string();
                writer.set_rotate_hook(Arc::new(move |event| {
                    hook(sd.clone(), note.clone(), event)
                }));
            }
            *writer_slot = Some(writer);
        }
        let writer = writer_slot.as_mut().expect("writer created above");

        let sequence = state.counter.load(Ordering::SeqCst) + 1;
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let appended = writer.append_record(timestamp_ms, sequence, data).await?;
        state.counter.store(sequence, Ordering::SeqCst);

        Ok(SaveResult {
            sequence,
            offset: appended.offset,
            file: appended.file,
        })
    }

    /// Upsert the note's row in the sync-state cache. A store without a
    /// cache treats this as a no-op.
    pub async fn save_db_snapshot(
        &self,
        note_id: &str,
        sd_id: &str,
        clock: &VectorClock,
        state: &[u8],
    ) -> Result<()> {
        let Some(cache) = &self.cache else {
            log::debug!("[NoteStore] no cache attached, skipping db snapshot");
            return Ok(());
        };
        cache.upsert_note_sync_state(&NoteSyncState {
            note_id: note_id.to_string(),
            sd_id: sd_id.to_string(),
            vector_clock_json: clock.to_json()?,
            document_state: state.to_vec(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Finalize every open log writer (write sentinels). Clean-shutdown path.
    pub async fn finalize(&self) -> Result<()> {
        let states: Vec<Arc<NoteState>> = {
            let notes = self.notes.lock().unwrap();
            notes.values().cloned().collect()
        };
        for state in states {
            let mut writer_slot = state.write_gate.lock().await;
            if let Some(writer) = writer_slot.as_mut() {
                writer.finalize().await?;
            }
        }
        Ok(())
    }

    fn note_state(&self, sd_id: &str, note_id: &str) -> Arc<NoteState> {
        let mut notes = self.notes.lock().unwrap();
        notes
            .entry((sd_id.to_string(), note_id.to_string()))
            .or_insert_with(|| {
                Arc::new(NoteState {
                    write_gate: tokio::sync::Mutex::new(None),
                    counter: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Raise (never lower) the note's counter to the merged clock's highest
    /// sequence for this instance.
    fn seed_counter(&self, sd_id: &str, note_id: &str, clock: &VectorClock) {
        let own_sequence = clock
            .iter()
            .filter(|(key, _)| writer_key_matches(key, &self.instance_id))
            .map(|(_, entry)| entry.sequence)
            .max()
            .unwrap_or(0);

        let state = self.note_state(sd_id, note_id);
        state.counter.fetch_max(own_sequence, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for NoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteStore")
            .field("instance_id", &self.instance_id)
            .field("notes", &self.notes.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

/// Merge every log record not yet covered by `clock` into `doc`.
///
/// Files are consulted in listing order; the clock decides per file whether
/// to skip it (fully covered), resume mid-file at a stored offset, or read
/// from the header. [`StoreError::Truncated`] is re-raised so the activity
/// sync layer can retry with backoff; any other per-file failure only aborts
/// that file's contribution.
pub async fn merge_logs(
    fs: &dyn StorageFs,
    doc: &mut dyn CrdtDoc,
    clock: &mut VectorClock,
    logs_dir: &Path,
) -> Result<()> {
    for file in list_log_files(fs, logs_dir).await? {
        let known = clock.get(&file.instance_id).cloned();

        let (start_offset, start_sequence) = match &known {
            Some(entry) if file.filename == entry.file => (Some(entry.offset), entry.sequence),
            Some(entry) if file.filename.as_str() <= entry.file.as_str() => continue,
            _ => (None, 0),
        };

        let records = match read_records(fs, &file.path, start_offset).await {
            Ok(records) => records,
            Err(e @ StoreError::Truncated(_)) => return Err(e),
            Err(e) => {
                log::warn!(
                    "[NoteStore] skipping unreadable log {}: {}",
                    file.filename,
                    e
                );
                continue;
            }
        };

        let mut max_sequence = start_sequence;
        let mut last_offset = start_offset.unwrap_or(0);
        let mut applied_any = false;

        for record in records {
            if record.sequence <= start_sequence {
                continue;
            }
            if let Err(e) = doc.apply_update(&record.data) {
                log::warn!(
                    "[NoteStore] bad update in {} at offset {}: {}",
                    file.filename,
                    record.offset,
                    e
                );
                break;
            }
            max_sequence = max_sequence.max(record.sequence);
            last_offset = record.offset + record.bytes_read as u64;
            applied_any = true;
        }

        if applied_any {
            clock.set(
                file.instance_id.clone(),
                ClockEntry {
                    sequence: max_sequence,
                    offset: last_offset,
                    file: file.filename.clone(),
                },
            );
        }
    }
    Ok(())
}
