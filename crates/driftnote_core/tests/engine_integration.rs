//! Integration tests: multiple instances sharing one sync directory.
//!
//! Each test wires real components (note store, snapshot writer, activity
//! logger/sync) over a shared in-memory filesystem, simulating several
//! application instances whose files propagate through a cloud-synced tree.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use driftnote_core::activity_log::ActivityLogger;
use driftnote_core::activity_sync::{ActivitySync, ActivitySyncConfig, SyncDelegate};
use driftnote_core::crdt::{CrdtFactory, YrsCrdt};
use driftnote_core::fs::{BoxFuture, MemoryFs, StorageFs};
use driftnote_core::log_reader::{list_log_files, read_records};
use driftnote_core::recovery;
use driftnote_core::snapshot;
use driftnote_core::types::ParsedFileName;
use driftnote_core::{NotePaths, NoteStore, Result, SyncDir};

use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

const NOTE: &str = "note-1";

fn note_paths(sd: &SyncDir) -> NotePaths {
    NotePaths {
        logs: sd.note_logs_dir(NOTE),
        snapshots: sd.note_snapshots_dir(NOTE),
    }
}

fn store(fs: &Arc<MemoryFs>, instance: &str) -> NoteStore {
    NoteStore::new(fs.clone(), Arc::new(YrsCrdt::new()), instance)
}

/// Append `text` to the end of a document currently holding `state`,
/// returning the incremental update bytes.
fn edit_update(state: &[u8], text: &str) -> Vec<u8> {
    let doc = Doc::new();
    let body = doc.get_or_insert_text("body");
    if !state.is_empty() {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
    }
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let len = body.get_string(&txn).chars().count() as u32;
        body.insert(&mut txn, len, text);
    }
    let txn = doc.transact();
    txn.encode_diff_v1(&before)
}

fn read_body(state: &[u8]) -> String {
    let doc = Doc::new();
    let body = doc.get_or_insert_text("body");
    let mut txn = doc.transact_mut();
    txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
    drop(txn);
    let txn = doc.transact();
    body.get_string(&txn)
}

#[tokio::test]
async fn snapshot_plus_peer_log_merge() {
    let fs = Arc::new(MemoryFs::new());
    let sd = SyncDir::new("sd");
    let paths = note_paths(&sd);

    // Instance A seeds the note and cuts a complete snapshot.
    let store_a = store(&fs, "inst-a");
    let update = edit_update(&[], "Initial");
    store_a.save_update("sd1", NOTE, &paths, &update).await.unwrap();
    let loaded_a = store_a.load_note("sd1", NOTE, &paths).await.unwrap();
    snapshot::write_snapshot(
        fs.as_ref(),
        &paths.snapshots,
        "inst-a",
        &loaded_a.vector_clock,
        &loaded_a.doc.encode_state(),
    )
    .await
    .unwrap();

    // Instance B applies the snapshot and appends to its own log.
    let store_b = store(&fs, "inst-b");
    let loaded_b = store_b.load_note("sd1", NOTE, &paths).await.unwrap();
    assert_eq!(read_body(&loaded_b.doc.encode_state()), "Initial");
    let update_b = edit_update(&loaded_b.doc.encode_state(), " + More");
    store_b.save_update("sd1", NOTE, &paths, &update_b).await.unwrap();

    // A third instance reconstructs the document from both sources.
    let store_c = store(&fs, "inst-c");
    let loaded_c = store_c.load_note("sd1", NOTE, &paths).await.unwrap();
    assert_eq!(read_body(&loaded_c.doc.encode_state()), "Initial + More");
    assert_eq!(loaded_c.vector_clock.sequence_of("inst-a"), 1);
    assert_eq!(loaded_c.vector_clock.sequence_of("inst-b"), 1);
}

#[tokio::test]
async fn crash_recovery_prunes_and_reconstructs() {
    let fs = Arc::new(MemoryFs::new());
    let sd = SyncDir::new("sd");
    let paths = note_paths(&sd);

    let store_a = store(&fs, "inst-a");
    let mut state = Vec::new();
    for step in ["one", " two", " three"] {
        let update = edit_update(&state, step);
        store_a.save_update("sd1", NOTE, &paths, &update).await.unwrap();
        let loaded = store_a.load_note("sd1", NOTE, &paths).await.unwrap();
        state = loaded.doc.encode_state();
    }

    // A complete snapshot, then a crash mid-way through a newer one.
    let loaded = store_a.load_note("sd1", NOTE, &paths).await.unwrap();
    snapshot::write_snapshot(
        fs.as_ref(),
        &paths.snapshots,
        "inst-a",
        &loaded.vector_clock,
        &loaded.doc.encode_state(),
    )
    .await
    .unwrap();
    let crashed = driftnote_core::codec::create_snapshot_file(
        &loaded.vector_clock,
        &loaded.doc.encode_state(),
        false,
    );
    fs.write_file(&paths.snapshots.join("inst-a_9999999999999.snapshot"), &crashed)
        .await
        .unwrap();

    let deleted = recovery::cleanup_incomplete_snapshots(fs.as_ref(), &paths.snapshots)
        .await
        .unwrap();
    assert_eq!(deleted, vec!["inst-a_9999999999999.snapshot"]);

    let (doc, clock) = recovery::recover_document(
        fs.as_ref(),
        &YrsCrdt::new(),
        &paths.snapshots,
        &paths.logs,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(read_body(&doc.encode_state()), "one two three");
    assert_eq!(clock.sequence_of("inst-a"), 3);
}

/// Delegate backed by a real [`NoteStore`] over the shared filesystem.
struct StoreDelegate {
    fs: Arc<MemoryFs>,
    store: NoteStore,
    sd: SyncDir,
    /// Latest reloaded state per note, for assertions.
    reloaded: Mutex<HashMap<String, Vec<u8>>>,
}

impl SyncDelegate for StoreDelegate {
    fn reload_note<'a>(&'a self, note_id: &'a str, sd_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let paths = NotePaths {
                logs: self.sd.note_logs_dir(note_id),
                snapshots: self.sd.note_snapshots_dir(note_id),
            };
            let loaded = self.store.load_note(sd_id, note_id, &paths).await?;
            self.reloaded
                .lock()
                .unwrap()
                .insert(note_id.to_string(), loaded.doc.encode_state());
            Ok(())
        })
    }

    fn loaded_notes<'a>(&'a self) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move { self.reloaded.lock().unwrap().keys().cloned().collect() })
    }

    fn crdt_log_exists<'a>(
        &'a self,
        note_id: &'a str,
        instance_id: &'a str,
        expected_sequence: u64,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let logs_dir = self.sd.note_logs_dir(note_id);
            let Ok(files) = list_log_files(self.fs.as_ref(), &logs_dir).await else {
                return false;
            };
            for file in files {
                let parsed = ParsedFileName::parse(&file.filename, "crdtlog");
                if !parsed.is_some_and(|p| p.matches_instance(instance_id)) {
                    continue;
                }
                let Ok(records) = read_records(self.fs.as_ref(), &file.path, None).await else {
                    continue;
                };
                if records.iter().any(|r| r.sequence >= expected_sequence) {
                    return true;
                }
            }
            false
        })
    }

    fn note_exists<'a>(&'a self, note_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.fs.exists(&self.sd.note_logs_dir(note_id)).await })
    }
}

#[tokio::test]
async fn activity_log_drives_peer_reload() {
    let fs = Arc::new(MemoryFs::new());
    let sd = SyncDir::new("sd");
    let paths = note_paths(&sd);

    // Instance A writes two updates and announces them.
    let store_a = store(&fs, "inst-a");
    let logger_a = ActivityLogger::new(fs.clone(), sd.activity_dir(), "inst-a");
    let mut state = Vec::new();
    for step in ["Hello", " peer"] {
        let update = edit_update(&state, step);
        let saved = store_a.save_update("sd1", NOTE, &paths, &update).await.unwrap();
        logger_a
            .record_note_activity(NOTE, saved.sequence)
            .await
            .unwrap();
        let loaded = store_a.load_note("sd1", NOTE, &paths).await.unwrap();
        state = loaded.doc.encode_state();
    }

    // Instance B discovers the writes through A's activity log.
    let delegate = Arc::new(StoreDelegate {
        fs: fs.clone(),
        store: store(&fs, "inst-b"),
        sd: SyncDir::new("sd"),
        reloaded: Mutex::new(HashMap::new()),
    });
    let sync = ActivitySync::new(
        fs.clone(),
        delegate.clone(),
        sd.activity_dir(),
        "inst-b",
        "sd1",
        ActivitySyncConfig::default(),
    );
    sync.sync_cycle().await.unwrap();
    sync.wait_for_pending_syncs().await;

    let reloaded = delegate.reloaded.lock().unwrap();
    let body = read_body(reloaded.get(NOTE).expect("note reloaded"));
    assert_eq!(body, "Hello peer");
}

#[tokio::test]
async fn rotation_finalizes_and_recovery_prunes_covered_logs() {
    let fs = Arc::new(MemoryFs::new());
    let sd = SyncDir::new("sd");
    let paths = note_paths(&sd);

    // Tiny rotation threshold: every update lands in its own file.
    let store_a = NoteStore::new(fs.clone(), Arc::new(YrsCrdt::new()), "inst-a")
        .with_writer_config(driftnote_core::LogWriterConfig {
            rotation_size_bytes: 64,
        });

    let mut state = Vec::new();
    for step in ["alpha ", "beta ", "gamma"] {
        let update = edit_update(&state, step);
        store_a.save_update("sd1", NOTE, &paths, &update).await.unwrap();
        let loaded = store_a.load_note("sd1", NOTE, &paths).await.unwrap();
        state = loaded.doc.encode_state();
    }
    let files = list_log_files(fs.as_ref(), &paths.logs).await.unwrap();
    assert!(files.len() >= 2, "rotation should have split the log");

    // Snapshot the fully merged state, then prune covered logs.
    let loaded = store_a.load_note("sd1", NOTE, &paths).await.unwrap();
    assert_eq!(read_body(&loaded.doc.encode_state()), "alpha beta gamma");
    snapshot::write_snapshot(
        fs.as_ref(),
        &paths.snapshots,
        "inst-a",
        &loaded.vector_clock,
        &loaded.doc.encode_state(),
    )
    .await
    .unwrap();
    recovery::prune_logs(fs.as_ref(), &paths.logs, &loaded.vector_clock)
        .await
        .unwrap();

    // Only files at or past the watermark remain, and a fresh instance
    // still reconstructs the full document.
    let remaining = list_log_files(fs.as_ref(), &paths.logs).await.unwrap();
    assert!(remaining.len() < files.len());
    let store_b = store(&fs, "inst-b");
    let loaded_b = store_b.load_note("sd1", NOTE, &paths).await.unwrap();
    assert_eq!(read_body(&loaded_b.doc.encode_state()), "alpha beta gamma");
}

#[tokio::test]
async fn finalize_terminates_open_logs() {
    let fs = Arc::new(MemoryFs::new());
    let sd = SyncDir::new("sd");
    let paths = note_paths(&sd);

    let store_a = store(&fs, "inst-a");
    let update = edit_update(&[], "bye");
    store_a.save_update("sd1", NOTE, &paths, &update).await.unwrap();
    store_a.finalize().await.unwrap();

    let files = list_log_files(fs.as_ref(), &paths.logs).await.unwrap();
    let bytes = fs.read_file(Path::new(&files[0].path)).await.unwrap();
    assert_eq!(*bytes.last().unwrap(), 0x00);

    // A restarted instance starts a new file rather than resuming.
    let store_a2 = store(&fs, "inst-a");
    store_a2.load_note("sd1", NOTE, &paths).await.unwrap();
    let update2 = edit_update(&[], "again");
    let saved = store_a2
        .save_update("sd1", NOTE, &paths, &update2)
        .await
        .unwrap();
    assert_eq!(saved.sequence, 2);
    assert_ne!(saved.file, files[0].filename);
}
