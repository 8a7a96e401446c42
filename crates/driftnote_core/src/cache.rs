//! Sync-state cache: the fast-load starting point for notes.
//!
//! One compact row per `(noteId, sdId)` holds the last computed document
//! state and its vector clock, so reopening a note only replays the log tail
//! written since the row. Backends: SQLite for the application, memory for
//! tests. Rows are written only by the owning instance.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

/// One cached note row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteSyncState {
    /// Note identifier.
    pub note_id: String,
    /// Sync-directory identifier the row belongs to.
    pub sd_id: String,
    /// JSON-serialized vector clock of the cached state.
    pub vector_clock_json: String,
    /// Encoded CRDT document state.
    pub document_state: Vec<u8>,
    /// Row write time, ms since the Unix epoch.
    pub updated_at: i64,
}

/// Storage backend for note sync state.
pub trait NoteSyncCache: Send + Sync {
    /// Fetch the row for a note, if any.
    fn get_note_sync_state(&self, note_id: &str, sd_id: &str) -> Result<Option<NoteSyncState>>;

    /// Insert or replace the row for a note.
    fn upsert_note_sync_state(&self, row: &NoteSyncState) -> Result<()>;
}

/// Schema version stamped into new cache databases.
const SCHEMA_VERSION: i64 = 1;

/// SQLite-backed sync-state cache.
///
/// The connection is wrapped in a `Mutex` for thread-safe access; SQLite
/// itself runs in serialized threading mode.
pub struct SqliteNoteCache {
    conn: Mutex<Connection>,
}

impl SqliteNoteCache {
    /// Open or create a cache database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    /// Create an in-memory cache for testing. Data is lost on drop.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS note_sync_state (
                note_id TEXT NOT NULL,
                sd_id TEXT NOT NULL,
                vector_clock TEXT NOT NULL,
                document_state BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (note_id, sd_id)
            );

            CREATE TABLE IF NOT EXISTS schema_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            "#,
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    /// The schema version recorded in this database.
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )?)
    }
}

impl std::fmt::Debug for SqliteNoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteNoteCache").finish_non_exhaustive()
    }
}

impl NoteSyncCache for SqliteNoteCache {
    fn get_note_sync_state(&self, note_id: &str, sd_id: &str) -> Result<Option<NoteSyncState>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT vector_clock, document_state, updated_at
                 FROM note_sync_state WHERE note_id = ? AND sd_id = ?",
                params![note_id, sd_id],
                |row| {
                    Ok(NoteSyncState {
                        note_id: note_id.to_string(),
                        sd_id: sd_id.to_string(),
                        vector_clock_json: row.get(0)?,
                        document_state: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn upsert_note_sync_state(&self, row: &NoteSyncState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO note_sync_state
             (note_id, sd_id, vector_clock, document_state, updated_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                row.note_id,
                row.sd_id,
                row.vector_clock_json,
                row.document_state,
                row.updated_at
            ],
        )?;
        Ok(())
    }
}

/// In-memory sync-state cache for tests.
#[derive(Default)]
pub struct MemoryNoteCache {
    rows: Mutex<std::collections::HashMap<(String, String), NoteSyncState>>,
}

impl MemoryNoteCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl NoteSyncCache for MemoryNoteCache {
    fn get_note_sync_state(&self, note_id: &str, sd_id: &str) -> Result<Option<NoteSyncState>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(&(note_id.to_string(), sd_id.to_string())).cloned())
    }

    fn upsert_note_sync_state(&self, row: &NoteSyncState) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        rows.insert((row.note_id.clone(), row.sd_id.clone()), row.clone());
        Ok(())
    }
}
