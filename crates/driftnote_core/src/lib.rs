#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Per-instance activity and deletion logs
pub mod activity_log;

/// Cross-instance propagation via peers' activity logs
pub mod activity_sync;

/// Note sync-state cache (SQLite / memory backends)
pub mod cache;

/// Binary codec for log and snapshot files
pub mod codec;

/// CRDT library collaborator interface (yrs-backed)
pub mod crdt;

/// Error (common error types)
pub mod error;

/// Filesystem abstraction
pub mod fs;

/// Sync-directory layout, identity, and the profile lock
pub mod layout;

/// Stateless `.crdtlog` reading
pub mod log_reader;

/// Append-only `.crdtlog` writing with rotation
pub mod log_writer;

/// Note storage manager: load, merge, save
pub mod note_store;

/// Priority- and rate-aware poll scheduler
pub mod polling;

/// Startup crash recovery and storage hygiene
pub mod recovery;

/// Snapshot files and the two-phase write protocol
pub mod snapshot;

/// Core data types (vector clocks, records, file names)
pub mod types;

pub use activity_log::{ActivityLogger, DeletionLogger};
pub use activity_sync::{ActivitySync, ActivitySyncConfig, StaleEntry, SyncDelegate};
pub use cache::{MemoryNoteCache, NoteSyncCache, NoteSyncState, SqliteNoteCache};
pub use crdt::{CrdtDoc, CrdtFactory, YrsCrdt};
pub use error::{Result, StoreError};
pub use fs::{MemoryFs, NativeFs, StorageFs};
pub use layout::{ProfileLock, SdKind, SyncDir};
pub use log_writer::{LogWriter, LogWriterConfig};
pub use note_store::{LoadedNote, NotePaths, NoteStore, SaveResult};
pub use polling::{PollEntry, PollInput, PollPriority, PollReason, PollingConfig, PollingGroup};
pub use snapshot::DocumentSnapshot;
pub use types::{ClockEntry, VectorClock};
