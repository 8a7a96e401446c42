use thiserror::Error;

/// Unified error type for driftnote storage operations.
///
/// Most variants exist because the engine reads files written by peer
/// instances through an eventually-consistent file-sync service: a file can
/// be absent, partially delivered, or mid-rewrite at any moment, and those
/// conditions are recoverable by waiting rather than fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    /// General error for any kind of I/O issue not otherwise documented here.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record or file was cut short.
    ///
    /// This is the signal the activity-sync layer retries on: cloud sync may
    /// deliver a partial file that completes on a later poll.
    #[error("Truncated {0}")]
    Truncated(&'static str),

    /// The file's magic bytes did not match the expected format.
    #[error("Bad magic: expected {expected:?}, found {found:?}")]
    BadMagic {
        /// The magic bytes the reader expected
        expected: [u8; 4],
        /// The bytes actually found at the start of the file
        found: [u8; 4],
    },

    /// The file carries a format version this build does not understand.
    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u8),

    /// A snapshot status byte outside {0x00, 0x01}.
    #[error("Bad snapshot status byte 0x{0:02x}")]
    BadStatus(u8),

    /// Attempted to varint-encode a negative integer.
    #[error("Cannot encode negative value {0}")]
    Negative(i64),

    /// A varint decode would exceed the 64-bit value range.
    #[error("Varint overflow")]
    Overflow,

    /// A varint's continuation bit was set at the end of the buffer.
    #[error("Incomplete varint")]
    Incomplete,

    /// Append after the log writer was finalized. Programming error.
    #[error("Log writer is finalized")]
    Finalized,

    /// An update's sequence was not exactly previous+1 for its instance.
    #[error("Sequence violation for {instance_id}: expected {expected}, got {got}")]
    SequenceViolation {
        /// Instance whose update stream is out of order
        instance_id: String,
        /// The sequence the document expected next
        expected: u64,
        /// The sequence actually supplied
        got: u64,
    },

    /// Another live instance holds the profile lock.
    #[error("Profile lock held by live pid {pid}")]
    LockHeld {
        /// Pid recorded in the lock file
        pid: i32,
    },

    /// A bounded retry schedule was exhausted. Non-fatal; the work is
    /// re-attempted on a later cycle.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Sync-state cache (SQLite) error.
    #[error("Cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    /// JSON (de)serialization error (vector clocks, lock files, profiles).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error surfaced by the CRDT library while applying or encoding.
    #[error("CRDT error: {0}")]
    Crdt(String),
}

/// Result type alias for driftnote storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Whether waiting and retrying may resolve this error.
    ///
    /// True for truncation (a file still being delivered by cloud sync) and
    /// for missing files (the activity log can sync ahead of the CRDT log it
    /// refers to). Foreign errors are matched on message as a fallback, since
    /// collaborator implementations may only expose strings.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Truncated(_) | StoreError::Incomplete => true,
            StoreError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            other => {
                let msg = other.to_string();
                msg.contains("ENOENT")
                    || msg.contains("does not exist")
                    || msg.contains("incomplete")
                    || msg.contains("still being written")
                    || msg.contains("Truncated record")
                    || msg.contains("Truncated header")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_is_retryable() {
        assert!(StoreError::Truncated("record").is_retryable());
        assert!(StoreError::Truncated("header").is_retryable());
    }

    #[test]
    fn not_found_is_retryable() {
        let err = StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "ENOENT: no such file",
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn bad_magic_is_not_retryable() {
        let err = StoreError::BadMagic {
            expected: *b"NCLG",
            found: *b"XXXX",
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn finalized_is_not_retryable() {
        assert!(!StoreError::Finalized.is_retryable());
    }
}
