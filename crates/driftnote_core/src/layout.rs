//! Sync-directory layout, identity, and the profile lock.
//!
//! A sync directory (SD) is the filesystem tree holding one profile's data,
//! shared between devices by a third-party file-sync service. This module
//! owns the path schema, the persistent `SD_ID`, the `SD-TYPE` marker, and
//! the `profile.lock` guarding one-live-instance-per-SD on a single machine.
//!
//! Older SDs may lack optional directories (`activity/`, `profiles/`,
//! `media/`, `packs/`); everything here tolerates their absence on read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::fs::StorageFs;

const SD_ID_FILE: &str = "SD_ID";
const SD_TYPE_FILE: &str = "SD-TYPE";
const LOCK_FILE: &str = "profile.lock";

/// Whether an SD belongs to a development or production profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdKind {
    /// Development data.
    Dev,
    /// Production data.
    Prod,
}

impl SdKind {
    /// Marker-file spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            SdKind::Dev => "dev",
            SdKind::Prod => "prod",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "dev" => Some(SdKind::Dev),
            "prod" => Some(SdKind::Prod),
            _ => None,
        }
    }
}

/// Path schema of one sync directory.
#[derive(Debug, Clone)]
pub struct SyncDir {
    root: PathBuf,
}

impl SyncDir {
    /// Wrap an SD root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The SD root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{SD}/notes/{noteId}` — one note's directory.
    pub fn note_dir(&self, note_id: &str) -> PathBuf {
        self.root.join("notes").join(note_id)
    }

    /// `{SD}/notes/{noteId}/logs`.
    pub fn note_logs_dir(&self, note_id: &str) -> PathBuf {
        self.note_dir(note_id).join("logs")
    }

    /// `{SD}/notes/{noteId}/snapshots`.
    pub fn note_snapshots_dir(&self, note_id: &str) -> PathBuf {
        self.note_dir(note_id).join("snapshots")
    }

    /// `{SD}/activity` — per-instance activity logs.
    pub fn activity_dir(&self) -> PathBuf {
        self.root.join("activity")
    }

    /// `{SD}/activity/{instanceId}.log`.
    pub fn activity_log_path(&self, instance_id: &str) -> PathBuf {
        self.activity_dir().join(format!("{instance_id}.log"))
    }

    /// `{SD}/deletion` — per-instance deletion logs.
    pub fn deletion_dir(&self) -> PathBuf {
        self.root.join("deletion")
    }

    /// `{SD}/deletion/{instanceId}.log`.
    pub fn deletion_log_path(&self, instance_id: &str) -> PathBuf {
        self.deletion_dir().join(format!("{instance_id}.log"))
    }

    /// `{SD}/media/{contentHash}.{ext}` — content-addressed media.
    pub fn media_path(&self, content_hash: &str, ext: &str) -> PathBuf {
        self.root.join("media").join(format!("{content_hash}.{ext}"))
    }

    /// `{SD}/profiles/{profileId}.json`.
    pub fn profile_path(&self, profile_id: &str) -> PathBuf {
        self.root.join("profiles").join(format!("{profile_id}.json"))
    }

    /// Create the full directory layout (superset form).
    pub async fn ensure_layout(&self, fs: &dyn StorageFs) -> Result<()> {
        for dir in [
            self.root.join("notes"),
            self.activity_dir(),
            self.deletion_dir(),
            self.root.join("media"),
            self.root.join("profiles"),
            self.root.join("folders").join("updates"),
            self.root.join("folders").join("meta"),
        ] {
            fs.create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Create the per-note directory layout.
    pub async fn ensure_note_layout(&self, fs: &dyn StorageFs, note_id: &str) -> Result<()> {
        for dir in [
            self.note_logs_dir(note_id),
            self.note_snapshots_dir(note_id),
            self.note_dir(note_id).join("meta"),
            self.note_dir(note_id).join("packs"),
            self.note_dir(note_id).join("assets"),
        ] {
            fs.create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Read or establish this SD's persistent UUID.
    ///
    /// When the `SD_ID` file is missing a fresh UUID is written, then read
    /// back and adopted as-is — if two instances race, both converge on
    /// whichever write won. Read-back failure is retried twice before giving
    /// up.
    pub async fn initialize_uuid(&self, fs: &dyn StorageFs) -> Result<String> {
        let path = self.root.join(SD_ID_FILE);
        let mut last_err: Option<StoreError> = None;

        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            if let Ok(bytes) = fs.read_file(&path).await {
                let id = String::from_utf8_lossy(&bytes).trim().to_string();
                if !id.is_empty() {
                    return Ok(id);
                }
            }

            let candidate = uuid::Uuid::new_v4().to_string();
            if let Err(e) = fs.write_file(&path, candidate.as_bytes()).await {
                last_err = Some(e.into());
                continue;
            }

            // Re-read to reconcile a concurrent writer.
            match fs.read_file(&path).await {
                Ok(bytes) => {
                    let id = String::from_utf8_lossy(&bytes).trim().to_string();
                    if !id.is_empty() {
                        return Ok(id);
                    }
                    last_err = Some(StoreError::Truncated("SD_ID"));
                }
                Err(e) => last_err = Some(e.into()),
            }
        }

        Err(last_err.unwrap_or_else(|| StoreError::Truncated("SD_ID")))
    }

    /// Ensure the `SD-TYPE` marker exists, never overwriting an existing one.
    /// Returns the kind actually on disk.
    pub async fn ensure_marker(&self, fs: &dyn StorageFs, kind: SdKind) -> Result<SdKind> {
        let path = self.root.join(SD_TYPE_FILE);
        if let Ok(bytes) = fs.read_file(&path).await {
            if let Some(existing) = SdKind::parse(&String::from_utf8_lossy(&bytes)) {
                return Ok(existing);
            }
        }
        fs.write_file(&path, kind.as_str().as_bytes()).await?;
        Ok(kind)
    }
}

/// Payload of the `profile.lock` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Pid of the instance holding the lock.
    pub pid: i32,
    /// Acquisition time, ms since the Unix epoch.
    pub timestamp: i64,
}

/// Guard against two live instances opening the same SD on one machine.
///
/// A lock whose recorded pid is no longer alive is stale and taken over.
/// Scoped acquisition: acquire on startup, release on clean shutdown.
pub struct ProfileLock {
    fs: Arc<dyn StorageFs>,
    path: PathBuf,
    pid: i32,
    held: bool,
}

impl ProfileLock {
    /// Create a lock handle for an SD, using this process's pid.
    pub fn new(fs: Arc<dyn StorageFs>, sd: &SyncDir) -> Self {
        Self {
            fs,
            path: sd.root().join(LOCK_FILE),
            pid: std::process::id() as i32,
            held: false,
        }
    }

    /// Create a lock handle with an explicit pid (tests).
    pub fn with_pid(fs: Arc<dyn StorageFs>, sd: &SyncDir, pid: i32) -> Self {
        Self {
            fs,
            path: sd.root().join(LOCK_FILE),
            pid,
            held: false,
        }
    }

    /// Try to acquire the lock. Returns `false` when another live instance
    /// holds it; the caller decides what to tell the user.
    pub async fn acquire(&mut self) -> Result<bool> {
        if let Ok(bytes) = self.fs.read_file(&self.path).await {
            if let Ok(existing) = serde_json::from_slice::<LockInfo>(&bytes) {
                if existing.pid != self.pid && pid_alive(existing.pid) {
                    log::warn!(
                        "[ProfileLock] {} held by live pid {}",
                        self.path.display(),
                        existing.pid
                    );
                    return Ok(false);
                }
            }
            // Unparseable or stale: take over.
        }

        let info = LockInfo {
            pid: self.pid,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.fs
            .write_file(&self.path, &serde_json::to_vec(&info)?)
            .await?;
        self.held = true;
        Ok(true)
    }

    /// Release the lock if we hold it and the file is still ours.
    pub async fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        if let Ok(bytes) = self.fs.read_file(&self.path).await {
            if let Ok(existing) = serde_json::from_slice::<LockInfo>(&bytes) {
                if existing.pid == self.pid {
                    let _ = self.fs.delete_file(&self.path).await;
                }
            }
        }
        self.held = false;
        Ok(())
    }

    /// Whether this handle currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.held
    }
}

/// Liveness probe for the pid recorded in a lock file.
#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Without a signal probe every recorded pid is treated as stale, so a
/// crashed instance never locks the profile out permanently.
#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    false
}
