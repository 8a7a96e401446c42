//! Cross-instance propagation: observing peers' activity logs.
//!
//! Each cycle reads every peer's `activity/{instanceId}.log`, finds lines it
//! has not yet considered (a per-peer line-count watermark), and triggers a
//! reload of the named notes. Because the activity log and the CRDT log it
//! refers to travel independently through cloud sync, a reload is retried
//! with exponential backoff until the referenced record materializes.
//!
//! Entries that fall impossibly far behind a peer's current maximum are
//! classified as stale (their CRDT files are presumed lost), surfaced for
//! the user, and skippable; our own stale lines can be self-healed.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::activity_log::{complete_lines, parse_activity_line, ActivityLine};
use crate::error::Result;
use crate::fs::{BoxFuture, StorageFs};

/// Callbacks the activity sync drives. One vtable per application.
pub trait SyncDelegate: Send + Sync {
    /// Reload a note from disk and replace the canonical in-memory document.
    fn reload_note<'a>(&'a self, note_id: &'a str, sd_id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Notes currently held in memory (candidates for a full rescan).
    fn loaded_notes<'a>(&'a self) -> BoxFuture<'a, Vec<String>>;

    /// Whether any log file from `instance_id` for this note already holds a
    /// record with sequence ≥ `expected_sequence`. Eliminates the race where
    /// the activity log syncs before the CRDT log.
    fn crdt_log_exists<'a>(
        &'a self,
        note_id: &'a str,
        instance_id: &'a str,
        expected_sequence: u64,
    ) -> BoxFuture<'a, bool>;

    /// Whether the note's directory still exists (not permanently deleted).
    fn note_exists<'a>(&'a self, note_id: &'a str) -> BoxFuture<'a, bool>;
}

/// Configuration for [`ActivitySync`].
#[derive(Debug, Clone)]
pub struct ActivitySyncConfig {
    /// An entry more than this many sequences behind its peer's maximum is
    /// stale. A gap exactly at the threshold is not stale.
    pub stale_gap_threshold: u64,
    /// Backoff schedule for the poll-and-reload loop, milliseconds.
    pub backoff_delays_ms: Vec<u64>,
}

impl Default for ActivitySyncConfig {
    fn default() -> Self {
        Self {
            stale_gap_threshold: 50,
            backoff_delays_ms: vec![100, 200, 500, 1000, 2000, 3000, 5000, 7000, 10000, 15000],
        }
    }
}

/// An activity entry presumed lost: the peer has moved far past it but the
/// CRDT log it references never arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleEntry {
    /// Note the entry refers to.
    pub note_id: String,
    /// Peer that wrote the entry.
    pub instance_id: String,
    /// Sequence the entry announced.
    pub expected_sequence: u64,
    /// The peer's highest sequence on disk at detection time.
    pub highest_sequence_from_instance: u64,
    /// `highest_sequence_from_instance - expected_sequence`.
    pub gap: u64,
    /// Detection time, ms since the Unix epoch.
    pub detected_at: i64,
}

/// The furthest (peer, sequence) a note must be synced to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingTarget {
    instance_id: String,
    sequence: u64,
}

#[derive(Default)]
struct SyncState {
    /// Complete lines of each peer's file already fully considered.
    last_seen_line_count: HashMap<String, usize>,
    /// Furthest pending sync target per note.
    highest_pending: HashMap<String, PendingTarget>,
    /// Notes with an in-flight sync chain.
    in_flight: HashSet<String>,
    /// Stale entries awaiting user attention, one per (note, peer).
    stale_entries: Vec<StaleEntry>,
    /// `"noteId:instanceId"` pairs the user chose to skip.
    skipped: HashSet<String>,
}

struct Inner {
    fs: Arc<dyn StorageFs>,
    delegate: Arc<dyn SyncDelegate>,
    activity_dir: PathBuf,
    own_instance: String,
    sd_id: String,
    config: ActivitySyncConfig,
    state: Mutex<SyncState>,
    chain_count: tokio::sync::watch::Sender<usize>,
}

/// Observes peers' activity logs and keeps local documents caught up.
///
/// Cheap to clone; clones share all state, including in-flight sync chains.
#[derive(Clone)]
pub struct ActivitySync {
    inner: Arc<Inner>,
}

fn skip_key(note_id: &str, instance_id: &str) -> String {
    format!("{note_id}:{instance_id}")
}

impl ActivitySync {
    /// Create an activity sync for one sync directory.
    pub fn new(
        fs: Arc<dyn StorageFs>,
        delegate: Arc<dyn SyncDelegate>,
        activity_dir: PathBuf,
        own_instance: impl Into<String>,
        sd_id: impl Into<String>,
        config: ActivitySyncConfig,
    ) -> Self {
        let (chain_count, _) = tokio::sync::watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                fs,
                delegate,
                activity_dir,
                own_instance: own_instance.into(),
                sd_id: sd_id.into(),
                config,
                state: Mutex::new(SyncState::default()),
                chain_count,
            }),
        }
    }

    /// Run one sync cycle over every peer's activity log.
    ///
    /// Intended to be called every few seconds and on demand. One unreadable
    /// peer file does not affect syncing from other peers.
    pub async fn sync_cycle(&self) -> Result<()> {
        let inner = &self.inner;
        let paths = inner.fs.list_files(&inner.activity_dir).await?;
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(peer) = name.strip_suffix(".log") else {
                continue;
            };
            if peer == inner.own_instance {
                continue;
            }

            let content = match inner.fs.read_file(&path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    log::warn!("[ActivitySync] cannot read {}: {}", path.display(), e);
                    continue;
                }
            };
            let lines = complete_lines(&content);

            if inner.detect_shrink(peer, lines.len()) {
                log::warn!(
                    "[ActivitySync] {} shrank, assuming compaction; running full scan",
                    name
                );
                inner.full_scan().await;
                continue;
            }

            for note_id in inner.process_peer_lines(peer, &lines) {
                let chain_inner = Arc::clone(inner);
                tokio::spawn(async move {
                    chain_inner.run_sync_chain(note_id).await;
                });
            }
        }
        Ok(())
    }

    /// Reload every loaded note, ignoring per-note errors. Used when a
    /// peer's log was compacted and entries may have been missed. Returns
    /// the notes successfully reloaded.
    pub async fn full_scan(&self) -> Vec<String> {
        self.inner.full_scan().await
    }

    /// Self-heal our own activity log: drop lines so far behind our own
    /// highest sequence that their CRDT files evidently never materialized.
    ///
    /// Idempotent — a second back-to-back run cleans nothing. Intended for
    /// startup or a schedule.
    pub async fn cleanup_own_stale_entries(&self) -> Result<Vec<ActivityLine>> {
        self.inner.cleanup_own_stale_entries().await
    }

    /// Join all in-flight sync chains. The application calls this before
    /// emitting "document changed" events so peer updates land before the
    /// UI refreshes.
    pub async fn wait_for_pending_syncs(&self) {
        let mut rx = self.inner.chain_count.subscribe();
        loop {
            if *rx.borrow() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stale entries detected so far, for the UI.
    pub fn stale_entries(&self) -> Vec<StaleEntry> {
        self.inner.state.lock().unwrap().stale_entries.clone()
    }

    /// User override: stop waiting for a (note, peer) pair and let its
    /// watermark advance.
    pub fn skip_entry(&self, note_id: &str, instance_id: &str) {
        let mut state = self.inner.state.lock().unwrap();
        state.skipped.insert(skip_key(note_id, instance_id));
        state
            .stale_entries
            .retain(|e| !(e.note_id == note_id && e.instance_id == instance_id));
    }

    #[cfg(test)]
    fn watermark(&self, peer: &str) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .last_seen_line_count
            .get(peer)
            .copied()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for ActivitySync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("ActivitySync")
            .field("own_instance", &self.inner.own_instance)
            .field("peers_seen", &state.last_seen_line_count.len())
            .field("in_flight", &state.in_flight.len())
            .field("stale_entries", &state.stale_entries.len())
            .finish()
    }
}

impl Inner {
    /// Compaction detection: fewer complete lines than the watermark means
    /// entries may have been missed. Resets the watermark when shrunk.
    fn detect_shrink(&self, peer: &str, line_count: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        let last_seen = state.last_seen_line_count.get(peer).copied().unwrap_or(0);
        if line_count < last_seen && last_seen > 0 {
            state.last_seen_line_count.insert(peer.to_string(), line_count);
            return true;
        }
        false
    }

    /// Two passes over a peer's lines: find the peer's highest on-disk
    /// sequence, then classify and enqueue only the lines past the
    /// watermark. Returns the notes that need a sync chain spawned.
    fn process_peer_lines(&self, peer: &str, lines: &[&str]) -> Vec<String> {
        let highest = lines
            .iter()
            .filter_map(|l| parse_activity_line(l))
            .map(|l| l.sequence)
            .max()
            .unwrap_or(0);

        let mut chains_to_spawn = Vec::new();
        let mut state = self.state.lock().unwrap();
        let last_seen = state.last_seen_line_count.get(peer).copied().unwrap_or(0);
        let now_ms = chrono::Utc::now().timestamp_millis();

        for line in &lines[last_seen.min(lines.len())..] {
            let Some(parsed) = parse_activity_line(line) else {
                continue;
            };

            let gap = highest.saturating_sub(parsed.sequence);
            if gap > self.config.stale_gap_threshold {
                let key = skip_key(&parsed.note_id, &parsed.instance_id);
                if state.skipped.contains(&key) {
                    continue;
                }
                let already_known = state
                    .stale_entries
                    .iter()
                    .any(|e| e.note_id == parsed.note_id && e.instance_id == parsed.instance_id);
                if !already_known {
                    log::warn!(
                        "[ActivitySync] stale entry {}@{} (gap {} behind {})",
                        parsed.note_id,
                        parsed.sequence,
                        gap,
                        highest
                    );
                    state.stale_entries.push(StaleEntry {
                        note_id: parsed.note_id.clone(),
                        instance_id: parsed.instance_id.clone(),
                        expected_sequence: parsed.sequence,
                        highest_sequence_from_instance: highest,
                        gap,
                        detected_at: now_ms,
                    });
                }
                continue;
            }

            let bump = state
                .highest_pending
                .get(&parsed.note_id)
                .is_none_or(|t| parsed.sequence > t.sequence);
            if bump {
                state.highest_pending.insert(
                    parsed.note_id.clone(),
                    PendingTarget {
                        instance_id: parsed.instance_id.clone(),
                        sequence: parsed.sequence,
                    },
                );
            }
            if state.in_flight.insert(parsed.note_id.clone()) {
                chains_to_spawn.push(parsed.note_id.clone());
            }
        }

        // Eagerly advanced: the chains' polling handles the wait for CRDT
        // files still propagating.
        state.last_seen_line_count.insert(peer.to_string(), lines.len());
        self.chain_count.send_replace(state.in_flight.len());
        chains_to_spawn
    }

    /// A note's single in-flight chain: keep pulling the furthest pending
    /// target and polling until no higher target appears.
    async fn run_sync_chain(self: Arc<Self>, note_id: String) {
        loop {
            while let Some(target) = self.take_pending(&note_id) {
                // Success or failure, the chain moves on; failures are
                // re-observed on later cycles.
                let _ = self.poll_and_reload(&note_id, &target).await;
            }

            let mut state = self.state.lock().unwrap();
            if state.highest_pending.contains_key(&note_id) {
                continue;
            }
            state.in_flight.remove(&note_id);
            self.chain_count.send_replace(state.in_flight.len());
            return;
        }
    }

    fn take_pending(&self, note_id: &str) -> Option<PendingTarget> {
        let mut state = self.state.lock().unwrap();
        state.highest_pending.remove(note_id)
    }

    fn is_skipped(&self, note_id: &str, instance_id: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.skipped.contains(&skip_key(note_id, instance_id))
    }

    /// Poll until the target's CRDT record is on disk, then reload the note.
    ///
    /// Returns `true` when the note is caught up or the target no longer
    /// matters (skipped by the user, note deleted); `false` on a
    /// non-retryable failure or an exhausted schedule.
    async fn poll_and_reload(&self, note_id: &str, target: &PendingTarget) -> bool {
        if self.is_skipped(note_id, &target.instance_id) {
            return true;
        }
        if !self.delegate.note_exists(note_id).await {
            log::debug!(
                "[ActivitySync] {} no longer exists, advancing past it",
                note_id
            );
            return true;
        }

        for &delay_ms in &self.config.backoff_delays_ms {
            // The user may skip mid-retry.
            if self.is_skipped(note_id, &target.instance_id) {
                return true;
            }

            let present = self
                .delegate
                .crdt_log_exists(note_id, &target.instance_id, target.sequence)
                .await;
            if !present {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                continue;
            }

            match self.delegate.reload_note(note_id, &self.sd_id).await {
                Ok(()) => {
                    log::debug!(
                        "[ActivitySync] reloaded {} up to {}@{}",
                        note_id,
                        target.instance_id,
                        target.sequence
                    );
                    return true;
                }
                Err(e) if e.is_retryable() => {
                    log::debug!("[ActivitySync] reload of {} not ready: {}", note_id, e);
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
                Err(e) => {
                    log::error!("[ActivitySync] reload of {} failed: {}", note_id, e);
                    return false;
                }
            }
        }

        log::warn!(
            "[ActivitySync] timed out waiting for {}@{} of {}; will retry next cycle",
            target.instance_id,
            target.sequence,
            note_id
        );
        false
    }

    async fn full_scan(&self) -> Vec<String> {
        let mut reloaded = Vec::new();
        for note_id in self.delegate.loaded_notes().await {
            match self.delegate.reload_note(&note_id, &self.sd_id).await {
                Ok(()) => reloaded.push(note_id),
                Err(e) => {
                    log::warn!("[ActivitySync] full-scan reload of {} failed: {}", note_id, e)
                }
            }
        }
        reloaded
    }

    async fn cleanup_own_stale_entries(&self) -> Result<Vec<ActivityLine>> {
        let path = self.activity_dir.join(format!("{}.log", self.own_instance));
        let content = match self.fs.read_file(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lines = complete_lines(&content);

        let highest = lines
            .iter()
            .filter_map(|l| parse_activity_line(l))
            .map(|l| l.sequence)
            .max()
            .unwrap_or(0);

        let mut cleaned = Vec::new();
        let mut kept = Vec::new();
        for line in &lines {
            match parse_activity_line(line) {
                Some(parsed)
                    if highest.saturating_sub(parsed.sequence)
                        > self.config.stale_gap_threshold =>
                {
                    cleaned.push(parsed);
                }
                _ => kept.push(*line),
            }
        }

        if cleaned.is_empty() {
            return Ok(cleaned);
        }

        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        self.fs.write_file(&path, rewritten.as_bytes()).await?;
        log::info!(
            "[ActivitySync] cleaned {} stale entries from own activity log",
            cleaned.len()
        );
        Ok(cleaned)
    }
}
