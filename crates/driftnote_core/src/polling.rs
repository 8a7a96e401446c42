//! Polling group: the tier-2 scheduler for peer polling.
//!
//! Notes whose in-line sync could not complete (and notes that simply need
//! periodic re-checking) are parked here. The group decides which
//! `(noteId, sdId)` pairs to poll next: two FIFO priority queues with
//! round-robin rotation, a rolling rate budget where hits are cheaper than
//! misses (so the scheduler accelerates while it keeps finding new data),
//! and per-reason exit criteria that bound every entry's lifetime except
//! the intentionally long-lived open/list reasons.

use std::collections::{HashMap, HashSet, VecDeque};

/// Why an entry is in the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollReason {
    /// An in-line sync attempt missed its deadline and handed the note off.
    FastPathHandoff,
    /// The note is open in an editor window.
    OpenNote,
    /// The note is visible in a notes list.
    NotesList,
    /// The note was edited locally moments ago.
    RecentEdit,
    /// Periodic safety-net repoll of everything.
    FullRepoll,
}

impl PollReason {
    /// Reasons that are high priority regardless of window state.
    fn is_intrinsically_high(self) -> bool {
        matches!(
            self,
            PollReason::OpenNote | PollReason::NotesList | PollReason::RecentEdit
        )
    }
}

/// Queue priority. Two-valued by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPriority {
    /// Served first, minus the normal-queue reserve.
    High,
    /// Served from the reserved share.
    Normal,
}

/// Configuration for [`PollingGroup`].
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Poll budget per rolling minute, counted in miss-equivalents.
    pub poll_rate_per_minute: f64,
    /// Cost of a hit relative to a miss. At 0.25, four hits spend one
    /// miss's budget, so sustained hitting polls up to ~4x the miss rate.
    pub hit_rate_multiplier: f64,
    /// Cap on any single batch, whatever the budget says.
    pub max_burst_per_second: usize,
    /// Share of each batch reserved for the normal queue when both queues
    /// have entries.
    pub normal_priority_reserve: f64,
    /// How long a `RecentEdit` entry stays eligible.
    pub recent_edit_window_ms: i64,
    /// Period of the safety-net full repoll. 0 disables.
    pub full_repoll_interval_ms: i64,
    /// Deadline after which an in-line sync hands off to the group.
    pub fast_path_max_delay_ms: i64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_rate_per_minute: 120.0,
            hit_rate_multiplier: 0.25,
            max_burst_per_second: 10,
            normal_priority_reserve: 0.2,
            recent_edit_window_ms: 300_000,
            full_repoll_interval_ms: 1_800_000,
            fast_path_max_delay_ms: 60_000,
        }
    }
}

/// One scheduled `(noteId, sdId)` pair.
#[derive(Debug, Clone)]
pub struct PollEntry {
    /// Note to poll.
    pub note_id: String,
    /// Sync directory the note lives in.
    pub sd_id: String,
    /// Per-peer sequences the poll is trying to observe.
    pub expected_sequences: HashMap<String, u64>,
    /// Peers whose expected sequence has been observed.
    pub caught_up_sequences: HashSet<String>,
    /// Insertion time, ms since the Unix epoch.
    pub added_at: i64,
    /// Last poll time, if any.
    pub last_polled_at: Option<i64>,
    /// Whether the entry has been polled at least once.
    pub has_been_polled: bool,
    /// Why the entry is here.
    pub reason: PollReason,
    /// Current queue.
    pub priority: PollPriority,
}

/// Input to [`PollingGroup::add`].
#[derive(Debug, Clone)]
pub struct PollInput {
    /// Note to poll.
    pub note_id: String,
    /// Sync directory the note lives in.
    pub sd_id: String,
    /// Why the entry is being added.
    pub reason: PollReason,
    /// Per-peer sequences the poll should observe.
    pub expected_sequences: HashMap<String, u64>,
}

type Key = (String, String);

/// Wall clock, injectable for tests.
type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

const RATE_WINDOW_MS: i64 = 60_000;

/// Persistent, priority-aware, rate-limited poll scheduler.
pub struct PollingGroup {
    config: PollingConfig,
    clock: Clock,
    entries: HashMap<Key, PollEntry>,
    high: VecDeque<Key>,
    normal: VecDeque<Key>,
    /// Rolling samples of recent polls: (time, was_hit).
    samples: VecDeque<(i64, bool)>,
    /// Per-window open-note sets; the effective set is their union.
    open_notes: HashMap<String, HashSet<String>>,
    /// Per-window list-visible-note sets.
    list_notes: HashMap<String, HashSet<String>>,
}

impl PollingGroup {
    /// Create a group with the wall clock.
    pub fn new(config: PollingConfig) -> Self {
        Self::with_clock(config, Box::new(|| chrono::Utc::now().timestamp_millis()))
    }

    /// Create a group with an injected clock (tests).
    pub fn with_clock(config: PollingConfig, clock: Clock) -> Self {
        Self {
            config,
            clock,
            entries: HashMap::new(),
            high: VecDeque::new(),
            normal: VecDeque::new(),
            samples: VecDeque::new(),
            open_notes: HashMap::new(),
            list_notes: HashMap::new(),
        }
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the group is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry.
    pub fn get(&self, note_id: &str, sd_id: &str) -> Option<&PollEntry> {
        self.entries.get(&key(note_id, sd_id))
    }

    /// Upsert an entry.
    ///
    /// On conflict the per-peer expected sequences merge taking the maximum,
    /// and the entry is upgraded to high priority if the new reason warrants
    /// it (never downgraded by an add).
    pub fn add(&mut self, input: PollInput) {
        let k = key(&input.note_id, &input.sd_id);
        let now = self.now();

        if let Some(entry) = self.entries.get_mut(&k) {
            for (peer, seq) in input.expected_sequences {
                let slot = entry.expected_sequences.entry(peer).or_insert(0);
                *slot = (*slot).max(seq);
            }
            if input.reason.is_intrinsically_high() && entry.priority == PollPriority::Normal {
                entry.priority = PollPriority::High;
                entry.reason = input.reason;
                move_key(&mut self.normal, &mut self.high, &k);
            }
            return;
        }

        let priority = if input.reason.is_intrinsically_high()
            || self.note_is_visible(&input.note_id)
        {
            PollPriority::High
        } else {
            PollPriority::Normal
        };
        match priority {
            PollPriority::High => self.high.push_back(k.clone()),
            PollPriority::Normal => self.normal.push_back(k.clone()),
        }
        self.entries.insert(
            k,
            PollEntry {
                note_id: input.note_id,
                sd_id: input.sd_id,
                expected_sequences: input.expected_sequences,
                caught_up_sequences: HashSet::new(),
                added_at: now,
                last_polled_at: None,
                has_been_polled: false,
                reason: input.reason,
                priority,
            },
        );
    }

    /// Remove an entry.
    pub fn remove(&mut self, note_id: &str, sd_id: &str) {
        let k = key(note_id, sd_id);
        if self.entries.remove(&k).is_some() {
            self.high.retain(|q| q != &k);
            self.normal.retain(|q| q != &k);
        }
    }

    /// Select the next batch of entries to poll, bounded by `max_count` and
    /// the current rate budget. Selected entries rotate to the tail of their
    /// queue for round-robin fairness.
    pub fn get_next_batch(&mut self, max_count: usize) -> Vec<PollEntry> {
        let available = self.available_capacity();
        let batch = max_count.min(available);
        if batch == 0 {
            return Vec::new();
        }

        let (high_take, normal_take) = if self.normal.is_empty() {
            (batch.min(self.high.len()), 0)
        } else if self.high.is_empty() {
            (0, batch.min(self.normal.len()))
        } else {
            let high_cap =
                (batch as f64 * (1.0 - self.config.normal_priority_reserve)).ceil() as usize;
            let high_take = high_cap.min(self.high.len());
            let normal_take = (batch - high_take).min(self.normal.len());
            // Unused normal share flows back to high.
            let high_take = (high_take + batch - high_take - normal_take).min(self.high.len());
            (high_take, normal_take)
        };

        let mut selected = Vec::with_capacity(high_take + normal_take);
        for _ in 0..high_take {
            if let Some(k) = self.high.pop_front() {
                if let Some(entry) = self.entries.get(&k) {
                    selected.push(entry.clone());
                }
                self.high.push_back(k);
            }
        }
        for _ in 0..normal_take {
            if let Some(k) = self.normal.pop_front() {
                if let Some(entry) = self.entries.get(&k) {
                    selected.push(entry.clone());
                }
                self.normal.push_back(k);
            }
        }
        selected
    }

    /// Record the outcome of a poll.
    pub fn mark_polled(&mut self, note_id: &str, sd_id: &str, was_hit: bool) {
        let now = self.now();
        if let Some(entry) = self.entries.get_mut(&key(note_id, sd_id)) {
            entry.last_polled_at = Some(now);
            entry.has_been_polled = true;
        }
        self.samples.push_back((now, was_hit));
        self.prune_samples(now);
    }

    /// Record the sequence actually observed from a peer; marks the peer
    /// caught up when it reaches the expectation.
    pub fn update_sequence(&mut self, note_id: &str, sd_id: &str, peer_id: &str, actual_seq: u64) {
        if let Some(entry) = self.entries.get_mut(&key(note_id, sd_id)) {
            if let Some(&expected) = entry.expected_sequences.get(peer_id) {
                if actual_seq >= expected {
                    entry.caught_up_sequences.insert(peer_id.to_string());
                }
            }
        }
    }

    /// Raise the expected sequence for a peer (never lowers).
    pub fn add_expected_sequence(&mut self, note_id: &str, sd_id: &str, peer_id: &str, seq: u64) {
        if let Some(entry) = self.entries.get_mut(&key(note_id, sd_id)) {
            let slot = entry
                .expected_sequences
                .entry(peer_id.to_string())
                .or_insert(0);
            *slot = (*slot).max(seq);
        }
    }

    /// Mark a peer caught up directly.
    pub fn mark_sequence_caught_up(&mut self, note_id: &str, sd_id: &str, peer_id: &str) {
        if let Some(entry) = self.entries.get_mut(&key(note_id, sd_id)) {
            entry.caught_up_sequences.insert(peer_id.to_string());
        }
    }

    /// Whether an entry has met its reason's exit criterion and may leave
    /// the group.
    pub fn check_exit_criteria(&self, note_id: &str, sd_id: &str) -> bool {
        let Some(entry) = self.entries.get(&key(note_id, sd_id)) else {
            return true;
        };
        match entry.reason {
            PollReason::FastPathHandoff => entry
                .expected_sequences
                .keys()
                .all(|peer| entry.caught_up_sequences.contains(peer)),
            PollReason::FullRepoll => entry.has_been_polled,
            PollReason::OpenNote => !self.note_is_open(&entry.note_id),
            PollReason::NotesList => !self.note_is_listed(&entry.note_id),
            PollReason::RecentEdit => {
                self.now() - entry.added_at > self.config.recent_edit_window_ms
            }
        }
    }

    /// Replace one window's open-note set and recompute priorities.
    pub fn set_window_open_notes(&mut self, window_id: &str, notes: HashSet<String>) {
        self.open_notes.insert(window_id.to_string(), notes);
        self.recompute_priorities();
    }

    /// Replace one window's list-visible-note set and recompute priorities.
    pub fn set_window_list_notes(&mut self, window_id: &str, notes: HashSet<String>) {
        self.list_notes.insert(window_id.to_string(), notes);
        self.recompute_priorities();
    }

    /// Drop a closed window's contribution and recompute priorities.
    pub fn close_window(&mut self, window_id: &str) {
        self.open_notes.remove(window_id);
        self.list_notes.remove(window_id);
        self.recompute_priorities();
    }

    fn note_is_open(&self, note_id: &str) -> bool {
        self.open_notes.values().any(|set| set.contains(note_id))
    }

    fn note_is_listed(&self, note_id: &str) -> bool {
        self.list_notes.values().any(|set| set.contains(note_id))
    }

    fn note_is_visible(&self, note_id: &str) -> bool {
        self.note_is_open(note_id) || self.note_is_listed(note_id)
    }

    /// Upgrade entries for newly visible notes; downgrade entries whose note
    /// is no longer visible unless their reason is intrinsically high.
    fn recompute_priorities(&mut self) {
        let mut moves = Vec::new();
        for (k, entry) in &self.entries {
            let should_be_high = entry.reason.is_intrinsically_high()
                || self.note_is_visible(&entry.note_id);
            let target = if should_be_high {
                PollPriority::High
            } else {
                PollPriority::Normal
            };
            if target != entry.priority {
                moves.push((k.clone(), target));
            }
        }
        for (k, target) in moves {
            if let Some(entry) = self.entries.get_mut(&k) {
                entry.priority = target;
            }
            match target {
                PollPriority::High => move_key(&mut self.normal, &mut self.high, &k),
                PollPriority::Normal => move_key(&mut self.high, &mut self.normal, &k),
            }
        }
    }

    /// Miss-equivalent poll cost spent inside the rolling window.
    fn effective_rate(&self) -> f64 {
        self.samples
            .iter()
            .map(|&(_, was_hit)| {
                if was_hit {
                    self.config.hit_rate_multiplier
                } else {
                    1.0
                }
            })
            .sum()
    }

    /// Polls available right now.
    fn available_capacity(&mut self) -> usize {
        let now = self.now();
        self.prune_samples(now);
        let remaining = (self.config.poll_rate_per_minute - self.effective_rate()).max(0.0);
        (remaining.floor() as usize).min(self.config.max_burst_per_second)
    }

    fn prune_samples(&mut self, now: i64) {
        while let Some(&(t, _)) = self.samples.front() {
            if now - t > RATE_WINDOW_MS {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl std::fmt::Debug for PollingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingGroup")
            .field("entries", &self.entries.len())
            .field("high", &self.high.len())
            .field("normal", &self.normal.len())
            .field("samples", &self.samples.len())
            .finish()
    }
}

fn key(note_id: &str, sd_id: &str) -> Key {
    (note_id.to_string(), sd_id.to_string())
}

fn move_key(from: &mut VecDeque<Key>, to: &mut VecDeque<Key>, k: &Key) {
    from.retain(|q| q != k);
    if !to.contains(k) {
        to.push_back(k.clone());
    }
}
