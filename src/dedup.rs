//! Cross-source signature deduplication.
//!
//! Redundant endpoints deliver the same events; the signature cache
//! guarantees each signature is emitted at most once within a sliding
//! window across all sources. Keys are raw signature bytes; no textual
//! encoding happens on the hot path.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::DedupConfig;
use crate::event::EndpointId;

/// Sweep cadence for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Occupancy ratio (percent) above which a sweep bulk-evicts.
const BULK_EVICT_OCCUPANCY_PCT: usize = 80;

/// Share of entries (percent) removed by a bulk evict.
const BULK_EVICT_SHARE_PCT: usize = 10;

/// Result of checking a signature against the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sighting within the window; the entry was recorded.
    FirstSeen,
    /// Seen recently; `original_source` delivered the first copy.
    Duplicate { original_source: EndpointId },
}

struct SeenEntry {
    first_seen_at: Instant,
    source: EndpointId,
}

/// Bounded, TTL-evicting map from signature bytes to first sighting.
///
/// Thread-safe; each check-and-insert is atomic per key. Sizes read by
/// [`len`](Self::len) may be momentarily stale.
pub struct SignatureCache {
    entries: DashMap<Vec<u8>, SeenEntry>,
    window: Duration,
    max_entries: usize,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SignatureCache {
    #[must_use]
    pub fn new(config: &DedupConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            window: Duration::from_millis(config.window_ms),
            max_entries: config.max_entries,
            sweeper: Mutex::new(None),
        })
    }

    /// Check whether `key` was seen within the window and record it if not.
    ///
    /// Present and fresh: returns the original source, mutates nothing.
    /// Present but expired: the stale entry is replaced. Absent: recorded.
    pub fn check_and_insert(&self, key: &[u8], source: &EndpointId) -> DedupOutcome {
        let now = Instant::now();

        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.evict_oldest();
        }

        match self.entries.entry(key.to_vec()) {
            Entry::Occupied(mut occupied) => {
                let age = now.duration_since(occupied.get().first_seen_at);
                if age < self.window {
                    return DedupOutcome::Duplicate {
                        original_source: occupied.get().source.clone(),
                    };
                }
                occupied.insert(SeenEntry {
                    first_seen_at: now,
                    source: source.clone(),
                });
                DedupOutcome::FirstSeen
            }
            Entry::Vacant(vacant) => {
                vacant.insert(SeenEntry {
                    first_seen_at: now,
                    source: source.clone(),
                });
                DedupOutcome::FirstSeen
            }
        }
    }

    /// Start the background sweeper. Idempotent.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut guard = self.sweeper.lock();
        if guard.is_some() {
            return;
        }
        let cache = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                cache.sweep();
            }
        }));
    }

    /// Stop the background sweeper. The cache itself remains usable.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Current entry count. May lag concurrent writers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove expired entries; bulk-evict the oldest tenth when the cache
    /// is still nearly full afterwards.
    fn sweep(&self) {
        let now = Instant::now();
        let window = self.window;
        self.entries
            .retain(|_, entry| now.duration_since(entry.first_seen_at) < window);

        let occupancy_floor = self.max_entries * BULK_EVICT_OCCUPANCY_PCT / 100;
        if self.entries.len() >= occupancy_floor {
            let evict = (self.entries.len() * BULK_EVICT_SHARE_PCT / 100).max(1);
            debug!(
                size = self.entries.len(),
                evict, "Cache nearly full after sweep, bulk evicting"
            );
            self.evict_n_oldest(evict);
        }
    }

    fn evict_oldest(&self) {
        self.evict_n_oldest(1);
    }

    fn evict_n_oldest(&self, n: usize) {
        let mut entries: Vec<(Vec<u8>, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().first_seen_at))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1));
        for (key, _) in entries.into_iter().take(n) {
            self.entries.remove(&key);
        }
    }
}

impl Drop for SignatureCache {
    fn drop(&mut self) {
        self.stop();
    }
}
