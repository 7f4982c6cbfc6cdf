//! In-memory sliding window store.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::backend::WindowBackend;
use super::identity::IdentityKey;
use crate::error::StoreError;

/// Request timestamps for every known identity, pruned to one window.
///
/// Each bucket is only touched while its shard lock is held, so an increment
/// (prune, append, count) is atomic per key even on a multi-threaded runtime.
pub struct WindowStore {
    /// Length of the sliding window
    window: Duration,
    /// Upper bound on tracked keys, `None` for unbounded
    max_keys: Option<usize>,
    /// Arrival instants per key, oldest first
    buckets: DashMap<IdentityKey, VecDeque<Instant>>,
}

impl WindowStore {
    /// Create an unbounded store with the given window length.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            max_keys: None,
            buckets: DashMap::new(),
        }
    }

    /// Refuse to create buckets once `max_keys` identities are tracked.
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = Some(max_keys);
        self
    }

    /// Get the window length of this store.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a request for `key` now and return the live count.
    pub fn increment(&self, key: &IdentityKey) -> Result<u64, StoreError> {
        // Checked before taking the entry lock: DashMap::len locks every shard.
        // Concurrent first requests may overshoot the bound by a few keys.
        if let Some(capacity) = self.max_keys {
            if !self.buckets.contains_key(key) {
                let tracked = self.buckets.len();
                if tracked >= capacity {
                    return Err(StoreError::CapacityExceeded { tracked, capacity });
                }
            }
        }

        let now = Instant::now();
        let count = match self.buckets.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let bucket = entry.get_mut();
                prune(bucket, now, self.window);
                bucket.push_back(now);
                bucket.len()
            }
            Entry::Vacant(entry) => {
                entry.insert(VecDeque::from([now]));
                1
            }
        };

        trace!(key = %key, count = count, "Incremented window bucket");
        Ok(count as u64)
    }

    /// Drop the bucket for `key`.
    pub fn reset(&self, key: &IdentityKey) {
        if self.buckets.remove(key).is_some() {
            debug!(key = %key, "Reset window bucket");
        }
    }

    /// Prune every bucket and delete the empty ones.
    ///
    /// Returns the number of keys removed. Each entry is judged by its own
    /// timestamp against the instant the sweep started, so requests recorded
    /// while the sweep runs are never dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.buckets.retain(|_, bucket| {
            prune(bucket, now, self.window);
            let keep = !bucket.is_empty();
            if !keep {
                removed += 1;
            }
            keep
        });

        removed
    }

    /// Whether a bucket currently exists for `key`.
    pub fn has(&self, key: &IdentityKey) -> bool {
        self.buckets.contains_key(key)
    }

    /// Live count for `key` without recording a request.
    pub fn count(&self, key: &IdentityKey) -> u64 {
        let now = Instant::now();
        self.buckets
            .get(key)
            .map(|bucket| live_len(&bucket, now, self.window))
            .unwrap_or(0)
    }

    /// Get the number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    /// Live counts for every tracked key.
    pub fn snapshot(&self) -> Vec<(IdentityKey, u64)> {
        let now = Instant::now();
        self.buckets
            .iter()
            .map(|entry| (entry.key().clone(), live_len(entry.value(), now, self.window)))
            .collect()
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference, so it also ends once the store
    /// itself is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> Sweeper {
        let store: Weak<WindowStore> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.sweep();
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = store.key_count(),
                        "Swept expired window buckets"
                    );
                }
            }
        });

        debug!(interval_ms = every.as_millis() as u64, "Window sweeper started");
        Sweeper {
            handle: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait]
impl WindowBackend for WindowStore {
    async fn increment(&self, key: &IdentityKey) -> Result<u64, StoreError> {
        WindowStore::increment(self, key)
    }

    async fn reset(&self, key: &IdentityKey) -> Result<(), StoreError> {
        WindowStore::reset(self, key);
        Ok(())
    }

    fn snapshot(&self) -> Vec<(IdentityKey, u64)> {
        WindowStore::snapshot(self)
    }
}

/// Handle to a running sweep task. Closing or dropping it stops the timer.
pub struct Sweeper {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Stop the sweep task. Safe to call more than once.
    pub fn close(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            debug!("Window sweeper stopped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.handle.lock().is_none()
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.close();
    }
}

fn expired(at: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(at) >= window
}

fn prune(bucket: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while bucket.front().is_some_and(|at| expired(*at, now, window)) {
        bucket.pop_front();
    }
}

fn live_len(bucket: &VecDeque<Instant>, now: Instant, window: Duration) -> u64 {
    bucket.iter().filter(|at| !expired(**at, now, window)).count() as u64
}
