//! Bounded, TTL-expiring slot caches.
//!
//! Finalized blocks and committees are immutable, so entries never need
//! invalidation beyond the TTL; the inclusion-scan window overlaps across
//! batches and the same committee is consulted for both duty generation
//! and inclusion decoding, which is where the hit rate comes from.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use beacon_duty_watch_shared::eth_spec::Slot;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            ttl: Duration::from_secs(1800),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

struct Inner<V> {
    entries: HashMap<Slot, Entry<V>>,
    // insertion order for approximate-FIFO eviction; may hold keys whose
    // entry has already been swept
    order: VecDeque<Slot>,
}

pub struct SlotCache<V> {
    name: &'static str,
    config: CacheConfig,
    inner: Mutex<Inner<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> SlotCache<V> {
    pub fn new(name: &'static str, config: CacheConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Presence check without touching the hit/miss statistics.
    pub fn has(&self, slot: Slot) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .get(&slot)
            .is_some_and(|entry| entry.inserted_at.elapsed() < self.config.ttl)
    }

    pub fn get(&self, slot: Slot) -> Option<V> {
        let mut inner = self.inner.lock();
        match inner.entries.get(&slot) {
            Some(entry) if entry.inserted_at.elapsed() < self.config.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_expired) => {
                inner.entries.remove(&slot);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, slot: Slot, value: V) {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&slot) && inner.entries.len() >= self.config.max_entries {
            let target = (self.config.max_entries / 10).max(1);
            Self::evict_oldest(&mut inner, target);
        }
        inner.order.push_back(slot);
        inner.entries.insert(
            slot,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    fn evict_oldest(inner: &mut Inner<V>, target: usize) {
        let mut evicted = 0;
        while evicted < target {
            let Some(slot) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.remove(&slot).is_some() {
                evicted += 1;
            }
        }
    }

    /// Drops entries past the TTL; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let ttl = self.config.ttl;
        let before = inner.entries.len();
        inner.entries.retain(|_slot, entry| entry.inserted_at.elapsed() < ttl);
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Periodic TTL sweep; stops when the shutdown flag flips.
pub fn spawn_sweeper<V>(
    cache: Arc<SlotCache<V>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cache.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = cache.sweep();
                    if removed > 0 {
                        tracing::debug!(cache = cache.name(), removed, "Swept expired cache entries");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!(cache = cache.name(), "Stopping cache sweeper");
                        return;
                    }
                }
            }
        }
    })
}
