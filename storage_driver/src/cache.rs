//! Time-bounded cache of presigned download URLs.
//!
//! Entries are never refreshed on read: a presigned URL stops working at a
//! fixed time no matter how often it is handed out, so the cache TTL is
//! counted from insertion only. The TTL must be shorter than the signature
//! validity so an entry is gone before its link lapses.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use tokio::{sync::OnceCell, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// How long a signed download link stays valid (24h).
pub const URL_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// How often expired entries are swept (5m).
pub const SWEEP_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Cache TTL: one sweep period short of the link validity.
pub const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60 - 5 * 60);

pub const CACHE_CAPACITY: usize = 1000;

/// A presigned GET URL and the time it stops working.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUrl {
    pub url: Url,
    pub expiry: SystemTime,
}

type InFlight = Arc<OnceCell<Option<PresignedUrl>>>;

struct CacheEntry {
    value: PresignedUrl,
    inserted_at: Instant,
}

/// A signing call shared by every caller that missed on one key.
#[derive(Default)]
struct InFlightSlot {
    cell: InFlight,
    waiters: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashMap<String, InFlightSlot>,
}

impl CacheState {
    fn fresh(&self, key: &str, ttl: Duration) -> Option<PresignedUrl> {
        self.entries
            .get(key)
            .filter(|entry| entry.inserted_at.elapsed() < ttl)
            .map(|entry| entry.value.clone())
    }

    fn sweep(&mut self, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        before - self.entries.len()
    }
}

/// Bounded TTL cache from storage key to [`PresignedUrl`].
///
/// When full, inserting a new key evicts the earliest inserted entry.
pub struct PresignedUrlCache {
    state: Arc<Mutex<CacheState>>,
    capacity: usize,
    ttl: Duration,
    sweeper: CancellationToken,
}

impl PresignedUrlCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            capacity,
            ttl,
            sweeper: CancellationToken::new(),
        }
    }

    /// Cache with the reference capacity and TTL.
    pub fn with_defaults() -> Self {
        Self::new(CACHE_CAPACITY, CACHE_TTL)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the background task evicting expired entries every `period`.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, period: Duration) {
        let state = Arc::clone(&self.state);
        let ttl = self.ttl;
        let shutdown = self.sweeper.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = state
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .sweep(ttl);
                        if evicted > 0 {
                            debug!(evicted, "swept expired presigned urls");
                        }
                    }
                }
            }
        });
    }

    /// Stops the sweeper task.
    pub fn stop(&self) {
        self.sweeper.cancel();
    }

    /// Returns the cached URL for `key` without touching its TTL.
    pub fn peek(&self, key: &str) -> Option<PresignedUrl> {
        self.lock().fresh(key, self.ttl)
    }

    pub fn insert(&self, key: &str, value: PresignedUrl) {
        let mut state = self.lock();
        if !state.entries.contains_key(key) && state.entries.len() >= self.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                state.entries.remove(&oldest);
            }
        }
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Removes every entry older than the TTL, returning how many went.
    pub fn sweep_expired(&self) -> usize {
        self.lock().sweep(self.ttl)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached URL for `key`, or runs `sign` and caches its
    /// result.
    ///
    /// Concurrent misses on one key share a single `sign` call. The cache
    /// lock is released before `sign` runs. A `None` from `sign` is handed
    /// to the callers waiting on it but not cached, so the next miss signs
    /// again. Dropping the returned future gives up this caller's wait; the
    /// shared slot is released once its last waiter is gone.
    pub async fn get_or_sign<F, Fut>(&self, key: &str, sign: F) -> Option<PresignedUrl>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<PresignedUrl>>,
    {
        let cell = {
            let mut state = self.lock();
            if let Some(hit) = state.fresh(key, self.ttl) {
                return Some(hit);
            }
            let slot = state.in_flight.entry(key.to_string()).or_default();
            slot.waiters += 1;
            Arc::clone(&slot.cell)
        };
        let _waiter = Waiter {
            cache: self,
            key,
            cell: &cell,
        };

        let signed = cell
            .get_or_init(|| async {
                let signed = sign().await;
                if let Some(url) = &signed {
                    self.insert(key, url.clone());
                }
                signed
            })
            .await
            .clone();
        signed
    }

    #[cfg(test)]
    pub(crate) fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }
}

/// Registration of one caller on an [`InFlightSlot`], undone on drop so
/// cancelled callers do not leave slots behind.
struct Waiter<'a> {
    cache: &'a PresignedUrlCache,
    key: &'a str,
    cell: &'a InFlight,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let mut state = self.cache.lock();
        let Some(slot) = state.in_flight.get_mut(self.key) else {
            return;
        };
        if !Arc::ptr_eq(&slot.cell, self.cell) {
            return;
        }
        slot.waiters -= 1;
        if slot.waiters == 0 || slot.cell.initialized() {
            state.in_flight.remove(self.key);
        }
    }
}

impl Drop for PresignedUrlCache {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}
