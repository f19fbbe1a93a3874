//! Identity-keyed enrichment cache with single-flight computation.
//!
//! Entries are addressed by filesystem identity (`dev`, `ino`) and validated
//! against a change fingerprint (`mtime`, `ctime`, `size`). A stored entry
//! whose fingerprint differs from the caller's is evicted as *invalid* before
//! anything is recomputed, so a value computed for an older generation of a
//! file is never returned for a newer one.
//!
//! Key responsibilities:
//! - Share one in-flight computation between concurrent callers of a key.
//! - Run the computation without holding any bucket lock.
//! - Bound memory: a fixed slot budget per bucket, least-recently-used
//!   eviction among finished entries, and an uncached fallback when every
//!   slot in the bucket is still being computed.

use crate::comms::events::FileStamp;
use crate::pipeline::buckets::{BucketGuard, Buckets, Occupancy};
use crate::pipeline::stats::CacheStats;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub mtime: Option<DateTime<Utc>>,
    pub ctime: Option<DateTime<Utc>>,
    pub size:  u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheKey {
    pub file: FileId,
    pub fp:   Fingerprint,
}

impl From<&FileStamp> for CacheKey {
    fn from(st: &FileStamp) -> Self {
        CacheKey {
            file: FileId { dev: st.dev, ino: st.ino },
            fp:   Fingerprint { mtime: st.mtime, ctime: st.ctime, size: st.size },
        }
    }
}

enum FlightState<V> {
    Running,
    Done(V),
    Abandoned,
}

struct Flight<V> {
    state: Mutex<FlightState<V>>,
    cv:    Condvar,
}

impl<V: Clone> Flight<V> {
    fn new() -> Self {
        Self { state: Mutex::new(FlightState::Running), cv: Condvar::new() }
    }

    fn finish(&self, outcome: FlightState<V>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
        self.cv.notify_all();
    }

    /// Block until the owner finishes. `None` if it gave up.
    fn wait(&self) -> Option<V> {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*st {
                FlightState::Running => {
                    st = self.cv.wait(st).unwrap_or_else(PoisonError::into_inner);
                }
                FlightState::Done(v) => return Some(v.clone()),
                FlightState::Abandoned => return None,
            }
        }
    }
}

enum Slot<V> {
    Ready { fp: Fingerprint, value: V, used: u64 },
    Pending { fp: Fingerprint, flight: Arc<Flight<V>> },
}

pub struct CacheBucket<V> {
    slots: HashMap<FileId, Slot<V>>,
}

impl<V> Occupancy for CacheBucket<V> {
    fn occupancy(&self) -> usize {
        self.slots.len()
    }
}

impl<V> CacheBucket<V> {
    /// Drop the least recently used finished entry. `false` if all are in flight.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .slots
            .iter()
            .filter_map(|(id, s)| match s {
                Slot::Ready { used, .. } => Some((*used, *id)),
                Slot::Pending { .. } => None,
            })
            .min()
            .map(|(_, id)| id);
        match victim {
            Some(id) => self.slots.remove(&id).is_some(),
            None => false,
        }
    }
}

pub struct IdentityCache<V> {
    name:       &'static str,
    buckets:    Buckets<CacheBucket<V>>,
    per_bucket: usize,
    clock:      AtomicU64,
    stats:      Arc<CacheStats>,
}

/// Owner side of a flight: on drop without `complete`, the slot is removed
/// and waiters are released to retry.
struct FlightOwner<'a, V: Clone> {
    cache:  &'a IdentityCache<V>,
    key:    CacheKey,
    flight: Arc<Flight<V>>,
    done:   bool,
}

impl<V: Clone> FlightOwner<'_, V> {
    fn complete(mut self, value: &V) {
        let mut b = self.cache.bucket(&self.key);
        if self.owns_slot(&b) {
            let used = self.cache.tick();
            b.slots.insert(self.key.file, Slot::Ready { fp: self.key.fp, value: value.clone(), used });
            self.cache.stats.puts.incr();
        }
        drop(b);
        self.flight.finish(FlightState::Done(value.clone()));
        self.done = true;
    }

    fn owns_slot(&self, b: &BucketGuard<'_, CacheBucket<V>>) -> bool {
        matches!(b.slots.get(&self.key.file),
            Some(Slot::Pending { flight, .. }) if Arc::ptr_eq(flight, &self.flight))
    }
}

impl<V: Clone> Drop for FlightOwner<'_, V> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut b = self.cache.bucket(&self.key);
        if self.owns_slot(&b) {
            b.slots.remove(&self.key.file);
        }
        drop(b);
        self.flight.finish(FlightState::Abandoned);
    }
}

impl<V: Clone> IdentityCache<V> {
    /// `capacity` slots spread over `buckets` buckets.
    pub fn new(name: &'static str, buckets: usize, capacity: usize, stats: Arc<CacheStats>) -> Self {
        let buckets = buckets.max(1);
        let per_bucket = capacity.div_ceil(buckets).max(1);
        Self {
            name,
            buckets: Buckets::new(buckets, |_| CacheBucket { slots: HashMap::new() }),
            per_bucket,
            clock: AtomicU64::new(0),
            stats,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.buckets.total_occupancy()
    }

    pub fn capacity(&self) -> usize {
        self.per_bucket * self.buckets.len()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn bucket(&self, key: &CacheKey) -> BucketGuard<'_, CacheBucket<V>> {
        self.buckets.acquire(self.buckets.assign(&key.file))
    }

    /// Return the cached value for `key` or compute it, at most once per key
    /// generation across concurrent callers. The flag is `true` when the value
    /// was not computed by this call.
    ///
    /// Errors are returned to the caller that ran `compute` and are never
    /// cached; waiters on a failed flight retry.
    pub fn get_or_compute<E>(
        &self,
        key: CacheKey,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<(V, bool), E> {
        self.stats.gets.incr();
        loop {
            let mut b = self.bucket(&key);
            match b.slots.get_mut(&key.file) {
                Some(Slot::Ready { fp, value, used }) if *fp == key.fp => {
                    *used = self.tick();
                    self.stats.hits.incr();
                    return Ok((value.clone(), true));
                }
                Some(Slot::Ready { .. }) => {
                    b.slots.remove(&key.file);
                    self.stats.invalids.incr();
                }
                Some(Slot::Pending { fp, flight }) if *fp == key.fp => {
                    let flight = Arc::clone(flight);
                    drop(b);
                    if let Some(v) = flight.wait() {
                        self.stats.hits.incr();
                        return Ok((v, true));
                    }
                    continue;
                }
                Some(Slot::Pending { .. }) => {
                    // another generation is still being computed
                    drop(b);
                    self.stats.misses.incr();
                    self.stats.uncached.incr();
                    return compute().map(|v| (v, false));
                }
                None => {}
            }

            self.stats.misses.incr();
            if b.slots.len() >= self.per_bucket {
                if b.evict_one() {
                    self.stats.evictions.incr();
                } else {
                    drop(b);
                    self.stats.uncached.incr();
                    return compute().map(|v| (v, false));
                }
            }
            let flight = Arc::new(Flight::new());
            b.slots.insert(key.file, Slot::Pending { fp: key.fp, flight: Arc::clone(&flight) });
            drop(b);

            let owner = FlightOwner { cache: self, key, flight, done: false };
            let value = compute()?;
            owner.complete(&value);
            return Ok((value, false));
        }
    }
}
