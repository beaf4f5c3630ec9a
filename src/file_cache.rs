//! Engine-wide cache of decoded chunks.
//!
//! Entries live in a slab of slots threaded onto an intrusive LRU list. Handles pin their
//! entry with a reference count; pinned entries are never evicted. When the last handle of
//! an entry that is over capacity (or was invalidated) goes away, the entry is evicted then.
//! Evicted buffers are recycled through a small pool so decoding reuses allocations.

use crate::error::DbError;
use crate::telemetry::db_metrics;
use crate::types::{TimedValue, Timestamp};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::iter::Rev;
use std::ops::{Deref, Range};
use std::slice::Iter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Identifies one chunk of one series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Storage namespace of the series.
    pub series: Arc<str>,
    /// Chunk sequence number within the series.
    pub chunk_seq: u64,
}

impl CacheKey {
    pub fn new(series: Arc<str>, chunk_seq: u64) -> Self {
        Self { series, chunk_seq }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCacheConfig {
    /// Upper bound on unpinned entries kept resident.
    pub max_entries: usize,
    /// Evict entries idle for longer than this.
    pub expire_after_access: Option<Duration>,
    /// Number of spare value buffers kept for reuse.
    pub pool_capacity: usize,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            expire_after_access: None,
            pool_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub pinned: usize,
}

struct Slot<V> {
    key: Option<CacheKey>,
    data: Option<Arc<Vec<V>>>,
    refs: usize,
    last_access: Instant,
    prev: Option<usize>,
    next: Option<usize>,
    /// Removed from the map while pinned; freed on last release.
    orphaned: bool,
}

struct CacheState<V> {
    config: FileCacheConfig,
    slots: Vec<Slot<V>>,
    free: Vec<usize>,
    map: HashMap<CacheKey, usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
    pool: Vec<Vec<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V> CacheState<V> {
    fn new(config: FileCacheConfig) -> Self {
        Self {
            config,
            slots: Vec::new(),
            free: Vec::new(),
            map: HashMap::new(),
            head: None,
            tail: None,
            pool: Vec::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => {
                if self.head == Some(idx) {
                    self.head = next;
                }
            }
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => {
                if self.tail == Some(idx) {
                    self.tail = prev;
                }
            }
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = None;
        self.slots[idx].next = self.head;
        if let Some(h) = self.head {
            self.slots[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize, now: Instant) {
        self.slots[idx].last_access = now;
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn insert(&mut self, key: CacheKey, data: Arc<Vec<V>>, now: Instant) -> usize {
        let slot = Slot {
            key: Some(key.clone()),
            data: Some(data),
            refs: 0,
            last_access: now,
            prev: None,
            next: None,
            orphaned: false,
        };
        let idx = match self.free.pop() {
            Some(i) => {
                self.slots[i] = slot;
                i
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.push_front(idx);
        idx
    }

    fn recycle(&mut self, mut buf: Vec<V>) {
        if self.pool.len() < self.config.pool_capacity {
            buf.clear();
            self.pool.push(buf);
        }
    }

    /// Returns the slot to the free list; its buffer goes back to the pool when unshared.
    fn free_slot(&mut self, idx: usize) {
        let data = self.slots[idx].data.take();
        self.slots[idx].key = None;
        self.slots[idx].orphaned = false;
        self.slots[idx].refs = 0;
        self.free.push(idx);
        if let Some(arc) = data {
            if let Ok(buf) = Arc::try_unwrap(arc) {
                self.recycle(buf);
            }
        }
    }

    /// Unmaps an entry; pinned entries are orphaned instead of freed.
    fn detach(&mut self, idx: usize) {
        self.unlink(idx);
        if let Some(key) = self.slots[idx].key.take() {
            self.map.remove(&key);
        }
        if self.slots[idx].refs == 0 {
            self.free_slot(idx);
        } else {
            self.slots[idx].orphaned = true;
        }
    }

    /// Drops an unpinned, mapped entry.
    fn evict(&mut self, idx: usize) {
        self.unlink(idx);
        if let Some(key) = self.slots[idx].key.as_ref() {
            self.map.remove(key);
        }
        self.free_slot(idx);
        self.evictions += 1;
    }

    fn evict_over_capacity(&mut self) -> u64 {
        let mut evicted = 0;
        let mut cursor = self.tail;
        while self.map.len() > self.config.max_entries {
            let Some(idx) = cursor else { break };
            cursor = self.slots[idx].prev;
            if self.slots[idx].refs == 0 {
                self.evict(idx);
                evicted += 1;
            }
        }
        evicted
    }

    fn expire_idle(&mut self, now: Instant) -> u64 {
        let Some(ttl) = self.config.expire_after_access else {
            return 0;
        };
        let mut evicted = 0;
        let mut cursor = self.tail;
        while let Some(idx) = cursor {
            let slot = &self.slots[idx];
            if now.saturating_duration_since(slot.last_access) <= ttl {
                break;
            }
            cursor = slot.prev;
            if slot.refs == 0 {
                self.evict(idx);
                evicted += 1;
            }
        }
        evicted
    }

    fn pinned(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.data.is_some() && s.refs > 0)
            .count()
    }
}

/// Shared LRU cache of decoded chunks. Cloning is cheap and shares state.
pub struct FileBufferCache<V> {
    state: Arc<Mutex<CacheState<V>>>,
}

impl<V> Clone for FileBufferCache<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<V> std::fmt::Debug for FileBufferCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("FileBufferCache")
            .field("config", &st.config)
            .field("entries", &st.map.len())
            .finish()
    }
}

impl<V> FileBufferCache<V> {
    pub fn new(config: FileCacheConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::new(config))),
        }
    }

    /// Returns a pinned handle to the chunk, decoding it with `loader` on a miss.
    ///
    /// `loader` receives a recycled buffer and runs without the cache lock held. If another
    /// thread inserted the same chunk meanwhile, its entry wins and this buffer is recycled.
    pub fn get<F>(&self, key: CacheKey, loader: F) -> Result<ChunkHandle<V>, DbError>
    where
        F: FnOnce(Vec<V>) -> Result<Vec<V>, DbError>,
    {
        let buf = {
            let mut st = self.state.lock();
            let now = Instant::now();
            let expired = st.expire_idle(now);
            if expired > 0 {
                db_metrics::record_cache_evictions(expired);
            }
            if let Some(&idx) = st.map.get(&key) {
                st.hits += 1;
                db_metrics::record_cache_hit();
                return Ok(self.pin(&mut st, idx, now));
            }
            st.misses += 1;
            db_metrics::record_cache_miss();
            st.pool.pop().unwrap_or_default()
        };

        let values = loader(buf)?;

        let mut st = self.state.lock();
        let now = Instant::now();
        if let Some(&idx) = st.map.get(&key) {
            st.recycle(values);
            return Ok(self.pin(&mut st, idx, now));
        }
        let idx = st.insert(key, Arc::new(values), now);
        let handle = self.pin(&mut st, idx, now);
        let evicted = st.evict_over_capacity();
        if evicted > 0 {
            db_metrics::record_cache_evictions(evicted);
        }
        if st.map.len() > st.config.max_entries {
            debug!(
                entries = st.map.len(),
                max_entries = st.config.max_entries,
                "chunk cache over capacity, all remaining entries pinned"
            );
        }
        Ok(handle)
    }

    fn pin(&self, st: &mut CacheState<V>, idx: usize, now: Instant) -> ChunkHandle<V> {
        st.slots[idx].refs += 1;
        st.touch(idx, now);
        ChunkHandle {
            state: Arc::clone(&self.state),
            slot: idx,
            data: st.slots[idx].data.clone(),
        }
    }

    /// Drops every entry of a series. Pinned entries are orphaned and freed on last release.
    pub fn invalidate_series(&self, series: &str) {
        let mut st = self.state.lock();
        let victims: Vec<usize> = st
            .map
            .iter()
            .filter(|(k, _)| &*k.series == series)
            .map(|(_, &idx)| idx)
            .collect();
        for idx in victims {
            st.detach(idx);
        }
    }

    /// Drops one chunk, e.g. a tail chunk the updater is about to rewrite.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut st = self.state.lock();
        if let Some(&idx) = st.map.get(key) {
            st.detach(idx);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let st = self.state.lock();
        CacheStats {
            hits: st.hits,
            misses: st.misses,
            evictions: st.evictions,
            entries: st.map.len(),
            pinned: st.pinned(),
        }
    }

    pub fn pooled_buffers(&self) -> usize {
        self.state.lock().pool.len()
    }
}

/// A pinned, decoded chunk. The entry cannot be evicted while any handle is alive.
pub struct ChunkHandle<V> {
    state: Arc<Mutex<CacheState<V>>>,
    slot: usize,
    data: Option<Arc<Vec<V>>>,
}

impl<V> Deref for ChunkHandle<V> {
    type Target = [V];

    fn deref(&self) -> &[V] {
        match &self.data {
            Some(d) => d.as_slice(),
            None => &[],
        }
    }
}

impl<V> Clone for ChunkHandle<V> {
    fn clone(&self) -> Self {
        self.state.lock().slots[self.slot].refs += 1;
        Self {
            state: Arc::clone(&self.state),
            slot: self.slot,
            data: self.data.clone(),
        }
    }
}

impl<V> Drop for ChunkHandle<V> {
    fn drop(&mut self) {
        // Release our share first so a freed buffer can be unwrapped into the pool.
        self.data = None;
        let mut st = self.state.lock();
        let slot = &mut st.slots[self.slot];
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return;
        }
        if slot.orphaned {
            st.free_slot(self.slot);
        } else if st.map.len() > st.config.max_entries {
            let evicted = st.evict_over_capacity();
            if evicted > 0 {
                db_metrics::record_cache_evictions(evicted);
            }
        }
    }
}

impl<V> std::fmt::Debug for ChunkHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkHandle")
            .field("slot", &self.slot)
            .field("len", &self.len())
            .finish()
    }
}

impl<V: TimedValue> ChunkHandle<V> {
    /// Index of the last value ending at or before `t`.
    pub fn floor_index(&self, t: Timestamp) -> Option<usize> {
        self.partition_point(|v| v.end_time() <= t).checked_sub(1)
    }

    /// Index of the first value ending at or after `t`.
    pub fn ceiling_index(&self, t: Timestamp) -> Option<usize> {
        let idx = self.partition_point(|v| v.end_time() < t);
        (idx < self.len()).then_some(idx)
    }

    /// Last value ending at or before `probe`.
    pub fn latest_value(&self, probe: Timestamp) -> Option<&V> {
        self.floor_index(probe).map(|i| &self[i])
    }

    /// Index range of values with end time in closed `[from, to]`; `None` is unbounded.
    pub fn range_bounds(&self, from: Option<Timestamp>, to: Option<Timestamp>) -> Range<usize> {
        let start = match from {
            Some(f) => self.partition_point(|v| v.end_time() < f),
            None => 0,
        };
        let end = match to {
            Some(t) => self.partition_point(|v| v.end_time() <= t),
            None => self.len(),
        };
        start..end.max(start)
    }

    pub fn iter_range(&self, from: Option<Timestamp>, to: Option<Timestamp>) -> Iter<'_, V> {
        self[self.range_bounds(from, to)].iter()
    }

    pub fn iter_range_rev(
        &self,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Rev<Iter<'_, V>> {
        self.iter_range(from, to).rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataPoint;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(max_entries: usize) -> FileBufferCache<DataPoint> {
        FileBufferCache::new(FileCacheConfig {
            max_entries,
            expire_after_access: None,
            pool_capacity: 4,
        })
    }

    fn key(seq: u64) -> CacheKey {
        CacheKey::new(Arc::from("ns"), seq)
    }

    fn load(seq: u64) -> impl FnOnce(Vec<DataPoint>) -> Result<Vec<DataPoint>, DbError> {
        move |mut buf| {
            buf.clear();
            buf.extend((0..4).map(|i| DataPoint::new(seq * 100 + i * 10, i as f64)));
            Ok(buf)
        }
    }

    #[test]
    fn hit_after_miss() {
        let c = cache(4);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let h = c
                .get(key(1), |buf| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    load(1)(buf)
                })
                .unwrap();
            assert_eq!(h.len(), 4);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let s = c.stats();
        assert_eq!((s.hits, s.misses, s.entries, s.pinned), (2, 1, 1, 0));
    }

    #[test]
    fn lru_eviction_recycles_buffers() {
        let c = cache(2);
        for seq in 0..4 {
            drop(c.get(key(seq), load(seq)).unwrap());
        }
        let s = c.stats();
        assert_eq!(s.entries, 2);
        assert_eq!(s.evictions, 2);
        assert!(c.pooled_buffers() >= 1);
        // the two most recent survive
        let h = c.get(key(3), |_| panic!("should be cached")).unwrap();
        assert_eq!(h[0].timestamp, 300);
    }

    #[test]
    fn pinned_entries_are_not_evicted_until_released() {
        let c = cache(1);
        let pinned = c.get(key(0), load(0)).unwrap();
        let other = c.get(key(1), load(1)).unwrap();
        let s = c.stats();
        assert_eq!(s.entries, 2);
        assert_eq!(s.pinned, 2);
        assert_eq!(pinned[3].timestamp, 30);

        drop(pinned);
        // deferred eviction on release of the over-capacity entry
        assert_eq!(c.stats().entries, 1);
        drop(other);
        assert_eq!(c.stats().entries, 1);
        assert_eq!(c.stats().pinned, 0);
    }

    #[test]
    fn cloned_handle_keeps_pin() {
        let c = cache(1);
        let a = c.get(key(0), load(0)).unwrap();
        let b = a.clone();
        drop(a);
        drop(c.get(key(1), load(1)).unwrap());
        assert_eq!(b[1].timestamp, 10);
        assert!(c.get(key(0), |_| panic!("pinned entry evicted")).is_ok());
    }

    #[test]
    fn invalidate_orphans_pinned_entries() {
        let c = cache(8);
        let pinned = c.get(key(0), load(0)).unwrap();
        drop(c.get(key(1), load(1)).unwrap());
        c.invalidate_series("ns");
        let s = c.stats();
        assert_eq!(s.entries, 0);
        assert_eq!(s.pinned, 1);
        assert_eq!(pinned.len(), 4);
        drop(pinned);
        assert_eq!(c.stats().pinned, 0);

        let calls = AtomicUsize::new(0);
        drop(
            c.get(key(0), |buf| {
                calls.fetch_add(1, Ordering::SeqCst);
                load(0)(buf)
            })
            .unwrap(),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_drops_a_single_chunk() {
        let c = cache(8);
        drop(c.get(key(0), load(0)).unwrap());
        let pinned = c.get(key(1), load(1)).unwrap();
        c.invalidate(&key(1));
        c.invalidate(&key(7));
        let s = c.stats();
        assert_eq!(s.entries, 1);
        assert_eq!(s.pinned, 1);
        assert_eq!(pinned.len(), 4);
        drop(pinned);
        assert_eq!(c.stats().pinned, 0);
        assert!(c.get(key(0), |_| panic!("untouched entry reloaded")).is_ok());
    }

    #[test]
    fn idle_entries_expire() {
        let c: FileBufferCache<DataPoint> = FileBufferCache::new(FileCacheConfig {
            max_entries: 8,
            expire_after_access: Some(Duration::from_millis(1)),
            pool_capacity: 4,
        });
        drop(c.get(key(0), load(0)).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        drop(c.get(key(1), load(1)).unwrap());
        assert_eq!(c.stats().entries, 1);
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn loader_error_is_propagated() {
        let c = cache(2);
        let err = c
            .get(key(9), |_| Err(DbError::corruption("bad chunk")))
            .unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(c.stats().entries, 0);
    }

    #[test]
    fn handle_bisection_helpers() {
        let c = cache(2);
        let h = c.get(key(0), load(0)).unwrap();
        // end times 0, 10, 20, 30
        assert_eq!(h.floor_index(15), Some(1));
        assert_eq!(h.floor_index(10), Some(1));
        assert_eq!(h.ceiling_index(11), Some(2));
        assert_eq!(h.ceiling_index(31), None);
        assert!(h.latest_value(0).is_some());
        let fwd: Vec<u64> = h.iter_range(Some(10), Some(20)).map(|p| p.timestamp).collect();
        assert_eq!(fwd, vec![10, 20]);
        let rev: Vec<u64> = h.iter_range_rev(None, Some(15)).map(|p| p.timestamp).collect();
        assert_eq!(rev, vec![10, 0]);
        assert_eq!(h.iter_range(Some(25), Some(21)).count(), 0);
    }
}
