//! Lazy range iteration over one series.

use crate::error::DbError;
use crate::file_cache::ChunkHandle;
use crate::storage::SeriesStorage;
use crate::types::{bounds_admit_any, ScanDirection, TimedValue, Timestamp};

use lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock};
use std::ops::Range;
use std::sync::Arc;

type StorageReadGuard<V> = ArcRwLockReadGuard<RawRwLock, SeriesStorage<V>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Pending,
    Open,
    Closed,
}

/// Iterates the values of a series with end times in closed `[from, to]`.
///
/// The series read lock is taken on the first call to `next()` and held until the cursor is
/// exhausted, fails, is closed, or is dropped. While it is held, deletion of the series
/// times out. The currently pinned chunk is released together with the lock.
pub struct SeriesCursor<V: TimedValue> {
    lock: Arc<RwLock<SeriesStorage<V>>>,
    guard: Option<StorageReadGuard<V>>,
    state: CursorState,
    from: Option<Timestamp>,
    to: Option<Timestamp>,
    direction: ScanDirection,
    positions: Range<usize>,
    current: Option<(ChunkHandle<V>, Range<usize>)>,
}

impl<V: TimedValue> SeriesCursor<V> {
    pub(crate) fn new(
        lock: Arc<RwLock<SeriesStorage<V>>>,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
        direction: ScanDirection,
    ) -> Self {
        Self {
            lock,
            guard: None,
            state: CursorState::Pending,
            from,
            to,
            direction,
            positions: 0..0,
            current: None,
        }
    }

    pub fn direction(&self) -> ScanDirection {
        self.direction
    }

    /// True while the cursor holds the series read lock.
    pub fn is_open(&self) -> bool {
        self.state == CursorState::Open
    }

    /// Releases the pinned chunk and the read lock. Further calls to `next()` return `None`.
    pub fn close(&mut self) {
        self.current = None;
        self.guard = None;
        self.positions = 0..0;
        self.state = CursorState::Closed;
    }

    fn start(&mut self) {
        self.state = CursorState::Open;
        if !bounds_admit_any(self.from, self.to) {
            self.close();
            return;
        }
        let guard = self.lock.read_arc();
        self.positions = guard.chunk_positions(self.from, self.to);
        self.guard = Some(guard);
    }
}

impl<V: TimedValue> Iterator for SeriesCursor<V> {
    type Item = Result<V, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            CursorState::Closed => return None,
            CursorState::Pending => self.start(),
            CursorState::Open => {}
        }
        loop {
            if let Some((handle, range)) = self.current.as_mut() {
                let idx = match self.direction {
                    ScanDirection::Ascending => range.next(),
                    ScanDirection::Descending => range.next_back(),
                };
                if let Some(i) = idx {
                    return Some(Ok(handle[i].clone()));
                }
                self.current = None;
            }
            let pos = match self.direction {
                ScanDirection::Ascending => self.positions.next(),
                ScanDirection::Descending => self.positions.next_back(),
            };
            let (Some(pos), Some(guard)) = (pos, self.guard.as_ref()) else {
                self.close();
                return None;
            };
            match guard.load_chunk_at(pos) {
                Ok(handle) => {
                    let range = handle.range_bounds(self.from, self.to);
                    self.current = Some((handle, range));
                }
                Err(e) => {
                    self.close();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<V: TimedValue> Drop for SeriesCursor<V> {
    fn drop(&mut self) {
        // chunk handle before the lock guard
        self.current = None;
        self.guard = None;
    }
}

impl<V: TimedValue> std::fmt::Debug for SeriesCursor<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesCursor")
            .field("state", &self.state)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("direction", &self.direction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkCompression;
    use crate::file_cache::{FileBufferCache, FileCacheConfig};
    use crate::serde_codec::DataPointSerde;
    use crate::types::DataPoint;
    use std::time::Duration;
    use tempfile::tempdir;

    fn storage(root: &std::path::Path) -> Arc<RwLock<SeriesStorage<DataPoint>>> {
        let mut s = SeriesStorage::open(
            root,
            "6b",
            "k".to_string(),
            Arc::new(DataPointSerde),
            FileBufferCache::new(FileCacheConfig::default()),
        )
        .unwrap();
        for chunk in [[1u64, 2, 3], [3, 3, 4], [7, 8, 9]] {
            let pts: Vec<_> = chunk.iter().map(|&t| DataPoint::new(t, t as f64)).collect();
            s.append_chunk(&pts, ChunkCompression::Lz4).unwrap();
        }
        s.commit().unwrap();
        Arc::new(RwLock::new(s))
    }

    fn collect(c: SeriesCursor<DataPoint>) -> Vec<u64> {
        c.map(|r| r.unwrap().timestamp).collect()
    }

    #[test]
    fn forward_and_reverse() {
        let dir = tempdir().unwrap();
        let lock = storage(dir.path());
        let fwd = SeriesCursor::new(lock.clone(), Some(3), Some(8), ScanDirection::Ascending);
        assert_eq!(collect(fwd), vec![3, 3, 3, 4, 7, 8]);
        let rev = SeriesCursor::new(lock.clone(), Some(3), Some(8), ScanDirection::Descending);
        assert_eq!(collect(rev), vec![8, 7, 4, 3, 3, 3]);
        let all = SeriesCursor::new(lock.clone(), None, None, ScanDirection::Ascending);
        assert_eq!(collect(all).len(), 9);
        let gap = SeriesCursor::new(lock.clone(), Some(5), Some(6), ScanDirection::Ascending);
        assert!(collect(gap).is_empty());
        let inverted = SeriesCursor::new(lock, Some(8), Some(3), ScanDirection::Ascending);
        assert!(collect(inverted).is_empty());
    }

    #[test]
    fn lock_is_taken_lazily_and_released_on_close() {
        let dir = tempdir().unwrap();
        let lock = storage(dir.path());
        let mut cursor = SeriesCursor::new(lock.clone(), None, None, ScanDirection::Ascending);
        assert!(!cursor.is_open());
        assert!(lock.try_write_for(Duration::from_millis(10)).is_some());

        assert!(cursor.next().is_some());
        assert!(cursor.is_open());
        assert!(lock.try_write_for(Duration::from_millis(10)).is_none());

        cursor.close();
        assert!(cursor.next().is_none());
        assert!(lock.try_write_for(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn exhaustion_releases_lock() {
        let dir = tempdir().unwrap();
        let lock = storage(dir.path());
        let mut cursor = SeriesCursor::new(lock.clone(), Some(9), None, ScanDirection::Ascending);
        assert_eq!(cursor.next().unwrap().unwrap().timestamp, 9);
        assert!(cursor.next().is_none());
        assert!(!cursor.is_open());
        assert!(lock.try_write_for(Duration::from_millis(10)).is_some());
    }
}
