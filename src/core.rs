//! Engine entry point: configuration, the per-key registry of series locks, and the public
//! query / update / delete API.

use crate::chunk::ChunkCompression;
use crate::cursor::SeriesCursor;
use crate::error::DbError;
use crate::file_cache::{CacheStats, FileBufferCache, FileCacheConfig};
use crate::serde_codec::{namespace_of, parse_namespace, KeySerde, ValueSerde};
use crate::storage::SeriesStorage;
use crate::telemetry::{db_metrics, noop_event_listener, DbEvent, DbEventListener};
use crate::types::{ScanDirection, SeriesKey, TimedValue, Timestamp};
use crate::updater::{
    update_series, UpdateContext, UpdateOutcome, UpdatePolicy, UpdateSource, UpdateStatus,
};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Subdirectory of `base_dir` holding one directory per series.
pub const SERIES_DIR: &str = "series";

/// Configuration options for the engine.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Root directory for all on-disk state.
    pub base_dir: PathBuf,
    /// Values per chunk written by the updater.
    pub flush_size: usize,
    /// Compression applied to new chunks.
    pub compression: ChunkCompression,
    /// Shift distances precomputed at ingestion.
    pub shift_index_units: Vec<u32>,
    /// Bounded wait for a series write lock (updates and deletes).
    pub lock_timeout: Duration,
    /// Bounded wait for an in-flight update under [`UpdatePolicy::SkipIfRunning`].
    pub running_wait: Duration,
    pub update_policy: UpdatePolicy,
    pub file_cache: FileCacheConfig,
    /// Cross-check index tables against chunk files when a series is first opened.
    pub verify_on_open: bool,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn DbEventListener>,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            base_dir: PathBuf::from("./data"),
            flush_size: 10_000,
            compression: ChunkCompression::Lz4,
            shift_index_units: vec![1, 10, 100],
            lock_timeout: Duration::from_secs(5),
            running_wait: Duration::from_millis(50),
            update_policy: UpdatePolicy::Block,
            file_cache: FileCacheConfig::default(),
            verify_on_open: true,
            event_listener: noop_event_listener(),
        }
    }
}

impl DbConfig {
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn series_root(&self) -> PathBuf {
        self.base_dir.join(SERIES_DIR)
    }

    pub fn validate(&self) -> Result<(), DbError> {
        if self.flush_size == 0 {
            return Err(DbError::ConfigError("flush_size must be > 0".to_string()));
        }
        if self.file_cache.max_entries == 0 {
            return Err(DbError::ConfigError(
                "file_cache.max_entries must be > 0".to_string(),
            ));
        }
        if self.shift_index_units.iter().any(|&u| u == 0) {
            return Err(DbError::ConfigError(
                "shift_index_units must be positive".to_string(),
            ));
        }
        if let ChunkCompression::Zstd { level } = self.compression {
            if !(1..=22).contains(&level) {
                return Err(DbError::ConfigError(format!(
                    "zstd level must be within 1..=22, got {}",
                    level
                )));
            }
        }
        Ok(())
    }
}

/// Lock and bookkeeping of one series, created lazily and kept for the engine's lifetime.
pub struct SeriesHandle<V> {
    label: String,
    pub(crate) storage: Arc<RwLock<SeriesStorage<V>>>,
    pub(crate) update_guard: Mutex<()>,
    status: Mutex<UpdateStatus>,
    rebuild_required: AtomicBool,
}

impl<V> SeriesHandle<V> {
    fn new(label: String, storage: SeriesStorage<V>) -> Self {
        Self {
            label,
            storage: Arc::new(RwLock::new(storage)),
            update_guard: Mutex::new(()),
            status: Mutex::new(UpdateStatus::NotStarted),
            rebuild_required: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn status(&self) -> UpdateStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: UpdateStatus) {
        *self.status.lock() = status;
    }

    pub(crate) fn mark_rebuild_required(&self) {
        self.rebuild_required.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_rebuild_required(&self) -> bool {
        self.rebuild_required.swap(false, Ordering::SeqCst)
    }

    pub fn rebuild_required(&self) -> bool {
        self.rebuild_required.load(Ordering::SeqCst)
    }
}

/// Embedded time-series store: one append-only chunked series per key.
pub struct TimeSeriesDb<K, V> {
    config: DbConfig,
    series_root: PathBuf,
    key_serde: Arc<dyn KeySerde<K>>,
    value_serde: Arc<dyn ValueSerde<V>>,
    cache: FileBufferCache<V>,
    series: Mutex<HashMap<K, HandleSlot<V>>>,
}

/// Filled on first access. Opening a series runs under the slot's own lock, so slow opens
/// of one key do not hold up other keys.
type HandleSlot<V> = Arc<Mutex<Option<Arc<SeriesHandle<V>>>>>;

impl<K, V> std::fmt::Debug for TimeSeriesDb<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSeriesDb")
            .field("series_root", &self.series_root)
            .field("open_series", &self.series.lock().len())
            .field("cache", &self.cache)
            .finish()
    }
}

impl<K: SeriesKey, V: TimedValue> TimeSeriesDb<K, V> {
    /// Opens (or creates) an engine rooted at `config.base_dir`.
    ///
    /// Series are opened lazily on first access; opening checks for an incomplete update
    /// marker and, when `verify_on_open` is set, cross-checks the index tables. Either
    /// condition deletes the series so the next update rebuilds it.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the base directory cannot be
    /// created.
    pub fn open(
        config: DbConfig,
        key_serde: impl KeySerde<K> + 'static,
        value_serde: impl ValueSerde<V> + 'static,
    ) -> Result<Self, DbError> {
        config.validate()?;
        let series_root = config.series_root();
        fs::create_dir_all(&series_root)?;
        let cache = FileBufferCache::new(config.file_cache.clone());
        info!(base_dir = %config.base_dir.display(), "time series store opened");
        Ok(Self {
            config,
            series_root,
            key_serde: Arc::new(key_serde),
            value_serde: Arc::new(value_serde),
            cache,
            series: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    /// Storage namespace (directory name) of `key`.
    pub fn namespace(&self, key: &K) -> String {
        namespace_of(&self.key_serde.encode(key))
    }

    pub(crate) fn handle(&self, key: &K) -> Result<Arc<SeriesHandle<V>>, DbError> {
        let slot = Arc::clone(self.series.lock().entry(key.clone()).or_default());
        let mut slot = slot.lock();
        if let Some(h) = slot.as_ref() {
            return Ok(Arc::clone(h));
        }
        let label = format!("{:?}", key);
        let storage = self.open_storage(key, &label)?;
        let handle = Arc::new(SeriesHandle::new(label, storage));
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    fn open_storage(&self, key: &K, label: &str) -> Result<SeriesStorage<V>, DbError> {
        let namespace = self.namespace(key);
        let open = || {
            SeriesStorage::open(
                &self.series_root,
                &namespace,
                label.to_string(),
                Arc::clone(&self.value_serde),
                self.cache.clone(),
            )
        };
        let mut storage = match open() {
            Ok(s) => s,
            Err(e) if e.is_corruption() => {
                self.report_corruption(label, &e);
                remove_dir_if_exists(&self.series_root.join(&namespace))?;
                open()?
            }
            Err(e) => return Err(e),
        };

        if storage.has_update_marker() {
            warn!(series = label, "incomplete update marker found, deleting series storage");
            db_metrics::record_self_heal();
            self.config
                .event_listener
                .on_event(DbEvent::IncompleteUpdateDetected {
                    series: label.to_string(),
                });
            storage.delete_all()?;
        } else if self.config.verify_on_open {
            if let Err(e) = storage.check_consistency() {
                if !e.is_corruption() {
                    return Err(e);
                }
                self.report_corruption(label, &e);
                storage.delete_all()?;
            }
        }

        debug!(
            series = label,
            values = storage.len(),
            chunks = storage.index().chunk_count(),
            "series opened"
        );
        self.config.event_listener.on_event(DbEvent::SeriesOpened {
            series: label.to_string(),
            values: storage.len(),
            chunks: storage.index().chunk_count(),
        });
        Ok(storage)
    }

    fn report_corruption(&self, label: &str, err: &DbError) {
        warn!(series = label, error = %err, "corrupted series storage, scheduling rebuild");
        db_metrics::record_self_heal();
        self.config
            .event_listener
            .on_event(DbEvent::CorruptionDetected {
                series: label.to_string(),
                details: err.to_string(),
            });
    }

    /// Runs `f` under the series read lock. Storage found corrupt is deleted so the next
    /// update rebuilds it; until that deletion succeeds, reads of the series come back empty.
    fn read<R: Default>(
        &self,
        key: &K,
        f: impl FnOnce(&SeriesStorage<V>) -> Result<R, DbError>,
    ) -> Result<R, DbError> {
        let handle = self.handle(key)?;
        if handle.rebuild_required() && !self.purge_corrupt(&handle, handle.storage.try_write()) {
            return Ok(R::default());
        }
        let result = {
            let storage = handle.storage.read_recursive();
            f(&storage)
        };
        if let Err(e) = &result {
            if e.is_corruption() {
                handle.mark_rebuild_required();
                self.report_corruption(handle.label(), e);
                self.purge_corrupt(
                    &handle,
                    handle.storage.try_write_for(self.config.lock_timeout),
                );
            }
        }
        result
    }

    /// Deletes the storage of a series flagged for rebuild. Returns false when the write
    /// lock was not available or the deletion failed; the flag then stays set.
    fn purge_corrupt(
        &self,
        handle: &SeriesHandle<V>,
        guard: Option<RwLockWriteGuard<'_, SeriesStorage<V>>>,
    ) -> bool {
        let Some(mut storage) = guard else {
            debug!(series = handle.label(), "corrupted series still in use, deletion deferred");
            return false;
        };
        if let Err(e) = storage.delete_all() {
            warn!(series = handle.label(), error = %e, "failed to delete corrupted series");
            return false;
        }
        handle.take_rebuild_required();
        info!(series = handle.label(), "corrupted series storage deleted");
        self.config.event_listener.on_event(DbEvent::StorageDeleted {
            series: handle.label().to_string(),
        });
        true
    }

    /// Value as of `t`: the last value ending at or before `t`. `MIN_TIME` and probes
    /// before the series start return the first value; `MAX_TIME` returns the last.
    pub fn get_latest_value(&self, key: &K, t: Timestamp) -> Result<Option<V>, DbError> {
        self.read(key, |s| s.latest_value(t))
    }

    /// The `n`th value before the value as of `t`, clamped to the first value.
    pub fn get_previous_value(
        &self,
        key: &K,
        t: Timestamp,
        n: u32,
    ) -> Result<Option<V>, DbError> {
        self.read(key, |s| s.previous_value(t, n))
    }

    /// The `n`th value after the first value ending at or after `t`, clamped to the last
    /// value.
    pub fn get_next_value(&self, key: &K, t: Timestamp, n: u32) -> Result<Option<V>, DbError> {
        self.read(key, |s| s.next_value(t, n))
    }

    /// Lazy ascending iteration over values with end time in `[from, to]` (`None` is
    /// unbounded). The series read lock is held from the first `next()` until the cursor is
    /// closed or dropped.
    ///
    /// # Errors
    /// `InvalidTimeRange` when both bounds are given and `from > to`.
    pub fn range_values(
        &self,
        key: &K,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<SeriesCursor<V>, DbError> {
        self.cursor(key, from, to, ScanDirection::Ascending)
    }

    /// Exact reverse of [`range_values`](Self::range_values).
    pub fn range_reverse_values(
        &self,
        key: &K,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<SeriesCursor<V>, DbError> {
        self.cursor(key, from, to, ScanDirection::Descending)
    }

    fn cursor(
        &self,
        key: &K,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
        direction: ScanDirection,
    ) -> Result<SeriesCursor<V>, DbError> {
        if let (Some(start), Some(end)) = (from, to) {
            if start > end {
                return Err(DbError::InvalidTimeRange { start, end });
            }
        }
        let handle = self.handle(key)?;
        Ok(SeriesCursor::new(
            Arc::clone(&handle.storage),
            from,
            to,
            direction,
        ))
    }

    /// True when the series has no values or its index tables disagree with the chunk files.
    pub fn is_empty_or_inconsistent(&self, key: &K) -> Result<bool, DbError> {
        let handle = self.handle(key)?;
        if handle.rebuild_required() {
            return Ok(true);
        }
        let storage = handle.storage.read_recursive();
        if storage.is_empty() {
            return Ok(true);
        }
        match storage.check_consistency() {
            Ok(()) => Ok(false),
            Err(e) if e.is_corruption() => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Deletes every value of the series. Waits at most `lock_timeout` for readers.
    ///
    /// # Errors
    /// `LockTimeout` (retryable) when open cursors hold the series past the wait.
    pub fn delete_all(&self, key: &K) -> Result<(), DbError> {
        let handle = self.handle(key)?;
        let timeout = self.config.lock_timeout;
        let Some(mut storage) = handle.storage.try_write_for(timeout) else {
            debug!(series = handle.label(), "delete timed out waiting for readers");
            return Err(DbError::LockTimeout {
                series: handle.label().to_string(),
                waited: timeout,
            });
        };
        storage.delete_all()?;
        handle.take_rebuild_required();
        info!(series = handle.label(), "series storage deleted");
        self.config.event_listener.on_event(DbEvent::StorageDeleted {
            series: handle.label().to_string(),
        });
        Ok(())
    }

    pub fn len(&self, key: &K) -> Result<u64, DbError> {
        self.read(key, |s| Ok(s.len()))
    }

    pub fn first_value(&self, key: &K) -> Result<Option<V>, DbError> {
        self.read(key, |s| s.first_value())
    }

    pub fn last_value(&self, key: &K) -> Result<Option<V>, DbError> {
        self.read(key, |s| s.last_value())
    }

    pub fn value_at(&self, key: &K, ordinal: u64) -> Result<Option<V>, DbError> {
        self.read(key, |s| s.value_at(ordinal))
    }

    pub fn floor_ordinal(&self, key: &K, t: Timestamp) -> Result<Option<u64>, DbError> {
        self.read(key, |s| s.floor_ordinal(t))
    }

    pub fn ceiling_ordinal(&self, key: &K, t: Timestamp) -> Result<Option<u64>, DbError> {
        self.read(key, |s| s.ceiling_ordinal(t))
    }

    /// Appends whatever `source` yields after the stored tail, using the configured policy.
    pub fn update(
        &self,
        key: &K,
        source: &dyn UpdateSource<V>,
    ) -> Result<UpdateOutcome, DbError> {
        self.update_with(key, source, &UpdateContext::from_config(&self.config))
    }

    /// Like [`update`](Self::update) with explicit run parameters.
    ///
    /// # Errors
    /// `IncompleteUpdate` when the run failed; the series storage has been deleted and the
    /// next run starts from empty.
    pub fn update_with(
        &self,
        key: &K,
        source: &dyn UpdateSource<V>,
        ctx: &UpdateContext,
    ) -> Result<UpdateOutcome, DbError> {
        let handle = self.handle(key)?;
        update_series(&handle, source, ctx, self.config.event_listener.as_ref())
    }

    pub fn update_status(&self, key: &K) -> UpdateStatus {
        let slot = self.series.lock().get(key).cloned();
        slot.and_then(|slot| slot.lock().as_ref().map(|h| h.status()))
            .unwrap_or_default()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Keys of every series that has storage on disk.
    pub fn list_series(&self) -> Result<Vec<K>, DbError> {
        let mut keys = Vec::new();
        let entries = match fs::read_dir(&self.series_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(bytes) = name.to_str().and_then(parse_namespace) else {
                continue;
            };
            match self.key_serde.decode(&bytes) {
                Ok(key) => keys.push(key),
                Err(e) => debug!(namespace = ?name, error = %e, "skipping undecodable series dir"),
            }
        }
        Ok(keys)
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<(), DbError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serde_codec::{DataPointSerde, StringKeySerde};
    use crate::types::DataPoint;
    use tempfile::tempdir;

    fn db(dir: &Path) -> TimeSeriesDb<String, DataPoint> {
        let config = DbConfig {
            flush_size: 4,
            ..DbConfig::with_base_dir(dir)
        };
        TimeSeriesDb::open(config, StringKeySerde, DataPointSerde).unwrap()
    }

    #[test]
    fn default_config_is_valid() {
        DbConfig::default().validate().unwrap();
        let bad = DbConfig {
            flush_size: 0,
            ..DbConfig::default()
        };
        assert!(matches!(bad.validate(), Err(DbError::ConfigError(_))));
    }

    #[test]
    fn update_then_query() {
        let dir = tempdir().unwrap();
        let db = db(dir.path());
        let key = "K".to_string();
        let values: Vec<DataPoint> = (1..=10u64).map(|t| DataPoint::new(t * 10, t as f64)).collect();

        assert_eq!(db.update_status(&key), UpdateStatus::NotStarted);
        let outcome = db.update(&key, &values).unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Completed {
                appended: 10,
                chunks: 3
            }
        );
        assert_eq!(db.update_status(&key), UpdateStatus::Completed);
        assert_eq!(db.update(&key, &values).unwrap(), UpdateOutcome::UpToDate);

        assert_eq!(db.len(&key).unwrap(), 10);
        assert_eq!(db.get_latest_value(&key, 55).unwrap().unwrap().timestamp, 50);
        assert_eq!(db.get_previous_value(&key, 100, 3).unwrap().unwrap().timestamp, 70);
        assert_eq!(db.get_next_value(&key, 10, 9).unwrap().unwrap().timestamp, 100);
        assert!(!db.is_empty_or_inconsistent(&key).unwrap());
        assert_eq!(db.list_series().unwrap(), vec![key.clone()]);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let dir = tempdir().unwrap();
        let db = db(dir.path());
        let err = db.range_values(&"K".to_string(), Some(5), Some(4)).unwrap_err();
        assert!(matches!(err, DbError::InvalidTimeRange { start: 5, end: 4 }));
    }

    #[test]
    fn concurrent_first_access_shares_one_handle() {
        let dir = tempdir().unwrap();
        let db = db(dir.path());
        let keys: Vec<String> = (0..4).map(|i| format!("K{i}")).collect();

        let handles: Vec<(usize, Arc<SeriesHandle<DataPoint>>)> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..16)
                .map(|i| {
                    let (db, keys) = (&db, &keys);
                    s.spawn(move || (i % 4, db.handle(&keys[i % 4]).unwrap()))
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        for (k, h) in &handles {
            let first = &handles.iter().find(|(j, _)| j == k).unwrap().1;
            assert!(Arc::ptr_eq(first, h));
        }
        assert!(!Arc::ptr_eq(&handles[0].1, &handles[1].1));
        assert_eq!(db.update_status(&keys[0]), UpdateStatus::NotStarted);
        assert_eq!(db.update_status(&"never".to_string()), UpdateStatus::NotStarted);
    }

    #[test]
    fn unknown_series_is_empty() {
        let dir = tempdir().unwrap();
        let db = db(dir.path());
        let key = "nothing".to_string();
        assert!(db.is_empty_or_inconsistent(&key).unwrap());
        assert!(db.get_latest_value(&key, 5).unwrap().is_none());
        assert!(db.list_series().unwrap().is_empty());
    }
}
