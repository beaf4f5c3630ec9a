//! Per-series storage: chunk files on disk, their index tables, and query operations that
//! go through the shared chunk cache.
//!
//! A `SeriesStorage` is always accessed through its per-series `RwLock`; readers take the
//! read side, the updater and deletion take the write side.

use crate::chunk::{crc32, decode_chunk_into, encode_chunk, ChunkCompression};
use crate::error::DbError;
use crate::file_cache::{CacheKey, ChunkHandle, FileBufferCache};
use crate::index::{ChunkDescriptor, ChunkId, SeriesIndex, ShiftDirection};
use crate::serde_codec::ValueSerde;
use crate::table::sync_parent_dir;
use crate::types::{TimedValue, Timestamp, MAX_TIME, MIN_TIME};

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Present while an ingestion run is writing; found at open, it means the run died.
pub const UPDATE_MARKER: &str = "UPDATE_IN_PROGRESS";
pub const TMP_DIR: &str = "tmp";

pub(crate) fn chunk_file_name(seq: u64) -> String {
    format!("chunk_{:020}.chk", seq)
}

pub struct SeriesStorage<V> {
    namespace: Arc<str>,
    label: String,
    dir: PathBuf,
    tmp_dir: PathBuf,
    index: SeriesIndex,
    serde: Arc<dyn ValueSerde<V>>,
    cache: FileBufferCache<V>,
    next_seq: u64,
}

impl<V> std::fmt::Debug for SeriesStorage<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesStorage")
            .field("label", &self.label)
            .field("dir", &self.dir)
            .field("chunks", &self.index.chunk_count())
            .field("values", &self.index.value_count())
            .finish()
    }
}

impl<V: TimedValue> SeriesStorage<V> {
    /// Opens the storage of one series under `series_root/<namespace>`. Nothing is created on
    /// disk until the first chunk is appended.
    pub fn open(
        series_root: &Path,
        namespace: &str,
        label: String,
        serde: Arc<dyn ValueSerde<V>>,
        cache: FileBufferCache<V>,
    ) -> Result<Self, DbError> {
        let dir = series_root.join(namespace);
        let tmp_dir = dir.join(TMP_DIR);
        let index = SeriesIndex::open(&dir, &tmp_dir).map_err(|e| e.for_series(&label))?;
        let next_seq = index.last_chunk().map(|c| c.id.seq + 1).unwrap_or(0);
        Ok(Self {
            namespace: Arc::from(namespace),
            label,
            dir,
            tmp_dir,
            index,
            serde,
            cache,
            next_seq,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index(&self) -> &SeriesIndex {
        &self.index
    }

    pub fn len(&self) -> u64 {
        self.index.value_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End time of the last stored value.
    pub fn last_end_time(&self) -> Option<Timestamp> {
        self.index.last_chunk().map(|c| c.last_end_time)
    }

    pub fn has_update_marker(&self) -> bool {
        self.dir.join(UPDATE_MARKER).exists()
    }

    pub(crate) fn write_update_marker(&self) -> Result<(), DbError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(UPDATE_MARKER);
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        f.sync_all()?;
        sync_parent_dir(&path)
    }

    pub(crate) fn clear_update_marker(&self) -> Result<(), DbError> {
        let path = self.dir.join(UPDATE_MARKER);
        match fs::remove_file(&path) {
            Ok(()) => sync_parent_dir(&path),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Cheap structural check of the index tables against the chunk files.
    pub fn check_consistency(&self) -> Result<(), DbError> {
        self.index
            .check_consistency(&self.dir)
            .map_err(|e| e.for_series(&self.label))
    }

    fn decode(&self, bytes: &[u8]) -> Result<V, DbError> {
        self.serde.decode(bytes).map_err(|e| match e {
            DbError::Serialization(details) => DbError::corruption(details),
            other => other,
        })
    }

    /// Pins the decoded chunk, reading and validating the file on a cache miss.
    pub(crate) fn load_chunk(&self, desc: &ChunkDescriptor) -> Result<ChunkHandle<V>, DbError> {
        let key = CacheKey::new(Arc::clone(&self.namespace), desc.id.seq);
        self.cache
            .get(key, |buf| {
                let path = self.dir.join(&desc.file_name);
                let bytes = fs::read(&path).map_err(|e| {
                    DbError::corruption(format!("Chunk file {:?} unreadable: {}", path, e))
                })?;
                if bytes.len() as u64 != desc.byte_len || crc32(&bytes) != desc.crc32 {
                    return Err(DbError::Corruption {
                        details: format!("Chunk file {:?} does not match its descriptor", path),
                        series: None,
                        timestamp: Some(desc.first_end_time),
                    });
                }
                let values = decode_chunk_into(&bytes, self.serde.as_ref(), buf)?;
                if values.len() != desc.value_count as usize {
                    return Err(DbError::corruption(format!(
                        "Chunk {:?} holds {} values, descriptor says {}",
                        path,
                        values.len(),
                        desc.value_count
                    )));
                }
                Ok(values)
            })
            .map_err(|e| e.for_series(&self.label))
    }

    pub(crate) fn load_chunk_at(&self, pos: usize) -> Result<ChunkHandle<V>, DbError> {
        let desc = self.index.chunk_at(pos).ok_or_else(|| {
            DbError::Internal(format!("Chunk position {} out of bounds", pos))
        })?;
        self.load_chunk(desc)
    }

    pub(crate) fn chunk_positions(
        &self,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Range<usize> {
        self.index.overlapping_positions(from, to)
    }

    pub fn first_value(&self) -> Result<Option<V>, DbError> {
        self.value_at(0)
    }

    /// Served from the latest table; never opens a chunk.
    pub fn last_value(&self) -> Result<Option<V>, DbError> {
        let Some(last) = self.index.last_chunk() else {
            return Ok(None);
        };
        let bytes = self.index.latest_at(last.last_end_time).ok_or_else(|| {
            DbError::Corruption {
                details: "Missing latest entry for last chunk".to_string(),
                series: Some(self.label.clone()),
                timestamp: Some(last.last_end_time),
            }
        })?;
        self.decode(bytes).map(Some)
    }

    pub fn value_at(&self, ordinal: u64) -> Result<Option<V>, DbError> {
        let Some((_, desc)) = self.index.chunk_for_ordinal(ordinal) else {
            return Ok(None);
        };
        let handle = self.load_chunk(desc)?;
        let i = (ordinal - desc.first_ordinal) as usize;
        Ok(handle.get(i).cloned())
    }

    /// Ordinal of the last value ending at or before `t`.
    pub fn floor_ordinal(&self, t: Timestamp) -> Result<Option<u64>, DbError> {
        let Some(desc) = self.index.floor_chunk(t) else {
            return Ok(None);
        };
        if desc.last_end_time <= t {
            return Ok(Some(desc.last_ordinal()));
        }
        let handle = self.load_chunk(desc)?;
        match handle.floor_index(t) {
            Some(i) => Ok(Some(desc.first_ordinal + i as u64)),
            None => Err(self.misplaced(desc, t)),
        }
    }

    /// Ordinal of the first value ending at or after `t`.
    pub fn ceiling_ordinal(&self, t: Timestamp) -> Result<Option<u64>, DbError> {
        let Some(desc) = self.index.ceiling_chunk(t) else {
            return Ok(None);
        };
        if desc.first_end_time >= t {
            return Ok(Some(desc.first_ordinal));
        }
        let handle = self.load_chunk(desc)?;
        match handle.ceiling_index(t) {
            Some(i) => Ok(Some(desc.first_ordinal + i as u64)),
            None => Err(self.misplaced(desc, t)),
        }
    }

    fn misplaced(&self, desc: &ChunkDescriptor, t: Timestamp) -> DbError {
        DbError::Corruption {
            details: format!("Chunk {} contents disagree with its time bounds", desc.file_name),
            series: Some(self.label.clone()),
            timestamp: Some(t),
        }
    }

    /// Value as of `t`: the last value ending at or before `t`, or the first value when `t`
    /// precedes the series.
    pub fn latest_value(&self, t: Timestamp) -> Result<Option<V>, DbError> {
        if self.is_empty() {
            return Ok(None);
        }
        if t == MAX_TIME {
            return self.last_value();
        }
        if t == MIN_TIME {
            return self.first_value();
        }
        let Some(desc) = self.index.floor_chunk(t) else {
            return self.first_value();
        };
        if desc.last_end_time <= t {
            if let Some(bytes) = self.index.latest_at(desc.last_end_time) {
                return self.decode(bytes).map(Some);
            }
        }
        let handle = self.load_chunk(desc)?;
        match handle.latest_value(t) {
            Some(v) => Ok(Some(v.clone())),
            None => Err(self.misplaced(desc, t)),
        }
    }

    /// Value `n` positions before the value as of `t`, clamped to the first value.
    pub fn previous_value(&self, t: Timestamp, n: u32) -> Result<Option<V>, DbError> {
        if self.is_empty() {
            return Ok(None);
        }
        if n > 0 {
            if let Some(bytes) = self.index.exact_shift(t, n, ShiftDirection::Previous) {
                return self.decode(bytes).map(Some);
            }
        }
        match self.floor_ordinal(t)? {
            Some(i) => self.value_at(i.saturating_sub(u64::from(n))),
            None => self.first_value(),
        }
    }

    /// Value `n` positions after the first value ending at or after `t`, clamped to the
    /// last value.
    pub fn next_value(&self, t: Timestamp, n: u32) -> Result<Option<V>, DbError> {
        if self.is_empty() {
            return Ok(None);
        }
        if n > 0 {
            if let Some(bytes) = self.index.exact_shift(t, n, ShiftDirection::Next) {
                return self.decode(bytes).map(Some);
            }
        }
        match self.ceiling_ordinal(t)? {
            Some(j) => {
                let last = self.len() - 1;
                self.value_at(j.saturating_add(u64::from(n)).min(last))
            }
            None => self.last_value(),
        }
    }

    /// Writes `values` as one new chunk file and registers it in the index.
    pub(crate) fn append_chunk(
        &mut self,
        values: &[V],
        compression: ChunkCompression,
    ) -> Result<ChunkDescriptor, DbError> {
        let (Some(first), Some(last)) = (values.first(), values.last()) else {
            return Err(DbError::Internal("Cannot append an empty chunk".to_string()));
        };
        let bytes = encode_chunk(values, self.serde.as_ref(), compression)?;
        let seq = self.next_seq;
        let file_name = chunk_file_name(seq);

        fs::create_dir_all(&self.tmp_dir)?;
        let tmp_path = self.tmp_dir.join(format!("{}.tmp", file_name));
        let final_path = self.dir.join(&file_name);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        sync_parent_dir(&final_path)?;

        let desc = ChunkDescriptor {
            id: ChunkId {
                first_end_time: first.end_time(),
                seq,
            },
            file_name,
            first_ordinal: self.index.value_count(),
            value_count: values.len() as u32,
            first_start_time: first.start_time(),
            first_end_time: first.end_time(),
            last_end_time: last.end_time(),
            byte_len: bytes.len() as u64,
            crc32: crc32(&bytes),
        };
        self.index.put_chunk(desc.clone())?;
        self.index
            .put_latest(desc.last_end_time, self.serde.to_bytes(last)?);
        self.next_seq += 1;
        Ok(desc)
    }

    /// Takes the tail chunk back out of the series when it holds fewer than `flush_size`
    /// values and returns its values, so the caller can rewrite them merged with new ones.
    /// Only called inside a marker-protected update run.
    pub(crate) fn reopen_tail_chunk(&mut self, flush_size: usize) -> Result<Vec<V>, DbError> {
        let Some(tail) = self.index.last_chunk() else {
            return Ok(Vec::new());
        };
        if tail.value_count as usize >= flush_size {
            return Ok(Vec::new());
        }
        let values = self.load_chunk(tail)?.to_vec();
        let Some(tail) = self.index.pop_last_chunk() else {
            return Ok(Vec::new());
        };
        self.cache
            .invalidate(&CacheKey::new(Arc::clone(&self.namespace), tail.id.seq));

        // a tail made only of values at the previous chunk's last time shared its latest key
        if let Some(prev) = self.index.last_chunk().cloned() {
            if prev.last_end_time == tail.last_end_time {
                let handle = self.load_chunk(&prev)?;
                if let Some(last) = handle.last() {
                    let bytes = self.serde.to_bytes(last)?;
                    self.index.put_latest(prev.last_end_time, bytes);
                }
            }
        }

        let path = self.dir.join(&tail.file_name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(values)
    }

    pub(crate) fn put_shift(
        &mut self,
        direction: ShiftDirection,
        time: Timestamp,
        units: u32,
        value: &V,
    ) -> Result<(), DbError> {
        let bytes = self.serde.to_bytes(value)?;
        self.index.put_shift(direction, time, units, bytes);
        Ok(())
    }

    pub(crate) fn commit(&mut self) -> Result<(), DbError> {
        self.index.commit()
    }

    /// Removes every file of the series and resets it to empty. Idempotent.
    pub fn delete_all(&mut self) -> Result<(), DbError> {
        self.cache.invalidate_series(&self.namespace);
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                if let Some(parent) = self.dir.parent() {
                    if parent.exists() {
                        sync_parent_dir(&self.dir)?;
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.index = SeriesIndex::open(&self.dir, &self.tmp_dir)?;
        self.next_seq = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_cache::FileCacheConfig;
    use crate::serde_codec::DataPointSerde;
    use crate::types::DataPoint;
    use tempfile::tempdir;

    fn open(root: &Path) -> SeriesStorage<DataPoint> {
        SeriesStorage::open(
            root,
            "6b6579",
            "key".to_string(),
            Arc::new(DataPointSerde),
            FileBufferCache::new(FileCacheConfig::default()),
        )
        .unwrap()
    }

    fn pts(times: &[u64]) -> Vec<DataPoint> {
        times.iter().map(|&t| DataPoint::new(t, t as f64)).collect()
    }

    fn filled(root: &Path) -> SeriesStorage<DataPoint> {
        let mut s = open(root);
        // chunks: [10 20 30] [40 50] [60 70 80]
        s.append_chunk(&pts(&[10, 20, 30]), ChunkCompression::Lz4).unwrap();
        s.append_chunk(&pts(&[40, 50]), ChunkCompression::None).unwrap();
        s.append_chunk(&pts(&[60, 70, 80]), ChunkCompression::Zstd { level: 1 })
            .unwrap();
        s.commit().unwrap();
        s
    }

    fn ts(v: Result<Option<DataPoint>, DbError>) -> Option<u64> {
        v.unwrap().map(|p| p.timestamp)
    }

    #[test]
    fn as_of_queries() {
        let dir = tempdir().unwrap();
        let s = filled(dir.path());
        assert_eq!(s.len(), 8);
        assert_eq!(ts(s.latest_value(MIN_TIME)), Some(10));
        assert_eq!(ts(s.latest_value(MAX_TIME)), Some(80));
        assert_eq!(ts(s.latest_value(5)), Some(10));
        assert_eq!(ts(s.latest_value(10)), Some(10));
        assert_eq!(ts(s.latest_value(35)), Some(30));
        assert_eq!(ts(s.latest_value(55)), Some(50));
        assert_eq!(ts(s.latest_value(65)), Some(60));
        assert_eq!(ts(s.latest_value(1_000)), Some(80));
    }

    #[test]
    fn ordinals() {
        let dir = tempdir().unwrap();
        let s = filled(dir.path());
        assert_eq!(s.floor_ordinal(9).unwrap(), None);
        assert_eq!(s.floor_ordinal(45).unwrap(), Some(3));
        assert_eq!(s.floor_ordinal(70).unwrap(), Some(6));
        assert_eq!(s.ceiling_ordinal(45).unwrap(), Some(4));
        assert_eq!(s.ceiling_ordinal(15).unwrap(), Some(1));
        assert_eq!(s.ceiling_ordinal(81).unwrap(), None);
        assert_eq!(ts(s.value_at(7)), Some(80));
        assert_eq!(ts(s.value_at(8)), None);
    }

    #[test]
    fn shifts_clamp() {
        let dir = tempdir().unwrap();
        let s = filled(dir.path());
        assert_eq!(ts(s.previous_value(70, 3)), Some(40));
        assert_eq!(ts(s.previous_value(70, 100)), Some(10));
        assert_eq!(ts(s.previous_value(1, 2)), Some(10));
        assert_eq!(ts(s.next_value(20, 2)), Some(40));
        assert_eq!(ts(s.next_value(21, 0)), Some(30));
        assert_eq!(ts(s.next_value(20, 100)), Some(80));
        assert_eq!(ts(s.next_value(500, 1)), Some(80));
    }

    #[test]
    fn shift_table_hit_wins() {
        let dir = tempdir().unwrap();
        let mut s = filled(dir.path());
        s.put_shift(ShiftDirection::Previous, 40, 1, &DataPoint::new(30, 30.0))
            .unwrap();
        assert_eq!(ts(s.previous_value(40, 1)), Some(30));
    }

    #[test]
    fn reopen_continues_sequence() {
        let dir = tempdir().unwrap();
        drop(filled(dir.path()));
        let mut s = open(dir.path());
        s.check_consistency().unwrap();
        assert_eq!(s.len(), 8);
        let d = s.append_chunk(&pts(&[90]), ChunkCompression::Lz4).unwrap();
        assert_eq!(d.id.seq, 3);
        assert_eq!(d.first_ordinal, 8);
    }

    #[test]
    fn reopened_tail_is_rewritten_as_one_chunk() {
        let dir = tempdir().unwrap();
        let mut s = filled(dir.path());
        // the tail [60 70 80] is full at flush size 3
        assert!(s.reopen_tail_chunk(3).unwrap().is_empty());
        assert_eq!(s.index().chunk_count(), 3);

        let mut merged = s.reopen_tail_chunk(4).unwrap();
        assert_eq!(merged, pts(&[60, 70, 80]));
        assert_eq!(s.len(), 5);
        assert!(!s.dir().join(chunk_file_name(2)).exists());

        merged.extend(pts(&[90]));
        let d = s.append_chunk(&merged, ChunkCompression::Lz4).unwrap();
        assert_eq!(d.first_ordinal, 5);
        assert_eq!(d.id.seq, 3);
        s.commit().unwrap();
        s.check_consistency().unwrap();
        assert_eq!(s.index().chunk_count(), 3);
        assert_eq!(ts(s.latest_value(85)), Some(80));
        assert_eq!(ts(s.value_at(8)), Some(90));
    }

    #[test]
    fn reopening_a_tail_that_shares_the_previous_end_time() {
        let dir = tempdir().unwrap();
        let mut s = open(dir.path());
        s.append_chunk(&pts(&[10, 20]), ChunkCompression::None).unwrap();
        s.append_chunk(&pts(&[20]), ChunkCompression::None).unwrap();
        s.commit().unwrap();

        let mut merged = s.reopen_tail_chunk(2).unwrap();
        assert_eq!(merged, pts(&[20]));
        merged.extend(pts(&[30]));
        s.append_chunk(&merged, ChunkCompression::None).unwrap();
        s.commit().unwrap();
        s.check_consistency().unwrap();
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn tampered_chunk_is_reported_as_corruption() {
        let dir = tempdir().unwrap();
        let s = filled(dir.path());
        let path = s.dir().join(chunk_file_name(1));
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xAA;
        fs::write(&path, &bytes).unwrap();
        let err = s.value_at(3).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn delete_all_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut s = filled(dir.path());
        s.write_update_marker().unwrap();
        assert!(s.has_update_marker());
        s.delete_all().unwrap();
        assert!(s.is_empty());
        assert!(!s.dir().exists());
        assert!(!s.has_update_marker());
        s.delete_all().unwrap();
        assert_eq!(ts(s.latest_value(50)), None);
    }
}
