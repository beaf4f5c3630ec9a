//! Ordered key/value tables backing the per-series indices.
//!
//! [`MemoryTable`] is a plain `BTreeMap`. [`PersistentTable`] decorates any backend with
//! atomic, checksummed whole-file persistence.

use crate::chunk::{crc32, read_u32, read_u64};
use crate::error::DbError;
use crate::types::ScanDirection;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

/// Table file magic bytes.
pub const TABLE_MAGIC: &[u8; 8] = b"SDBTBL01";
const TABLE_VERSION: u32 = 1;

/// Ordered table operations used by the series indices.
pub trait TableBackend<K: Ord, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<&V>;

    /// Inserts or replaces.
    fn put(&mut self, key: K, value: V);

    fn remove(&mut self, key: &K) -> Option<V>;

    /// Greatest entry with key `<= key`.
    fn floor(&self, key: &K) -> Option<(&K, &V)>;

    /// Smallest entry with key `>= key`.
    fn ceiling(&self, key: &K) -> Option<(&K, &V)>;

    fn first(&self) -> Option<(&K, &V)>;

    fn last(&self) -> Option<(&K, &V)>;

    fn range<'a>(
        &'a self,
        from: Bound<&K>,
        to: Bound<&K>,
        direction: ScanDirection,
    ) -> Box<dyn Iterator<Item = (&'a K, &'a V)> + 'a>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

#[derive(Debug, Clone)]
pub struct MemoryTable<K, V> {
    map: BTreeMap<K, V>,
}

impl<K, V> Default for MemoryTable<K, V> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }
}

impl<K: Ord, V> MemoryTable<K, V> {
    pub fn new() -> Self {
        Self::default()
    }
}

// BTreeMap::range panics on inverted or empty-excluded bounds.
fn bounds_are_valid<K: Ord>(from: Bound<&K>, to: Bound<&K>) -> bool {
    match (from, to) {
        (Bound::Included(a), Bound::Included(b)) => a <= b,
        (Bound::Included(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b)) => a < b,
        (Bound::Excluded(a), Bound::Excluded(b)) => a < b,
        _ => true,
    }
}

impl<K, V> TableBackend<K, V> for MemoryTable<K, V>
where
    K: Ord + Send + Sync,
    V: Send + Sync,
{
    fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    fn put(&mut self, key: K, value: V) {
        self.map.insert(key, value);
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    fn floor(&self, key: &K) -> Option<(&K, &V)> {
        self.map
            .range((Bound::Unbounded, Bound::Included(key)))
            .next_back()
    }

    fn ceiling(&self, key: &K) -> Option<(&K, &V)> {
        self.map
            .range((Bound::Included(key), Bound::Unbounded))
            .next()
    }

    fn first(&self) -> Option<(&K, &V)> {
        self.map.iter().next()
    }

    fn last(&self) -> Option<(&K, &V)> {
        self.map.iter().next_back()
    }

    fn range<'a>(
        &'a self,
        from: Bound<&K>,
        to: Bound<&K>,
        direction: ScanDirection,
    ) -> Box<dyn Iterator<Item = (&'a K, &'a V)> + 'a> {
        if !bounds_are_valid(from, to) {
            return Box::new(std::iter::empty());
        }
        let iter = self.map.range((from, to));
        match direction {
            ScanDirection::Ascending => Box::new(iter),
            ScanDirection::Descending => Box::new(iter.rev()),
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn clear(&mut self) {
        self.map.clear();
    }
}

/// Wraps a backend and persists its full contents to a single file on [`flush`](Self::flush).
///
/// File layout: magic, version (u32), payload length (u64), payload CRC32 (u32), then the
/// bincode-encoded entries in key order. Writes go through a temp file, fsync, rename, and a
/// parent directory sync.
#[derive(Debug)]
pub struct PersistentTable<K, V, B = MemoryTable<K, V>> {
    inner: B,
    path: PathBuf,
    tmp_dir: PathBuf,
    dirty: bool,
    _marker: std::marker::PhantomData<fn() -> (K, V)>,
}

impl<K, V, B> PersistentTable<K, V, B>
where
    K: Ord + Serialize + DeserializeOwned + Send + Sync,
    V: Serialize + DeserializeOwned + Send + Sync,
    B: TableBackend<K, V> + Default,
{
    /// Opens the table at `path`, loading its entries if the file exists.
    pub fn open(path: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> Result<Self, DbError> {
        let path = path.into();
        let mut inner = B::default();
        match File::open(&path) {
            Ok(f) => {
                for (k, v) in read_table_file::<K, V>(&path, f)? {
                    inner.put(k, v);
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            inner,
            path,
            tmp_dir: tmp_dir.into(),
            dirty: false,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes the table to disk if it changed since the last flush.
    pub fn flush(&mut self) -> Result<(), DbError> {
        if !self.dirty {
            return Ok(());
        }
        let entries: Vec<(&K, &V)> = self
            .inner
            .range(Bound::Unbounded, Bound::Unbounded, ScanDirection::Ascending)
            .collect();
        let bytes = bincode::serialize(&entries)?;
        write_table_atomic(&self.path, &self.tmp_dir, &bytes)?;
        self.dirty = false;
        Ok(())
    }

    /// Clears the in-memory contents and removes the backing file.
    pub fn destroy(&mut self) -> Result<(), DbError> {
        self.inner.clear();
        self.dirty = false;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<K, V, B> TableBackend<K, V> for PersistentTable<K, V, B>
where
    K: Ord + Send + Sync,
    V: Send + Sync,
    B: TableBackend<K, V>,
{
    fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    fn put(&mut self, key: K, value: V) {
        self.inner.put(key, value);
        self.dirty = true;
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.inner.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    fn floor(&self, key: &K) -> Option<(&K, &V)> {
        self.inner.floor(key)
    }

    fn ceiling(&self, key: &K) -> Option<(&K, &V)> {
        self.inner.ceiling(key)
    }

    fn first(&self) -> Option<(&K, &V)> {
        self.inner.first()
    }

    fn last(&self) -> Option<(&K, &V)> {
        self.inner.last()
    }

    fn range<'a>(
        &'a self,
        from: Bound<&K>,
        to: Bound<&K>,
        direction: ScanDirection,
    ) -> Box<dyn Iterator<Item = (&'a K, &'a V)> + 'a> {
        self.inner.range(from, to, direction)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn clear(&mut self) {
        if !self.inner.is_empty() {
            self.dirty = true;
        }
        self.inner.clear();
    }
}

fn read_table_file<K: DeserializeOwned, V: DeserializeOwned>(
    path: &Path,
    f: File,
) -> Result<Vec<(K, V)>, DbError> {
    let mut r = BufReader::new(f);
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)
        .map_err(|_| DbError::corruption(format!("Truncated table header in {:?}", path)))?;
    if &magic != TABLE_MAGIC {
        return Err(DbError::corruption(format!("Bad table magic in {:?}", path)));
    }
    let version = read_u32(&mut r)?;
    if version != TABLE_VERSION {
        return Err(DbError::corruption(format!(
            "Unsupported table version {} in {:?}",
            version, path
        )));
    }
    let len = read_u64(&mut r)? as usize;
    let crc = read_u32(&mut r)?;
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(DbError::corruption(format!(
            "Table payload length {} does not match header {} in {:?}",
            buf.len(),
            len,
            path
        )));
    }
    if crc32(&buf) != crc {
        return Err(DbError::corruption(format!("Table CRC mismatch in {:?}", path)));
    }
    bincode::deserialize(&buf)
        .map_err(|e| DbError::corruption(format!("Undecodable table {:?}: {}", path, e)))
}

fn write_table_atomic(path: &Path, tmp_dir: &Path, payload: &[u8]) -> Result<(), DbError> {
    fs::create_dir_all(tmp_dir)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| DbError::Internal(format!("Table path without file name: {:?}", path)))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = tmp_dir.join(tmp_name);

    let mut w = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?,
    );
    w.write_all(TABLE_MAGIC)?;
    w.write_all(&TABLE_VERSION.to_le_bytes())?;
    w.write_all(&(payload.len() as u64).to_le_bytes())?;
    w.write_all(&crc32(payload).to_le_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    w.get_ref().sync_data()?;
    drop(w);

    fs::rename(&tmp_path, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

pub(crate) fn sync_parent_dir(path: &Path) -> Result<(), DbError> {
    let parent = path
        .parent()
        .ok_or_else(|| DbError::Internal("Missing parent dir".to_string()))?;
    let dir = File::open(parent)?;
    dir.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> MemoryTable<u64, String> {
        let mut t = MemoryTable::new();
        for k in [10u64, 20, 30] {
            t.put(k, format!("v{k}"));
        }
        t
    }

    #[test]
    fn floor_and_ceiling() {
        let t = sample();
        assert_eq!(t.floor(&5), None);
        assert_eq!(t.floor(&20).map(|(k, _)| *k), Some(20));
        assert_eq!(t.floor(&29).map(|(k, _)| *k), Some(20));
        assert_eq!(t.ceiling(&21).map(|(k, _)| *k), Some(30));
        assert_eq!(t.ceiling(&31), None);
        assert_eq!(t.first().map(|(k, _)| *k), Some(10));
        assert_eq!(t.last().map(|(k, _)| *k), Some(30));
    }

    #[test]
    fn range_directions_and_inverted_bounds() {
        let t = sample();
        let asc: Vec<u64> = t
            .range(Bound::Included(&10), Bound::Excluded(&30), ScanDirection::Ascending)
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(asc, vec![10, 20]);
        let desc: Vec<u64> = t
            .range(Bound::Unbounded, Bound::Unbounded, ScanDirection::Descending)
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(desc, vec![30, 20, 10]);
        assert_eq!(
            t.range(Bound::Included(&30), Bound::Included(&10), ScanDirection::Ascending)
                .count(),
            0
        );
        assert_eq!(
            t.range(Bound::Excluded(&20), Bound::Excluded(&20), ScanDirection::Ascending)
                .count(),
            0
        );
    }

    #[test]
    fn persistent_table_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbl");
        let tmp = dir.path().join("tmp");
        {
            let mut t: PersistentTable<u64, String> = PersistentTable::open(&path, &tmp).unwrap();
            assert!(t.is_empty());
            t.put(1, "a".to_string());
            t.put(2, "b".to_string());
            assert!(t.is_dirty());
            t.flush().unwrap();
            assert!(!t.is_dirty());
        }
        let t: PersistentTable<u64, String> = PersistentTable::open(&path, &tmp).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&2).map(String::as_str), Some("b"));
    }

    #[test]
    fn corrupted_table_file_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbl");
        let tmp = dir.path().join("tmp");
        let mut t: PersistentTable<u64, u64> = PersistentTable::open(&path, &tmp).unwrap();
        t.put(7, 70);
        t.flush().unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        fs::write(&path, &bytes).unwrap();

        let err = PersistentTable::<u64, u64>::open(&path, &tmp).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn destroy_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbl");
        let mut t: PersistentTable<u64, u64> =
            PersistentTable::open(&path, dir.path().join("tmp")).unwrap();
        t.put(1, 1);
        t.flush().unwrap();
        assert!(path.exists());
        t.destroy().unwrap();
        assert!(!path.exists());
        t.destroy().unwrap();
    }
}
