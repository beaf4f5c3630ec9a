//! Per-series secondary indices: the chunk file lookup, the latest-value table and the two
//! shift tables (previous / next), plus the in-memory ordered list of chunk descriptors that
//! ordinal arithmetic runs against.

use crate::error::DbError;
use crate::table::{PersistentTable, TableBackend};
use crate::types::{ScanDirection, Timestamp};

use serde::{Deserialize, Serialize};
use std::ops::{Bound, Range};
use std::path::Path;

pub const FILES_TABLE: &str = "files.tbl";
pub const LATEST_TABLE: &str = "latest.tbl";
pub const PREVIOUS_TABLE: &str = "prev.tbl";
pub const NEXT_TABLE: &str = "next.tbl";

/// Orders chunks by the end time of their first value; `seq` breaks ties between chunks that
/// start on the same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    pub first_end_time: Timestamp,
    pub seq: u64,
}

/// Everything needed to locate and validate one chunk file without opening it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub id: ChunkId,
    pub file_name: String,
    /// Ordinal (series position) of the first value in the chunk.
    pub first_ordinal: u64,
    pub value_count: u32,
    pub first_start_time: Timestamp,
    pub first_end_time: Timestamp,
    pub last_end_time: Timestamp,
    pub byte_len: u64,
    pub crc32: u32,
}

impl ChunkDescriptor {
    pub fn last_ordinal(&self) -> u64 {
        self.first_ordinal + u64::from(self.value_count).saturating_sub(1)
    }

    /// One past the last ordinal.
    pub fn end_ordinal(&self) -> u64 {
        self.first_ordinal + u64::from(self.value_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftDirection {
    Previous,
    Next,
}

type ShiftKey = (Timestamp, u32);

/// The four index tables of one series.
#[derive(Debug)]
pub struct SeriesIndex {
    files: PersistentTable<ChunkId, ChunkDescriptor>,
    latest: PersistentTable<Timestamp, Vec<u8>>,
    previous: PersistentTable<ShiftKey, Vec<u8>>,
    next: PersistentTable<ShiftKey, Vec<u8>>,
    chunks: Vec<ChunkDescriptor>,
}

impl SeriesIndex {
    /// Loads the tables under `dir`; missing files mean an empty index.
    pub fn open(dir: &Path, tmp_dir: &Path) -> Result<Self, DbError> {
        let files: PersistentTable<ChunkId, ChunkDescriptor> =
            PersistentTable::open(dir.join(FILES_TABLE), tmp_dir)?;
        let latest = PersistentTable::open(dir.join(LATEST_TABLE), tmp_dir)?;
        let previous = PersistentTable::open(dir.join(PREVIOUS_TABLE), tmp_dir)?;
        let next = PersistentTable::open(dir.join(NEXT_TABLE), tmp_dir)?;
        let chunks = files
            .range(Bound::Unbounded, Bound::Unbounded, ScanDirection::Ascending)
            .map(|(_, d)| d.clone())
            .collect();
        Ok(Self {
            files,
            latest,
            previous,
            next,
            chunks,
        })
    }

    /// Registers a new tail chunk. Chunks must arrive in series order.
    pub fn put_chunk(&mut self, descriptor: ChunkDescriptor) -> Result<(), DbError> {
        if descriptor.value_count == 0 {
            return Err(DbError::Internal("Empty chunk descriptor".to_string()));
        }
        if descriptor.first_ordinal != self.value_count() {
            return Err(DbError::Internal(format!(
                "Chunk ordinal {} does not continue series of length {}",
                descriptor.first_ordinal,
                self.value_count()
            )));
        }
        if let Some(last) = self.chunks.last() {
            if descriptor.id <= last.id || descriptor.first_end_time < last.last_end_time {
                return Err(DbError::Internal(format!(
                    "Chunk {:?} does not follow {:?}",
                    descriptor.id, last.id
                )));
            }
        }
        self.files.put(descriptor.id, descriptor.clone());
        self.chunks.push(descriptor);
        Ok(())
    }

    /// Unregisters the tail chunk together with its latest entry and the shift entries keyed
    /// at its first end time. The chunk file itself is left to the caller.
    pub fn pop_last_chunk(&mut self) -> Option<ChunkDescriptor> {
        let last = self.chunks.pop()?;
        self.files.remove(&last.id);
        self.latest.remove(&last.last_end_time);
        remove_shifts_at(&mut self.previous, last.first_end_time);
        remove_shifts_at(&mut self.next, last.first_end_time);
        Some(last)
    }

    /// Records the encoded last value of the chunk ending at `last_end_time`.
    pub fn put_latest(&mut self, last_end_time: Timestamp, encoded: Vec<u8>) {
        self.latest.put(last_end_time, encoded);
    }

    pub fn put_shift(
        &mut self,
        direction: ShiftDirection,
        time: Timestamp,
        units: u32,
        encoded: Vec<u8>,
    ) {
        match direction {
            ShiftDirection::Previous => self.previous.put((time, units), encoded),
            ShiftDirection::Next => self.next.put((time, units), encoded),
        }
    }

    /// Last chunk whose first value ends at or before `t`.
    pub fn floor_chunk(&self, t: Timestamp) -> Option<&ChunkDescriptor> {
        let idx = self.chunks.partition_point(|c| c.first_end_time <= t);
        idx.checked_sub(1).map(|i| &self.chunks[i])
    }

    /// First chunk whose last value ends at or after `t`.
    pub fn ceiling_chunk(&self, t: Timestamp) -> Option<&ChunkDescriptor> {
        let idx = self.chunks.partition_point(|c| c.last_end_time < t);
        self.chunks.get(idx)
    }

    /// Greatest latest-table entry at or before `t`.
    pub fn floor_latest(&self, t: Timestamp) -> Option<(Timestamp, &[u8])> {
        self.latest.floor(&t).map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn latest_at(&self, t: Timestamp) -> Option<&[u8]> {
        self.latest.get(&t).map(Vec::as_slice)
    }

    /// Precomputed shift result for exactly `(t, units)`, if indexed.
    pub fn exact_shift(
        &self,
        t: Timestamp,
        units: u32,
        direction: ShiftDirection,
    ) -> Option<&[u8]> {
        let table = match direction {
            ShiftDirection::Previous => &self.previous,
            ShiftDirection::Next => &self.next,
        };
        table.get(&(t, units)).map(Vec::as_slice)
    }

    /// Positions (into the chunk list) of chunks overlapping closed bounds `[from, to]`.
    pub fn overlapping_positions(
        &self,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Range<usize> {
        let start = match from {
            Some(f) => self.chunks.partition_point(|c| c.last_end_time < f),
            None => 0,
        };
        let end = match to {
            Some(t) => self.chunks.partition_point(|c| c.first_end_time <= t),
            None => self.chunks.len(),
        };
        start..end.max(start)
    }

    pub fn scan_chunks(
        &self,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
        direction: ScanDirection,
    ) -> Box<dyn Iterator<Item = &ChunkDescriptor> + '_> {
        let slice = &self.chunks[self.overlapping_positions(from, to)];
        match direction {
            ScanDirection::Ascending => Box::new(slice.iter()),
            ScanDirection::Descending => Box::new(slice.iter().rev()),
        }
    }

    /// Chunk containing `ordinal`, with its position in the chunk list.
    pub fn chunk_for_ordinal(&self, ordinal: u64) -> Option<(usize, &ChunkDescriptor)> {
        let idx = self.chunks.partition_point(|c| c.first_ordinal <= ordinal);
        let pos = idx.checked_sub(1)?;
        let chunk = &self.chunks[pos];
        (ordinal < chunk.end_ordinal()).then_some((pos, chunk))
    }

    pub fn chunk_at(&self, pos: usize) -> Option<&ChunkDescriptor> {
        self.chunks.get(pos)
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn first_chunk(&self) -> Option<&ChunkDescriptor> {
        self.chunks.first()
    }

    pub fn last_chunk(&self) -> Option<&ChunkDescriptor> {
        self.chunks.last()
    }

    pub fn value_count(&self) -> u64 {
        self.chunks.last().map(ChunkDescriptor::end_ordinal).unwrap_or(0)
    }

    pub fn shift_entry_count(&self, direction: ShiftDirection) -> usize {
        match direction {
            ShiftDirection::Previous => self.previous.len(),
            ShiftDirection::Next => self.next.len(),
        }
    }

    pub fn latest_entry_count(&self) -> usize {
        self.latest.len()
    }

    /// Persists all four tables.
    pub fn commit(&mut self) -> Result<(), DbError> {
        self.files.flush()?;
        self.latest.flush()?;
        self.previous.flush()?;
        self.next.flush()?;
        Ok(())
    }

    /// Cross-checks the tables against each other and against the chunk files in `dir`.
    pub fn check_consistency(&self, dir: &Path) -> Result<(), DbError> {
        let mut expected_ordinal = 0u64;
        let mut prev: Option<&ChunkDescriptor> = None;
        for c in &self.chunks {
            if c.value_count == 0 {
                return Err(DbError::corruption(format!("Chunk {} is empty", c.file_name)));
            }
            if c.first_ordinal != expected_ordinal {
                return Err(DbError::corruption(format!(
                    "Chunk {} starts at ordinal {}, expected {}",
                    c.file_name, c.first_ordinal, expected_ordinal
                )));
            }
            if c.first_end_time > c.last_end_time || c.id.first_end_time != c.first_end_time {
                return Err(DbError::Corruption {
                    details: format!("Chunk {} has inconsistent time bounds", c.file_name),
                    series: None,
                    timestamp: Some(c.first_end_time),
                });
            }
            if let Some(p) = prev {
                if c.id <= p.id || c.first_end_time < p.last_end_time {
                    return Err(DbError::Corruption {
                        details: format!("Chunk {} overlaps {}", c.file_name, p.file_name),
                        series: None,
                        timestamp: Some(c.first_end_time),
                    });
                }
            }
            let path = dir.join(&c.file_name);
            let meta = std::fs::metadata(&path).map_err(|e| {
                DbError::corruption(format!("Chunk file {:?} unreadable: {}", path, e))
            })?;
            if meta.len() != c.byte_len {
                return Err(DbError::corruption(format!(
                    "Chunk file {:?} has {} bytes, expected {}",
                    path,
                    meta.len(),
                    c.byte_len
                )));
            }
            if self.latest.get(&c.last_end_time).is_none() {
                return Err(DbError::Corruption {
                    details: format!("No latest entry for chunk {}", c.file_name),
                    series: None,
                    timestamp: Some(c.last_end_time),
                });
            }
            expected_ordinal = c.end_ordinal();
            prev = Some(c);
        }

        let last_latest = self.latest.last().map(|(k, _)| *k);
        let last_chunk_end = self.chunks.last().map(|c| c.last_end_time);
        if last_latest != last_chunk_end {
            return Err(DbError::corruption(format!(
                "Latest table ends at {:?}, chunks end at {:?}",
                last_latest, last_chunk_end
            )));
        }
        let chunk_ends = self.chunks.len();
        let mut orphans = self
            .latest
            .range(Bound::Unbounded, Bound::Unbounded, ScanDirection::Ascending)
            .filter(|(k, _)| {
                let idx = self.chunks.partition_point(|c| c.last_end_time < **k);
                idx >= chunk_ends || self.chunks[idx].last_end_time != **k
            });
        if let Some((k, _)) = orphans.next() {
            return Err(DbError::Corruption {
                details: "Latest entry without a matching chunk".to_string(),
                series: None,
                timestamp: Some(*k),
            });
        }
        Ok(())
    }
}

fn remove_shifts_at(table: &mut PersistentTable<ShiftKey, Vec<u8>>, t: Timestamp) {
    let stale: Vec<ShiftKey> = table
        .range(
            Bound::Included(&(t, 0)),
            Bound::Included(&(t, u32::MAX)),
            ScanDirection::Ascending,
        )
        .map(|(k, _)| *k)
        .collect();
    for k in stale {
        table.remove(&k);
    }
}
