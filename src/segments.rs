//! Historical / live split: closed, fixed-width segments are stored as ordinary series keyed
//! by [`SegmentedKey`], the open segment is a [`LiveSegment`] in memory, and reads merge
//! both into one ordered sequence.

use crate::core::{DbConfig, TimeSeriesDb};
use crate::cursor::SeriesCursor;
use crate::error::DbError;
use crate::live::LiveSegment;
use crate::serde_codec::{namespace_of, KeySerde, ValueSerde};
use crate::table::{PersistentTable, TableBackend};
use crate::telemetry::DbEvent;
use crate::types::{ScanDirection, SeriesKey, TimeRange, TimedValue, Timestamp};
use crate::updater::{UpdateContext, UpdateMode, UpdateOutcome, UpdatePolicy};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Subdirectory of `base_dir` holding the closed-segment registry of each key.
pub const SEGMENTS_DIR: &str = "segments";

const NANOS_PER_HOUR: u64 = 3_600 * 1_000_000_000;
const NANOS_PER_DAY: u64 = 24 * NANOS_PER_HOUR;

/// Maps a time to the half-open segment `[start, end)` containing it.
pub trait SegmentFinder: Send + Sync {
    fn segment_for(&self, t: Timestamp) -> TimeRange;
}

/// Fixed-width segments aligned on `origin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicSegmentFinder {
    origin: Timestamp,
    period: u64,
}

impl PeriodicSegmentFinder {
    pub fn new(origin: Timestamp, period: u64) -> Result<Self, DbError> {
        if period == 0 {
            return Err(DbError::ConfigError(
                "segment period must be > 0".to_string(),
            ));
        }
        Ok(Self { origin, period })
    }

    /// UTC hours since the epoch.
    pub fn hourly() -> Self {
        Self {
            origin: 0,
            period: NANOS_PER_HOUR,
        }
    }

    /// UTC days since the epoch.
    pub fn daily() -> Self {
        Self {
            origin: 0,
            period: NANOS_PER_DAY,
        }
    }

    pub fn period(&self) -> u64 {
        self.period
    }
}

impl SegmentFinder for PeriodicSegmentFinder {
    fn segment_for(&self, t: Timestamp) -> TimeRange {
        let start = if t >= self.origin {
            self.origin + (t - self.origin) / self.period * self.period
        } else {
            let back = (self.origin - t).div_ceil(self.period);
            self.origin.saturating_sub(back.saturating_mul(self.period))
        };
        TimeRange::new(start, start.saturating_add(self.period))
    }
}

/// Addresses one closed segment of a key in the historical store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentedKey<K> {
    pub key: K,
    pub segment: TimeRange,
}

impl<K> SegmentedKey<K> {
    pub fn new(key: K, segment: TimeRange) -> Self {
        Self { key, segment }
    }
}

/// Inner key bytes followed by segment start and end (u64 big-endian each).
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentedKeySerde<S> {
    inner: S,
}

impl<S> SegmentedKeySerde<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<K, S: KeySerde<K>> KeySerde<SegmentedKey<K>> for SegmentedKeySerde<S> {
    fn encode(&self, key: &SegmentedKey<K>) -> Vec<u8> {
        let mut out = self.inner.encode(&key.key);
        out.extend_from_slice(&key.segment.start.to_be_bytes());
        out.extend_from_slice(&key.segment.end.to_be_bytes());
        out
    }

    fn decode(&self, bytes: &[u8]) -> Result<SegmentedKey<K>, DbError> {
        let Some(split) = bytes.len().checked_sub(16) else {
            return Err(DbError::Serialization(format!(
                "Segmented key needs at least 16 bytes, got {}",
                bytes.len()
            )));
        };
        let (inner, bounds) = bytes.split_at(split);
        let mut start = [0u8; 8];
        let mut end = [0u8; 8];
        start.copy_from_slice(&bounds[..8]);
        end.copy_from_slice(&bounds[8..]);
        Ok(SegmentedKey {
            key: self.inner.decode(inner)?,
            segment: TimeRange::new(u64::from_be_bytes(start), u64::from_be_bytes(end)),
        })
    }
}

/// Registry entry of a closed segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedSegment {
    pub segment: TimeRange,
    pub value_count: u64,
    pub first_end_time: Timestamp,
    pub last_end_time: Timestamp,
}

struct KeyState<V> {
    label: String,
    closed: PersistentTable<Timestamp, ClosedSegment>,
    live: Option<LiveSegment<V>>,
}

impl<V: TimedValue> KeyState<V> {
    fn closed_segments(&self) -> Vec<ClosedSegment> {
        self.closed
            .range(Bound::Unbounded, Bound::Unbounded, ScanDirection::Ascending)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn last_end_time(&self) -> Option<Timestamp> {
        let live = self.live.as_ref().and_then(|l| l.last()).map(|v| v.end_time());
        live.or_else(|| self.closed.last().map(|(_, c)| c.last_end_time))
    }

    /// Closed segments and the live segment, in time order, with their global offsets.
    fn parts(&self) -> Vec<Part> {
        let mut parts = Vec::new();
        let mut offset = 0u64;
        for c in self.closed_segments() {
            if c.value_count == 0 {
                continue;
            }
            parts.push(Part {
                kind: PartKind::Closed(c.segment),
                offset,
                count: c.value_count,
                first_end: c.first_end_time,
                last_end: c.last_end_time,
            });
            offset += c.value_count;
        }
        if let Some(live) = self.live.as_ref() {
            if let (Some(first), Some(last)) = (live.first(), live.last()) {
                parts.push(Part {
                    kind: PartKind::Live,
                    offset,
                    count: live.len() as u64,
                    first_end: first.end_time(),
                    last_end: last.end_time(),
                });
            }
        }
        parts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    Closed(TimeRange),
    Live,
}

#[derive(Debug, Clone, Copy)]
struct Part {
    kind: PartKind,
    offset: u64,
    count: u64,
    first_end: Timestamp,
    last_end: Timestamp,
}

/// A time-series store whose series are split into closed historical segments plus one
/// in-memory live segment per key.
pub struct SegmentedTimeSeriesDb<K, V> {
    historical: TimeSeriesDb<SegmentedKey<K>, V>,
    finder: Arc<dyn SegmentFinder>,
    key_serde: Arc<dyn KeySerde<K>>,
    registry_dir: PathBuf,
    keys: Mutex<HashMap<K, Arc<RwLock<KeyState<V>>>>>,
}

impl<K: SeriesKey, V: TimedValue> SegmentedTimeSeriesDb<K, V> {
    pub fn open<S>(
        config: DbConfig,
        key_serde: S,
        value_serde: impl ValueSerde<V> + 'static,
        finder: impl SegmentFinder + 'static,
    ) -> Result<Self, DbError>
    where
        S: KeySerde<K> + Clone + 'static,
    {
        let registry_dir = config.base_dir.join(SEGMENTS_DIR);
        std::fs::create_dir_all(&registry_dir)?;
        let historical =
            TimeSeriesDb::open(config, SegmentedKeySerde::new(key_serde.clone()), value_serde)?;
        Ok(Self {
            historical,
            finder: Arc::new(finder),
            key_serde: Arc::new(key_serde),
            registry_dir,
            keys: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying store holding closed segments.
    pub fn historical(&self) -> &TimeSeriesDb<SegmentedKey<K>, V> {
        &self.historical
    }

    pub fn segment_for(&self, t: Timestamp) -> TimeRange {
        self.finder.segment_for(t)
    }

    fn state(&self, key: &K) -> Result<Arc<RwLock<KeyState<V>>>, DbError> {
        let mut keys = self.keys.lock();
        if let Some(s) = keys.get(key) {
            return Ok(Arc::clone(s));
        }
        let label = format!("{:?}", key);
        let ns = namespace_of(&self.key_serde.encode(key));
        let path = self.registry_dir.join(format!("{}.tbl", ns));
        let tmp = self.registry_dir.join("tmp");
        let closed = match PersistentTable::open(&path, &tmp) {
            Ok(table) if path.exists() => table,
            Ok(mut table) => {
                self.rebuild_registry(key, &mut table)?;
                table
            }
            Err(e) if e.is_corruption() => {
                warn!(series = %label, error = %e, "segment registry corrupted, rebuilding");
                std::fs::remove_file(&path)?;
                let mut table = PersistentTable::open(&path, &tmp)?;
                self.rebuild_registry(key, &mut table)?;
                table
            }
            Err(e) => return Err(e),
        };
        let state = Arc::new(RwLock::new(KeyState {
            label,
            closed,
            live: None,
        }));
        keys.insert(key.clone(), Arc::clone(&state));
        Ok(state)
    }

    /// Recovers the registry from the segments present in the historical store.
    fn rebuild_registry(
        &self,
        key: &K,
        table: &mut PersistentTable<Timestamp, ClosedSegment>,
    ) -> Result<(), DbError> {
        for skey in self.historical.list_series()? {
            if &skey.key != key {
                continue;
            }
            let (Some(first), Some(last)) = (
                self.historical.first_value(&skey)?,
                self.historical.last_value(&skey)?,
            ) else {
                continue;
            };
            table.put(
                skey.segment.start,
                ClosedSegment {
                    segment: skey.segment,
                    value_count: self.historical.len(&skey)?,
                    first_end_time: first.end_time(),
                    last_end_time: last.end_time(),
                },
            );
        }
        if !table.is_empty() {
            debug!(series = ?key, segments = table.len(), "segment registry recovered");
            table.flush()?;
        }
        Ok(())
    }

    /// Appends one value, closing the live segment first when the value lies past it.
    ///
    /// # Errors
    /// `OutOfOrder` when the value ends before the key's last value. If closing the live
    /// segment fails, the live segment is kept and the error returned.
    pub fn append(&self, key: &K, value: V) -> Result<(), DbError> {
        let state = self.state(key)?;
        let mut st = state.write();
        self.append_locked(key, &mut st, value)
    }

    pub fn append_all(&self, key: &K, values: impl IntoIterator<Item = V>) -> Result<u64, DbError> {
        let state = self.state(key)?;
        let mut st = state.write();
        let mut n = 0u64;
        for value in values {
            self.append_locked(key, &mut st, value)?;
            n += 1;
        }
        Ok(n)
    }

    fn append_locked(&self, key: &K, st: &mut KeyState<V>, value: V) -> Result<(), DbError> {
        let end = value.end_time();
        if let Some(last) = st.last_end_time() {
            if end < last {
                return Err(DbError::OutOfOrder {
                    series: st.label.clone(),
                    last,
                    got: end,
                });
            }
        }
        let segment = self.finder.segment_for(end);
        let current = st.live.as_ref().map(LiveSegment::segment);
        if current != Some(segment) {
            if current.is_some() {
                self.close_live(key, st)?;
            }
            let reopened = st.closed.get(&segment.start).cloned();
            st.live = Some(match reopened {
                Some(closed) => self.reopen(key, st, closed)?,
                None => LiveSegment::new(segment),
            });
        }
        match st.live.as_mut() {
            Some(live) => live.push(value, &st.label),
            None => Err(DbError::Internal("Live segment missing".to_string())),
        }
    }

    /// Moves a closed segment back into memory so late values for it can be appended.
    fn reopen(
        &self,
        key: &K,
        st: &mut KeyState<V>,
        closed: ClosedSegment,
    ) -> Result<LiveSegment<V>, DbError> {
        let skey = SegmentedKey::new(key.clone(), closed.segment);
        let values = self
            .historical
            .range_values(&skey, None, None)?
            .collect::<Result<Vec<V>, DbError>>()?;
        self.historical.delete_all(&skey)?;
        st.closed.remove(&closed.segment.start);
        st.closed.flush()?;
        debug!(series = %st.label, start = closed.segment.start, "closed segment reopened");
        self.historical
            .config()
            .event_listener
            .on_event(DbEvent::SegmentReopened {
                series: st.label.clone(),
                segment: closed.segment,
            });
        Ok(LiveSegment::with_values(closed.segment, values))
    }

    /// Writes the live segment through the updater as a closed segment.
    fn close_live(&self, key: &K, st: &mut KeyState<V>) -> Result<(), DbError> {
        let Some(live) = st.live.take() else {
            return Ok(());
        };
        let (Some(first), Some(last)) = (live.first(), live.last()) else {
            return Ok(());
        };
        let (first_end, last_end) = (first.end_time(), last.end_time());
        let segment = live.segment();
        let skey = SegmentedKey::new(key.clone(), segment);
        let ctx = UpdateContext::from_config(self.historical.config())
            .with_mode(UpdateMode::Rebuild)
            .with_policy(UpdatePolicy::Block);

        let source = live.values().to_vec();
        let result = self.historical.update_with(&skey, &source, &ctx);
        let appended = match result {
            Ok(UpdateOutcome::Completed { appended, .. }) => appended,
            Ok(UpdateOutcome::Skipped { reason }) => {
                st.live = Some(live);
                debug!(series = %st.label, %reason, "segment close deferred");
                return Err(DbError::LockTimeout {
                    series: st.label.clone(),
                    waited: ctx.lock_timeout,
                });
            }
            Ok(UpdateOutcome::UpToDate) => {
                st.live = Some(live);
                return Err(DbError::Internal(
                    "Closing a non-empty live segment wrote nothing".to_string(),
                ));
            }
            Err(e) => {
                st.live = Some(live);
                return Err(e);
            }
        };

        st.closed.put(
            segment.start,
            ClosedSegment {
                segment,
                value_count: appended,
                first_end_time: first_end,
                last_end_time: last_end,
            },
        );
        if let Err(e) = st.closed.flush() {
            st.closed.remove(&segment.start);
            st.live = Some(live);
            return Err(e);
        }
        info!(
            series = %st.label,
            start = segment.start,
            end = segment.end,
            values = appended,
            "segment closed"
        );
        self.historical
            .config()
            .event_listener
            .on_event(DbEvent::SegmentClosed {
                series: st.label.clone(),
                segment,
                values: appended,
            });
        Ok(())
    }

    /// Closes the live segment if `now` has reached its end. Returns whether it was closed.
    pub fn close_expired_segments(&self, key: &K, now: Timestamp) -> Result<bool, DbError> {
        let state = self.state(key)?;
        let mut st = state.write();
        let expired = st.live.as_ref().is_some_and(|l| l.segment().end <= now);
        if !expired {
            return Ok(false);
        }
        self.close_live(key, &mut st)?;
        Ok(true)
    }

    pub fn closed_segments(&self, key: &K) -> Result<Vec<ClosedSegment>, DbError> {
        let state = self.state(key)?;
        let st = state.read();
        Ok(st.closed_segments())
    }

    /// Number of values in the live segment.
    pub fn live_len(&self, key: &K) -> Result<usize, DbError> {
        let state = self.state(key)?;
        let st = state.read();
        Ok(st.live.as_ref().map(LiveSegment::len).unwrap_or(0))
    }

    pub fn len(&self, key: &K) -> Result<u64, DbError> {
        let state = self.state(key)?;
        let st = state.read();
        Ok(st.parts().iter().map(|p| p.count).sum())
    }

    fn part_value_at(
        &self,
        key: &K,
        st: &KeyState<V>,
        part: &Part,
        local: u64,
    ) -> Result<Option<V>, DbError> {
        match part.kind {
            PartKind::Closed(segment) => self
                .historical
                .value_at(&SegmentedKey::new(key.clone(), segment), local),
            PartKind::Live => Ok(st
                .live
                .as_ref()
                .and_then(|l| l.values().get(local as usize).cloned())),
        }
    }

    fn global_value_at(
        &self,
        key: &K,
        st: &KeyState<V>,
        parts: &[Part],
        ordinal: u64,
    ) -> Result<Option<V>, DbError> {
        let idx = parts.partition_point(|p| p.offset <= ordinal);
        let Some(part) = idx.checked_sub(1).map(|i| &parts[i]) else {
            return Ok(None);
        };
        self.part_value_at(key, st, part, ordinal - part.offset)
    }

    /// Value as of `t` across closed and live segments.
    pub fn get_latest_value(&self, key: &K, t: Timestamp) -> Result<Option<V>, DbError> {
        let state = self.state(key)?;
        let st = state.read();
        let parts = st.parts();
        let Some(first_part) = parts.first() else {
            return Ok(None);
        };
        let idx = parts.partition_point(|p| p.first_end <= t);
        let part = match idx.checked_sub(1) {
            Some(i) => &parts[i],
            None => return self.part_value_at(key, &st, first_part, 0),
        };
        match part.kind {
            PartKind::Closed(segment) => self
                .historical
                .get_latest_value(&SegmentedKey::new(key.clone(), segment), t),
            PartKind::Live => Ok(st
                .live
                .as_ref()
                .and_then(|l| l.latest_value(t))
                .cloned()),
        }
    }

    /// The `n`th value before the value as of `t`, across segments, clamped to the first
    /// value.
    pub fn get_previous_value(
        &self,
        key: &K,
        t: Timestamp,
        n: u32,
    ) -> Result<Option<V>, DbError> {
        let state = self.state(key)?;
        let st = state.read();
        let parts = st.parts();
        if parts.is_empty() {
            return Ok(None);
        }
        let idx = parts.partition_point(|p| p.first_end <= t);
        let Some(part) = idx.checked_sub(1).map(|i| &parts[i]) else {
            return self.global_value_at(key, &st, &parts, 0);
        };
        let local = match part.kind {
            PartKind::Closed(segment) => {
                let skey = SegmentedKey::new(key.clone(), segment);
                let local = self.historical.floor_ordinal(&skey, t)?;
                match local {
                    Some(i) if i >= u64::from(n) => {
                        return self.historical.get_previous_value(&skey, t, n);
                    }
                    other => other,
                }
            }
            PartKind::Live => st
                .live
                .as_ref()
                .and_then(|l| l.floor_index(t))
                .map(|i| i as u64),
        };
        let global = part.offset + local.unwrap_or(0);
        self.global_value_at(key, &st, &parts, global.saturating_sub(u64::from(n)))
    }

    /// The `n`th value after the first value ending at or after `t`, across segments,
    /// clamped to the last value.
    pub fn get_next_value(&self, key: &K, t: Timestamp, n: u32) -> Result<Option<V>, DbError> {
        let state = self.state(key)?;
        let st = state.read();
        let parts = st.parts();
        let Some(tail) = parts.last() else {
            return Ok(None);
        };
        let total = tail.offset + tail.count;
        let idx = parts.partition_point(|p| p.last_end < t);
        let Some(part) = parts.get(idx) else {
            return self.global_value_at(key, &st, &parts, total - 1);
        };
        let local = match part.kind {
            PartKind::Closed(segment) => {
                let skey = SegmentedKey::new(key.clone(), segment);
                let local = self.historical.ceiling_ordinal(&skey, t)?;
                match local {
                    Some(j) if j + u64::from(n) < part.count => {
                        return self.historical.get_next_value(&skey, t, n);
                    }
                    other => other,
                }
            }
            PartKind::Live => st
                .live
                .as_ref()
                .and_then(|l| l.ceiling_index(t))
                .map(|i| i as u64),
        };
        let global = part.offset + local.unwrap_or(0);
        let target = global.saturating_add(u64::from(n)).min(total - 1);
        self.global_value_at(key, &st, &parts, target)
    }

    /// Ascending values in `[from, to]` across closed segments and the live tail.
    ///
    /// Closed segments are read lazily, each under its own read lock while being iterated.
    /// The live values in range are copied when the cursor is created.
    pub fn range_values(
        &self,
        key: &K,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<SegmentedCursor<V>, DbError> {
        self.cursor(key, from, to, ScanDirection::Ascending)
    }

    pub fn range_reverse_values(
        &self,
        key: &K,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<SegmentedCursor<V>, DbError> {
        self.cursor(key, from, to, ScanDirection::Descending)
    }

    fn cursor(
        &self,
        key: &K,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
        direction: ScanDirection,
    ) -> Result<SegmentedCursor<V>, DbError> {
        if let (Some(start), Some(end)) = (from, to) {
            if start > end {
                return Err(DbError::InvalidTimeRange { start, end });
            }
        }
        let state = self.state(key)?;
        let st = state.read();
        let mut parts = VecDeque::new();
        for c in st.closed_segments() {
            let overlaps = from.map_or(true, |f| c.last_end_time >= f)
                && to.map_or(true, |t| c.first_end_time <= t);
            if !overlaps || c.value_count == 0 {
                continue;
            }
            let skey = SegmentedKey::new(key.clone(), c.segment);
            let cursor = match direction {
                ScanDirection::Ascending => self.historical.range_values(&skey, from, to)?,
                ScanDirection::Descending => {
                    self.historical.range_reverse_values(&skey, from, to)?
                }
            };
            parts.push_back(CursorPart::Historical(cursor));
        }
        if let Some(live) = st.live.as_ref() {
            let values: Vec<V> = match direction {
                ScanDirection::Ascending => live.range(from, to).cloned().collect(),
                ScanDirection::Descending => live.range_rev(from, to).cloned().collect(),
            };
            if !values.is_empty() {
                parts.push_back(CursorPart::Live(values.into_iter()));
            }
        }
        if direction == ScanDirection::Descending {
            parts = parts.into_iter().rev().collect();
        }
        Ok(SegmentedCursor { parts })
    }

    /// Deletes every closed segment and the live segment of `key`.
    ///
    /// # Errors
    /// `LockTimeout` (retryable) when open cursors hold a closed segment; segments deleted
    /// before the failure stay deleted.
    pub fn delete_all(&self, key: &K) -> Result<(), DbError> {
        let state = self.state(key)?;
        let mut st = state.write();
        st.live = None;
        for c in st.closed_segments() {
            let skey = SegmentedKey::new(key.clone(), c.segment);
            if let Err(e) = self.historical.delete_all(&skey) {
                st.closed.flush()?;
                return Err(e);
            }
            st.closed.remove(&c.segment.start);
        }
        st.closed.destroy()?;
        info!(series = %st.label, "segmented series deleted");
        Ok(())
    }
}

enum CursorPart<V: TimedValue> {
    Historical(SeriesCursor<V>),
    Live(std::vec::IntoIter<V>),
}

/// Ordered iteration over the parts of a segmented series. Dropping or closing it releases
/// every segment read lock it holds.
pub struct SegmentedCursor<V: TimedValue> {
    parts: VecDeque<CursorPart<V>>,
}

impl<V: TimedValue> SegmentedCursor<V> {
    pub fn close(&mut self) {
        self.parts.clear();
    }
}

impl<V: TimedValue> Iterator for SegmentedCursor<V> {
    type Item = Result<V, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = match self.parts.front_mut()? {
                CursorPart::Historical(cursor) => cursor.next(),
                CursorPart::Live(values) => values.next().map(Ok),
            };
            match item {
                Some(Err(e)) => {
                    self.close();
                    return Some(Err(e));
                }
                Some(ok) => return Some(ok),
                None => {
                    self.parts.pop_front();
                }
            }
        }
    }
}

impl<V: TimedValue> std::fmt::Debug for SegmentedCursor<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedCursor")
            .field("remaining_parts", &self.parts.len())
            .finish()
    }
}
