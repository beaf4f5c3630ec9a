use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// Timestamp type (nanoseconds since epoch).
pub type Timestamp = u64;

/// Probe time meaning "before everything"; as-of queries return the first value.
pub const MIN_TIME: Timestamp = 0;
/// Probe time meaning "after everything"; as-of queries return the last value.
pub const MAX_TIME: Timestamp = u64::MAX;

/// A value stored in a series. Series are ordered by `end_time`, non-decreasing.
pub trait TimedValue: Clone + Send + Sync + 'static {
    fn start_time(&self) -> Timestamp;
    fn end_time(&self) -> Timestamp;
}

/// Bounds required of a series key.
pub trait SeriesKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> SeriesKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// A single instantaneous measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl TimedValue for DataPoint {
    #[inline]
    fn start_time(&self) -> Timestamp {
        self.timestamp
    }
    #[inline]
    fn end_time(&self) -> Timestamp {
        self.timestamp
    }
}

/// A record covering `[start, end]` with an arbitrary payload (bars, intervals, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedRecord<T> {
    pub start: Timestamp,
    pub end: Timestamp,
    pub payload: T,
}

impl<T> TimedRecord<T> {
    pub fn new(start: Timestamp, end: Timestamp, payload: T) -> Self {
        Self {
            start,
            end,
            payload,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TimedValue for TimedRecord<T> {
    #[inline]
    fn start_time(&self) -> Timestamp {
        self.start
    }
    #[inline]
    fn end_time(&self) -> Timestamp {
        self.end
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        t >= self.start && t < self.end
    }
}

/// Iteration order for scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Ascending,
    Descending,
}

/// Returns true when closed bounds `[from, to]` (None = unbounded) admit any time at all.
#[inline]
pub(crate) fn bounds_admit_any(from: Option<Timestamp>, to: Option<Timestamp>) -> bool {
    match (from, to) {
        (Some(f), Some(t)) => f <= t,
        _ => true,
    }
}
