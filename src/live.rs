//! The open (still being written) segment of a series, held in memory.

use crate::error::DbError;
use crate::types::{TimeRange, TimedValue, Timestamp};

use std::iter::Rev;
use std::ops::Range;
use std::slice::Iter;

/// In-memory ordered values of one open segment, with the same query surface as stored
/// series.
#[derive(Debug, Clone)]
pub struct LiveSegment<V> {
    segment: TimeRange,
    values: Vec<V>,
}

impl<V: TimedValue> LiveSegment<V> {
    pub fn new(segment: TimeRange) -> Self {
        Self {
            segment,
            values: Vec::new(),
        }
    }

    pub(crate) fn with_values(segment: TimeRange, values: Vec<V>) -> Self {
        Self { segment, values }
    }

    pub fn segment(&self) -> TimeRange {
        self.segment
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[V] {
        &self.values
    }

    pub fn first(&self) -> Option<&V> {
        self.values.first()
    }

    pub fn last(&self) -> Option<&V> {
        self.values.last()
    }

    /// Appends a value ending inside the segment, no earlier than the current tail.
    pub fn push(&mut self, value: V, series: &str) -> Result<(), DbError> {
        let end = value.end_time();
        if !self.segment.contains(end) {
            return Err(DbError::Internal(format!(
                "Value at {} outside live segment [{}, {})",
                end, self.segment.start, self.segment.end
            )));
        }
        if let Some(last) = self.values.last() {
            if end < last.end_time() {
                return Err(DbError::OutOfOrder {
                    series: series.to_string(),
                    last: last.end_time(),
                    got: end,
                });
            }
        }
        self.values.push(value);
        Ok(())
    }

    pub fn floor_index(&self, t: Timestamp) -> Option<usize> {
        self.values
            .partition_point(|v| v.end_time() <= t)
            .checked_sub(1)
    }

    pub fn ceiling_index(&self, t: Timestamp) -> Option<usize> {
        let idx = self.values.partition_point(|v| v.end_time() < t);
        (idx < self.values.len()).then_some(idx)
    }

    /// Last value ending at or before `t`, if any.
    pub fn latest_value(&self, t: Timestamp) -> Option<&V> {
        self.floor_index(t).map(|i| &self.values[i])
    }

    /// `n` values before the value as of `t`, clamped to the first value.
    pub fn previous_value(&self, t: Timestamp, n: u32) -> Option<&V> {
        match self.floor_index(t) {
            Some(i) => self.values.get(i.saturating_sub(n as usize)),
            None => self.first(),
        }
    }

    /// `n` values after the first value ending at or after `t`, clamped to the last value.
    pub fn next_value(&self, t: Timestamp, n: u32) -> Option<&V> {
        match self.ceiling_index(t) {
            Some(j) => {
                let idx = j.saturating_add(n as usize).min(self.values.len() - 1);
                self.values.get(idx)
            }
            None => self.last(),
        }
    }

    pub fn range_bounds(&self, from: Option<Timestamp>, to: Option<Timestamp>) -> Range<usize> {
        let start = match from {
            Some(f) => self.values.partition_point(|v| v.end_time() < f),
            None => 0,
        };
        let end = match to {
            Some(t) => self.values.partition_point(|v| v.end_time() <= t),
            None => self.values.len(),
        };
        start..end.max(start)
    }

    pub fn range(&self, from: Option<Timestamp>, to: Option<Timestamp>) -> Iter<'_, V> {
        self.values[self.range_bounds(from, to)].iter()
    }

    pub fn range_rev(&self, from: Option<Timestamp>, to: Option<Timestamp>) -> Rev<Iter<'_, V>> {
        self.range(from, to).rev()
    }
}
