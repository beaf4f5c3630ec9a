//! Ingestion: pulls new values from an [`UpdateSource`], writes them as chunks, and
//! precomputes the latest and shift index entries.

use crate::chunk::ChunkCompression;
use crate::core::{DbConfig, SeriesHandle};
use crate::error::DbError;
use crate::index::{ChunkDescriptor, ShiftDirection};
use crate::storage::SeriesStorage;
use crate::telemetry::{db_metrics, DbEvent, DbEventListener};
use crate::types::{TimedValue, Timestamp, MIN_TIME};

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What to do when an update for the same series is already in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Wait for the running update, then run.
    #[default]
    Block,
    /// Wait at most `running_wait`, then skip this cycle.
    SkipIfRunning,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UpdateMode {
    /// Continue after the last stored value.
    #[default]
    Append,
    /// Drop existing storage and ingest everything the source yields.
    Rebuild,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UpdateStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Another update of the series was running (skip-if-running policy).
    AlreadyRunning,
    /// Readers held the series lock past `lock_timeout`.
    LockContended,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyRunning => f.write_str("already running"),
            SkipReason::LockContended => f.write_str("lock contended"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Completed { appended: u64, chunks: usize },
    /// The source had nothing newer than the stored tail.
    UpToDate,
    Skipped { reason: SkipReason },
}

/// Parameters of one update run.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateContext {
    pub policy: UpdatePolicy,
    pub mode: UpdateMode,
    pub lock_timeout: Duration,
    pub running_wait: Duration,
    /// Values per chunk.
    pub flush_size: usize,
    pub shift_index_units: Vec<u32>,
    pub compression: ChunkCompression,
}

impl Default for UpdateContext {
    fn default() -> Self {
        Self::from_config(&DbConfig::default())
    }
}

impl UpdateContext {
    pub fn from_config(config: &DbConfig) -> Self {
        Self {
            policy: config.update_policy,
            mode: UpdateMode::Append,
            lock_timeout: config.lock_timeout,
            running_wait: config.running_wait,
            flush_size: config.flush_size,
            shift_index_units: config.shift_index_units.clone(),
            compression: config.compression,
        }
    }

    pub fn with_mode(mut self, mode: UpdateMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_policy(mut self, policy: UpdatePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Supplies values for ingestion, lazily, in non-decreasing end-time order.
pub trait UpdateSource<V> {
    /// Values whose end time is at or after `from`.
    fn elements_from(
        &self,
        from: Timestamp,
    ) -> Result<Box<dyn Iterator<Item = Result<V, DbError>> + '_>, DbError>;
}

impl<V: TimedValue> UpdateSource<V> for [V] {
    fn elements_from(
        &self,
        from: Timestamp,
    ) -> Result<Box<dyn Iterator<Item = Result<V, DbError>> + '_>, DbError> {
        let start = self.partition_point(|v| v.end_time() < from);
        Ok(Box::new(self[start..].iter().cloned().map(Ok)))
    }
}

impl<V: TimedValue> UpdateSource<V> for Vec<V> {
    fn elements_from(
        &self,
        from: Timestamp,
    ) -> Result<Box<dyn Iterator<Item = Result<V, DbError>> + '_>, DbError> {
        self.as_slice().elements_from(from)
    }
}

/// Owned in-memory source.
#[derive(Debug, Clone, Default)]
pub struct VecSource<V>(pub Vec<V>);

impl<V: TimedValue> UpdateSource<V> for VecSource<V> {
    fn elements_from(
        &self,
        from: Timestamp,
    ) -> Result<Box<dyn Iterator<Item = Result<V, DbError>> + '_>, DbError> {
        self.0.as_slice().elements_from(from)
    }
}

/// Source backed by a closure `from -> iterator of values`.
pub struct FnSource<F>(pub F);

impl<V, F, I> UpdateSource<V> for FnSource<F>
where
    F: Fn(Timestamp) -> Result<I, DbError>,
    I: IntoIterator<Item = Result<V, DbError>>,
    I::IntoIter: 'static,
{
    fn elements_from(
        &self,
        from: Timestamp,
    ) -> Result<Box<dyn Iterator<Item = Result<V, DbError>> + '_>, DbError> {
        Ok(Box::new((self.0)(from)?.into_iter()))
    }
}

/// Runs one update of a series: guard, lock, self-heal, ingest, commit.
pub(crate) fn update_series<V: TimedValue>(
    handle: &SeriesHandle<V>,
    source: &dyn UpdateSource<V>,
    ctx: &UpdateContext,
    events: &dyn DbEventListener,
) -> Result<UpdateOutcome, DbError> {
    let label = handle.label();

    let _in_flight = match ctx.policy {
        UpdatePolicy::Block => handle.update_guard.lock(),
        UpdatePolicy::SkipIfRunning => match handle.update_guard.try_lock_for(ctx.running_wait) {
            Some(guard) => guard,
            None => return Ok(skipped(label, SkipReason::AlreadyRunning, events)),
        },
    };

    let Some(mut storage) = handle.storage.try_write_for(ctx.lock_timeout) else {
        return Ok(skipped(label, SkipReason::LockContended, events));
    };

    handle.set_status(UpdateStatus::Running);
    let started = Instant::now();
    let rebuild_required = handle.take_rebuild_required();

    match ingest(&mut storage, source, ctx, rebuild_required, events) {
        Ok(outcome) => {
            handle.set_status(UpdateStatus::Completed);
            let duration = started.elapsed();
            db_metrics::record_update(duration);
            if let UpdateOutcome::Completed { appended, chunks } = outcome {
                db_metrics::record_ingested(appended, chunks as u64);
                info!(
                    series = label,
                    appended,
                    chunks,
                    total = storage.len(),
                    elapsed_ms = duration.as_millis() as u64,
                    "update completed"
                );
                events.on_event(DbEvent::UpdateCompleted {
                    series: label.to_string(),
                    appended,
                    chunks,
                    duration,
                });
            } else {
                debug!(series = label, "update found nothing new");
            }
            Ok(outcome)
        }
        Err(e) => {
            handle.set_status(UpdateStatus::Failed);
            db_metrics::record_update_failed();
            warn!(series = label, error = %e, "update failed, dropping series storage");
            if let Err(cleanup) = storage.delete_all() {
                warn!(series = label, error = %cleanup, "cleanup after failed update failed");
                handle.mark_rebuild_required();
            }
            events.on_event(DbEvent::UpdateFailed {
                series: label.to_string(),
                error: e.to_string(),
            });
            Err(DbError::IncompleteUpdate {
                series: label.to_string(),
                details: e.to_string(),
            })
        }
    }
}

fn skipped(label: &str, reason: SkipReason, events: &dyn DbEventListener) -> UpdateOutcome {
    debug!(series = label, %reason, "update skipped");
    db_metrics::record_update_skipped();
    events.on_event(DbEvent::UpdateSkipped {
        series: label.to_string(),
        reason,
    });
    UpdateOutcome::Skipped { reason }
}

fn ingest<V: TimedValue>(
    storage: &mut SeriesStorage<V>,
    source: &dyn UpdateSource<V>,
    ctx: &UpdateContext,
    rebuild_required: bool,
    events: &dyn DbEventListener,
) -> Result<UpdateOutcome, DbError> {
    let incomplete = storage.has_update_marker();
    if incomplete {
        warn!(series = storage.label(), "incomplete update detected, rebuilding series");
        db_metrics::record_self_heal();
        events.on_event(DbEvent::IncompleteUpdateDetected {
            series: storage.label().to_string(),
        });
    }
    if incomplete || rebuild_required || ctx.mode == UpdateMode::Rebuild {
        storage.delete_all()?;
    }

    let update_from = match storage.last_end_time() {
        Some(t) => match t.checked_add(1) {
            Some(from) => from,
            None => return Ok(UpdateOutcome::UpToDate),
        },
        None => MIN_TIME,
    };

    let flush_size = ctx.flush_size.max(1);
    let mut running_max = storage.last_end_time();
    let mut clipped = 0u64;
    let mut accept = |value: &V| {
        let end = value.end_time();
        if end < update_from || running_max.is_some_and(|max| end < max) {
            clipped += 1;
            return false;
        }
        running_max = Some(end);
        true
    };

    let mut values = source.elements_from(update_from)?;
    let mut first = None;
    for item in values.by_ref() {
        let value = item?;
        if accept(&value) {
            first = Some(value);
            break;
        }
    }
    let Some(first) = first else {
        if clipped > 0 {
            debug!(series = storage.label(), clipped, "skipped out-of-order values");
        }
        return Ok(UpdateOutcome::UpToDate);
    };

    // Something new arrived: from here on the run is marker-protected.
    storage.write_update_marker()?;
    let mut batch = storage.reopen_tail_chunk(flush_size)?;
    if !batch.is_empty() {
        debug!(series = storage.label(), reopened = batch.len(), "extending tail chunk");
    }
    batch.reserve(flush_size.min(1 << 16));
    let mut planner = ShiftPlanner::seeded(&ctx.shift_index_units, storage)?;
    let mut appended = 1u64;
    let mut chunks = 0usize;

    batch.push(first);
    loop {
        if batch.len() >= flush_size {
            flush_batch(storage, &mut planner, &batch, ctx.compression)?;
            chunks += 1;
            batch.clear();
        }
        let Some(item) = values.next() else {
            break;
        };
        let value = item?;
        if accept(&value) {
            batch.push(value);
            appended += 1;
        }
    }
    if !batch.is_empty() {
        flush_batch(storage, &mut planner, &batch, ctx.compression)?;
        chunks += 1;
    }
    if clipped > 0 {
        debug!(series = storage.label(), clipped, "skipped out-of-order values");
    }

    storage.commit()?;
    storage.clear_update_marker()?;
    Ok(UpdateOutcome::Completed { appended, chunks })
}

fn flush_batch<V: TimedValue>(
    storage: &mut SeriesStorage<V>,
    planner: &mut ShiftPlanner<V>,
    batch: &[V],
    compression: ChunkCompression,
) -> Result<(), DbError> {
    let desc = storage.append_chunk(batch, compression)?;
    for entry in planner.observe_chunk(&desc, batch) {
        storage.put_shift(entry.direction, entry.time, entry.units, &entry.value)?;
    }
    Ok(())
}

#[derive(Debug)]
struct ShiftEntry<V> {
    direction: ShiftDirection,
    time: Timestamp,
    units: u32,
    value: V,
}

#[derive(Debug)]
struct PendingNext {
    time: Timestamp,
    ordinal: u64,
    /// Index into `units` of the next unresolved shift.
    next_unit: usize,
}

/// Computes shift index entries for the first end time of every chunk, streaming.
///
/// Keeps the trailing `max_unit` values (and whatever pending next entries still need) so
/// both directions resolve without reading back chunks.
struct ShiftPlanner<V> {
    units: Vec<u32>,
    max_unit: u64,
    window: VecDeque<V>,
    window_start: u64,
    total: u64,
    first: Option<V>,
    prev_last_end: Option<Timestamp>,
    pending: Vec<PendingNext>,
}

impl<V: TimedValue> ShiftPlanner<V> {
    fn new(units: &[u32]) -> Self {
        let mut units: Vec<u32> = units.iter().copied().filter(|&u| u > 0).collect();
        units.sort_unstable();
        units.dedup();
        let max_unit = units.last().copied().map(u64::from).unwrap_or(0);
        Self {
            units,
            max_unit,
            window: VecDeque::new(),
            window_start: 0,
            total: 0,
            first: None,
            prev_last_end: None,
            pending: Vec::new(),
        }
    }

    /// Primes the window with the tail of already stored values.
    fn seeded(units: &[u32], storage: &SeriesStorage<V>) -> Result<Self, DbError> {
        let mut planner = Self::new(units);
        let total = storage.len();
        if total == 0 || planner.units.is_empty() {
            planner.total = total;
            planner.window_start = total;
            planner.prev_last_end = storage.last_end_time();
            return Ok(planner);
        }
        planner.first = storage.first_value()?;
        let start = total.saturating_sub(planner.max_unit);
        for ordinal in start..total {
            let value = storage.value_at(ordinal)?.ok_or_else(|| {
                DbError::corruption(format!("Missing value at ordinal {}", ordinal))
            })?;
            planner.window.push_back(value);
        }
        planner.window_start = start;
        planner.total = total;
        planner.prev_last_end = storage.last_end_time();
        Ok(planner)
    }

    fn value_at<'a>(&'a self, ordinal: u64, batch: &'a [V], batch_start: u64) -> Option<&'a V> {
        if ordinal >= batch_start {
            batch.get((ordinal - batch_start) as usize)
        } else {
            let offset = ordinal.checked_sub(self.window_start)?;
            self.window.get(offset as usize)
        }
    }

    fn observe_chunk(&mut self, desc: &ChunkDescriptor, batch: &[V]) -> Vec<ShiftEntry<V>> {
        let mut out = Vec::new();
        if self.units.is_empty() {
            self.total += batch.len() as u64;
            self.window_start = self.total;
            self.prev_last_end = Some(desc.last_end_time);
            return out;
        }

        let start = desc.first_ordinal;
        let t = desc.first_end_time;
        if self.first.is_none() {
            self.first = batch.first().cloned();
        }

        // Previous entries: only when no later chunk can add values at `t`.
        if desc.last_end_time > t {
            let floor = start + (batch.partition_point(|v| v.end_time() <= t) as u64 - 1);
            for &u in &self.units {
                let value = match floor.checked_sub(u64::from(u)) {
                    Some(target) => self.value_at(target, batch, start),
                    None => self.first.as_ref(),
                };
                if let Some(value) = value {
                    out.push(ShiftEntry {
                        direction: ShiftDirection::Previous,
                        time: t,
                        units: u,
                        value: value.clone(),
                    });
                }
            }
        }

        // Next entries: only when the ceiling of `t` is this chunk's first value.
        if self.prev_last_end.map_or(true, |prev| prev < t) {
            self.pending.push(PendingNext {
                time: t,
                ordinal: start,
                next_unit: 0,
            });
        }

        self.window.extend(batch.iter().cloned());
        self.total += batch.len() as u64;
        self.prev_last_end = Some(desc.last_end_time);

        let mut pending = std::mem::take(&mut self.pending);
        for p in pending.iter_mut() {
            while let Some(&u) = self.units.get(p.next_unit) {
                let target = p.ordinal + u64::from(u);
                if target >= self.total {
                    break;
                }
                let offset = (target - self.window_start) as usize;
                if let Some(value) = self.window.get(offset) {
                    out.push(ShiftEntry {
                        direction: ShiftDirection::Next,
                        time: p.time,
                        units: u,
                        value: value.clone(),
                    });
                }
                p.next_unit += 1;
            }
        }
        pending.retain(|p| p.next_unit < self.units.len());
        self.pending = pending;

        let keep_from = self
            .pending
            .iter()
            .map(|p| p.ordinal)
            .min()
            .unwrap_or(u64::MAX)
            .min(self.total.saturating_sub(self.max_unit));
        while self.window_start < keep_from && !self.window.is_empty() {
            self.window.pop_front();
            self.window_start += 1;
        }
        out
    }
}
