use std::sync::Arc;
use std::time::Duration;

use crate::types::TimeRange;
use crate::updater::SkipReason;

/// Structured, in-process event hook for observability.
///
/// The engine also logs through `tracing`; this hook lets embedders route lifecycle events to
/// their own sinks (alerting, audit logs, tests) without parsing log output.
pub trait DbEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: DbEvent);
}

/// Structured events emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum DbEvent {
    SeriesOpened {
        series: String,
        values: u64,
        chunks: usize,
    },

    UpdateCompleted {
        series: String,
        appended: u64,
        chunks: usize,
        duration: Duration,
    },
    UpdateSkipped {
        series: String,
        reason: SkipReason,
    },
    UpdateFailed {
        series: String,
        error: String,
    },

    /// A crashed update left its marker behind; the series is rebuilt.
    IncompleteUpdateDetected {
        series: String,
    },
    CorruptionDetected {
        series: String,
        details: String,
    },
    StorageDeleted {
        series: String,
    },

    SegmentClosed {
        series: String,
        segment: TimeRange,
        values: u64,
    },
    SegmentReopened {
        series: String,
        segment: TimeRange,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl DbEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: DbEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn DbEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing` at a level matching its severity.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl DbEventListener for TracingEventListener {
    fn on_event(&self, event: DbEvent) {
        match &event {
            DbEvent::UpdateFailed { .. }
            | DbEvent::IncompleteUpdateDetected { .. }
            | DbEvent::CorruptionDetected { .. } => tracing::warn!(?event, "seriesdb event"),
            DbEvent::UpdateSkipped { .. } => tracing::debug!(?event, "seriesdb event"),
            _ => tracing::info!(?event, "seriesdb event"),
        }
    }
}

/// Metrics instrumentation through the `metrics` facade.
///
/// Library-safe: every call is a no-op until the embedding application installs a recorder.
pub mod db_metrics {
    use super::Duration;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const INGESTED_VALUES: &str = "seriesdb_ingested_values";
    pub const CHUNKS_WRITTEN: &str = "seriesdb_chunks_written";
    pub const UPDATES_SKIPPED: &str = "seriesdb_updates_skipped";
    pub const UPDATES_FAILED: &str = "seriesdb_updates_failed";
    pub const SELF_HEALS: &str = "seriesdb_self_heals";
    pub const CACHE_HITS: &str = "seriesdb_chunk_cache_hits";
    pub const CACHE_MISSES: &str = "seriesdb_chunk_cache_misses";
    pub const CACHE_EVICTIONS: &str = "seriesdb_chunk_cache_evictions";
    pub const UPDATE_DURATION_SECONDS: &str = "seriesdb_update_duration_seconds";

    #[inline]
    pub fn record_ingested(values: u64, chunks: u64) {
        if values > 0 {
            ::metrics::counter!(INGESTED_VALUES).increment(values);
        }
        if chunks > 0 {
            ::metrics::counter!(CHUNKS_WRITTEN).increment(chunks);
        }
    }

    #[inline]
    pub fn record_update(duration: Duration) {
        ::metrics::histogram!(UPDATE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_update_skipped() {
        ::metrics::counter!(UPDATES_SKIPPED).increment(1);
    }

    #[inline]
    pub fn record_update_failed() {
        ::metrics::counter!(UPDATES_FAILED).increment(1);
    }

    #[inline]
    pub fn record_self_heal() {
        ::metrics::counter!(SELF_HEALS).increment(1);
    }

    #[inline]
    pub fn record_cache_hit() {
        ::metrics::counter!(CACHE_HITS).increment(1);
    }

    #[inline]
    pub fn record_cache_miss() {
        ::metrics::counter!(CACHE_MISSES).increment(1);
    }

    #[inline]
    pub fn record_cache_evictions(n: u64) {
        ::metrics::counter!(CACHE_EVICTIONS).increment(n);
    }

    /// Registers descriptions with the installed recorder. Call once after installing it.
    pub fn describe_all() {
        describe_counter!(
            INGESTED_VALUES,
            Unit::Count,
            "Total number of values written by update runs."
        );
        describe_counter!(
            CHUNKS_WRITTEN,
            Unit::Count,
            "Total number of chunk files written."
        );
        describe_counter!(
            UPDATES_SKIPPED,
            Unit::Count,
            "Update runs skipped because the series was busy."
        );
        describe_counter!(
            UPDATES_FAILED,
            Unit::Count,
            "Update runs that failed and dropped the series storage."
        );
        describe_counter!(
            SELF_HEALS,
            Unit::Count,
            "Series storages deleted after detecting an incomplete update or corruption."
        );
        describe_counter!(CACHE_HITS, Unit::Count, "Chunk cache hits.");
        describe_counter!(CACHE_MISSES, Unit::Count, "Chunk cache misses (chunk decoded).");
        describe_counter!(
            CACHE_EVICTIONS,
            Unit::Count,
            "Decoded chunks evicted from the cache."
        );
        describe_histogram!(
            UPDATE_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time of update runs holding the series write lock."
        );
    }
}
