#![doc = include_str!("../README.md")]
// Declare modules
pub mod chunk;
pub mod config;
pub mod core;
pub mod cursor;
pub mod error;
pub mod file_cache;
pub mod index;
pub mod live;
pub mod segments;
pub mod serde_codec;
pub mod storage;
pub mod table;
pub mod telemetry;
pub mod types;
pub mod updater;

/// Per-chunk compression codec.
pub use crate::chunk::ChunkCompression;
/// Engine configuration and layered file/env loading.
pub use crate::config::DbFileConfig;
/// Configuration options and the unsegmented engine entry point.
pub use crate::core::{DbConfig, TimeSeriesDb};
/// Lazy range iteration holding the series read lock.
pub use crate::cursor::SeriesCursor;
/// Error type for database operations.
pub use crate::error::DbError;
pub use crate::file_cache::{CacheStats, FileCacheConfig};
/// Historical / live segmented engine.
pub use crate::segments::{
    PeriodicSegmentFinder, SegmentFinder, SegmentedCursor, SegmentedKey, SegmentedTimeSeriesDb,
};
pub use crate::serde_codec::{
    BincodeSerde, DataPointSerde, F64Serde, I64Serde, KeySerde, StringKeySerde, StringSerde,
    U64KeySerde, U64Serde, ValueSerde,
};
/// Structured event hook for observability.
pub use crate::telemetry::{DbEvent, DbEventListener, TracingEventListener};
pub use crate::types::{
    DataPoint, ScanDirection, SeriesKey, TimeRange, TimedRecord, TimedValue, Timestamp, MAX_TIME,
    MIN_TIME,
};
pub use crate::updater::{
    FnSource, UpdateContext, UpdateMode, UpdateOutcome, UpdatePolicy, UpdateSource, UpdateStatus,
    VecSource,
};
