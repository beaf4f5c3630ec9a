use std::time::Duration;

use thiserror::Error;

use crate::types::Timestamp;

/// Error type for storage engine operations.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Compression Error: {0}")]
    Compression(String),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        series: Option<String>,
        timestamp: Option<Timestamp>,
    },

    /// An ingestion run did not complete; the series storage was dropped and must be rebuilt.
    #[error("Incomplete update for series {series}: {details}")]
    IncompleteUpdate { series: String, details: String },

    /// The per-series write lock could not be obtained in time (open readers). Retryable.
    #[error("Timed out after {waited:?} waiting for write lock on series {series}")]
    LockTimeout { series: String, waited: Duration },

    #[error("Out of order value for series {series}: last={last}, got={got}")]
    OutOfOrder {
        series: String,
        last: Timestamp,
        got: Timestamp,
    },

    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: Timestamp, end: Timestamp },

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    /// Failure reported by an external update source.
    #[error("Update source error: {0}")]
    Source(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbError {
    pub(crate) fn corruption(details: impl Into<String>) -> Self {
        DbError::Corruption {
            details: details.into(),
            series: None,
            timestamp: None,
        }
    }

    /// Attaches a series label to a corruption error that does not carry one yet.
    pub(crate) fn for_series(self, label: &str) -> Self {
        match self {
            DbError::Corruption {
                details,
                series: None,
                timestamp,
            } => DbError::Corruption {
                details,
                series: Some(label.to_string()),
                timestamp,
            },
            other => other,
        }
    }

    /// True for conditions the caller may resolve by retrying later
    /// (e.g. after closing outstanding range cursors).
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::LockTimeout { .. })
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, DbError::Corruption { .. })
    }
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}
