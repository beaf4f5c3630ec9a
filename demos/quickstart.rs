//! Walkthrough: ingest daily closes, run as-of / shift / range queries, then stream ticks
//! through a segmented store whose live segment rolls over every hour.
//!
//! Run with `cargo run --example quickstart`. Set `RUST_LOG=debug` for engine logs.

use std::sync::Arc;

use seriesdb::{
    DataPoint, DataPointSerde, DbConfig, DbError, PeriodicSegmentFinder, SegmentedTimeSeriesDb,
    StringKeySerde, TimeSeriesDb, Timestamp, TracingEventListener,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SECOND: Timestamp = 1_000_000_000;
const DAY: Timestamp = 86_400 * SECOND;

fn main() -> Result<(), DbError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seriesdb=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let dir = std::env::temp_dir().join("seriesdb_quickstart");
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }

    let config = DbConfig {
        flush_size: 64,
        event_listener: Arc::new(TracingEventListener),
        ..DbConfig::with_base_dir(dir.join("daily"))
    };
    let db = TimeSeriesDb::open(config, StringKeySerde, DataPointSerde)?;

    // One year of daily closes starting 2024-01-01.
    let start: Timestamp = 19_723 * DAY;
    let closes: Vec<DataPoint> = (0..366u64)
        .map(|d| DataPoint::new(start + d * DAY, 100.0 + (d as f64 / 7.0).sin() * 5.0))
        .collect();
    let key = "ACME".to_string();
    println!("update: {:?}", db.update(&key, &closes)?);

    let mid_june = start + 166 * DAY + DAY / 2;
    println!("as of mid June: {:?}", db.get_latest_value(&key, mid_june)?);
    println!("10 closes earlier: {:?}", db.get_previous_value(&key, mid_june, 10)?);
    println!("100 closes later: {:?}", db.get_next_value(&key, mid_june, 100)?);

    let week: Vec<DataPoint> = db
        .range_values(&key, Some(start + 7 * DAY), Some(start + 13 * DAY))?
        .collect::<Result<_, _>>()?;
    println!("second week: {} closes", week.len());
    println!("cache: {:?}", db.cache_stats());

    // Ticks every 10 s over three hours, one closed segment per hour.
    let ticks = SegmentedTimeSeriesDb::open(
        DbConfig {
            flush_size: 128,
            ..DbConfig::with_base_dir(dir.join("ticks"))
        },
        StringKeySerde,
        DataPointSerde,
        PeriodicSegmentFinder::hourly(),
    )?;
    let symbol = "ACME.T".to_string();
    let t0 = start + 9 * 3_600 * SECOND;
    ticks.append_all(
        &symbol,
        (0..1_080u64).map(|i| DataPoint::new(t0 + i * 10 * SECOND, 100.0 + i as f64 / 100.0)),
    )?;
    println!(
        "ticks: {} stored, {} closed segments, {} live",
        ticks.len(&symbol)?,
        ticks.closed_segments(&symbol)?.len(),
        ticks.live_len(&symbol)?
    );

    // A range across the first segment boundary comes back as one ordered run.
    let boundary = t0 + 3_600 * SECOND;
    let around: Vec<Timestamp> = ticks
        .range_values(&symbol, Some(boundary - 30 * SECOND), Some(boundary + 30 * SECOND))?
        .map(|r| r.map(|p| p.timestamp))
        .collect::<Result<_, _>>()?;
    println!(
        "ticks around the boundary: {} (ordered: {})",
        around.len(),
        around.windows(2).all(|w| w[0] <= w[1])
    );

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
