//! Admin tool for seriesdb storage directories.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`SERIESDB__*`), and CLI flags. Every command works on the index tables and chunk headers;
//! values are never decoded, so the tool does not need to know the value type.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use seriesdb::chunk::{crc32, verify_chunk_bytes};
use seriesdb::core::SERIES_DIR;
use seriesdb::index::{SeriesIndex, ShiftDirection};
use seriesdb::segments::{ClosedSegment, SEGMENTS_DIR};
use seriesdb::serde_codec::parse_namespace;
use seriesdb::storage::{TMP_DIR, UPDATE_MARKER};
use seriesdb::table::{PersistentTable, TableBackend};
use seriesdb::types::{ScanDirection, Timestamp};
use seriesdb::{DbConfig, DbError};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// seriesdb storage administration.
#[derive(Parser, Debug)]
#[command(name = "seriesctl", version, about)]
struct Cli {
    /// Path to config file (TOML). If omitted, `seriesdb.toml` is used when present.
    #[arg(long, env = "SERIESDB_CONFIG")]
    config: Option<PathBuf>,

    /// Override the base directory.
    #[arg(long, env = "SERIESDB_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    no_config: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate config (file + env + CLI), print the effective values, then exit.
    ValidateConfig,
    /// List stored series with their chunk and value counts.
    List,
    /// Print the chunk descriptors and table sizes of one series.
    Inspect {
        /// Series namespace (hex-encoded key bytes, as listed by `list`).
        namespace: String,
    },
    /// Cross-check the index tables of one series against its chunk files.
    Verify {
        namespace: String,
        /// Also read every chunk file and check its header and checksum.
        #[arg(long, default_value_t = false)]
        deep: bool,
    },
    /// Remove the storage of one series. The next update rebuilds it from its source.
    Delete { namespace: String },
}

fn load_config(cli: &Cli) -> Result<DbConfig, DbError> {
    let path = if cli.no_config {
        None
    } else {
        match &cli.config {
            Some(p) => Some(p.clone()),
            None => Some(PathBuf::from("seriesdb.toml")).filter(|p| p.exists()),
        }
    };
    let mut config = DbConfig::load(path.as_deref())?;
    if let Some(dir) = &cli.base_dir {
        config.base_dir = dir.clone();
    }
    Ok(config)
}

fn series_dir(config: &DbConfig, namespace: &str) -> Result<PathBuf, DbError> {
    if parse_namespace(namespace).is_none() {
        return Err(DbError::ConfigError(format!(
            "{:?} is not a series namespace (expected lowercase hex)",
            namespace
        )));
    }
    Ok(config.base_dir.join(SERIES_DIR).join(namespace))
}

fn open_index(dir: &Path) -> Result<SeriesIndex, DbError> {
    if !dir.is_dir() {
        return Err(DbError::ConfigError(format!(
            "no series storage at {}",
            dir.display()
        )));
    }
    SeriesIndex::open(dir, &dir.join(TMP_DIR))
}

fn display_key(namespace: &str) -> String {
    match parse_namespace(namespace) {
        Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        None => String::from("?"),
    }
}

fn fmt_time(t: Option<Timestamp>) -> String {
    t.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string())
}

fn validate_config(config: &DbConfig) {
    println!("base_dir={}", config.base_dir.display());
    println!("flush_size={}", config.flush_size);
    println!("compression={:?}", config.compression);
    println!("shift_index_units={:?}", config.shift_index_units);
    println!("lock_timeout_ms={}", config.lock_timeout.as_millis());
    println!("running_wait_ms={}", config.running_wait.as_millis());
    println!("update_policy={:?}", config.update_policy);
    println!("verify_on_open={}", config.verify_on_open);
    println!("file_cache.max_entries={}", config.file_cache.max_entries);
    println!(
        "file_cache.expire_after_access_ms={}",
        config
            .file_cache
            .expire_after_access
            .map(|d| d.as_millis().to_string())
            .unwrap_or_else(|| "-".to_string())
    );
}

fn list(config: &DbConfig) -> Result<(), DbError> {
    let root = config.base_dir.join(SERIES_DIR);
    let mut names: Vec<String> = match std::fs::read_dir(&root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|n| parse_namespace(n).is_some())
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    names.sort();
    println!(
        "{:<40} {:>8} {:>12} {:>20} {:>20}  flags",
        "namespace", "chunks", "values", "first_end", "last_end"
    );
    for name in names {
        let dir = root.join(&name);
        let flags = if dir.join(UPDATE_MARKER).exists() {
            "incomplete"
        } else {
            ""
        };
        match open_index(&dir) {
            Ok(index) => println!(
                "{:<40} {:>8} {:>12} {:>20} {:>20}  {}",
                name,
                index.chunk_count(),
                index.value_count(),
                fmt_time(index.first_chunk().map(|c| c.first_end_time)),
                fmt_time(index.last_chunk().map(|c| c.last_end_time)),
                flags
            ),
            Err(e) => println!("{:<40} unreadable: {}", name, e),
        }
    }
    Ok(())
}

fn inspect(config: &DbConfig, namespace: &str) -> Result<(), DbError> {
    let dir = series_dir(config, namespace)?;
    let index = open_index(&dir)?;
    println!("key={}", display_key(namespace));
    println!("dir={}", dir.display());
    println!("incomplete_update={}", dir.join(UPDATE_MARKER).exists());
    println!("values={}", index.value_count());
    println!("chunks={}", index.chunk_count());
    println!("latest_entries={}", index.latest_entry_count());
    println!(
        "previous_entries={}",
        index.shift_entry_count(ShiftDirection::Previous)
    );
    println!("next_entries={}", index.shift_entry_count(ShiftDirection::Next));
    println!(
        "{:<30} {:>12} {:>8} {:>20} {:>20} {:>10}",
        "file", "ordinal", "count", "first_end", "last_end", "bytes"
    );
    for c in index.chunks() {
        println!(
            "{:<30} {:>12} {:>8} {:>20} {:>20} {:>10}",
            c.file_name, c.first_ordinal, c.value_count, c.first_end_time, c.last_end_time, c.byte_len
        );
    }

    let registry = config
        .base_dir
        .join(SEGMENTS_DIR)
        .join(format!("{}.tbl", namespace));
    if registry.exists() {
        let table: PersistentTable<Timestamp, ClosedSegment> =
            PersistentTable::open(&registry, config.base_dir.join(SEGMENTS_DIR).join(TMP_DIR))?;
        println!("closed_segments={}", table.len());
        for (_, seg) in table.range(
            std::ops::Bound::Unbounded,
            std::ops::Bound::Unbounded,
            ScanDirection::Ascending,
        ) {
            println!(
                "  [{}, {}) values={}",
                seg.segment.start, seg.segment.end, seg.value_count
            );
        }
    }
    Ok(())
}

fn verify(config: &DbConfig, namespace: &str, deep: bool) -> Result<(), DbError> {
    let dir = series_dir(config, namespace)?;
    if dir.join(UPDATE_MARKER).exists() {
        return Err(DbError::IncompleteUpdate {
            series: namespace.to_string(),
            details: "update marker present".to_string(),
        });
    }
    let index = open_index(&dir)?;
    index.check_consistency(&dir)?;
    debug!(namespace, chunks = index.chunk_count(), "index tables consistent");
    if deep {
        for c in index.chunks() {
            let bytes = std::fs::read(dir.join(&c.file_name))?;
            if crc32(&bytes) != c.crc32 {
                return Err(DbError::Corruption {
                    details: format!("Chunk {} checksum mismatch", c.file_name),
                    series: Some(namespace.to_string()),
                    timestamp: Some(c.first_end_time),
                });
            }
            let header = verify_chunk_bytes(&bytes)?;
            if header.value_count != c.value_count {
                return Err(DbError::Corruption {
                    details: format!(
                        "Chunk {} holds {} values, descriptor says {}",
                        c.file_name, header.value_count, c.value_count
                    ),
                    series: Some(namespace.to_string()),
                    timestamp: Some(c.first_end_time),
                });
            }
        }
    }
    println!(
        "ok: {} chunks, {} values{}",
        index.chunk_count(),
        index.value_count(),
        if deep { " (deep)" } else { "" }
    );
    Ok(())
}

fn delete(config: &DbConfig, namespace: &str) -> Result<(), DbError> {
    let dir = series_dir(config, namespace)?;
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => {
            info!(namespace, "series storage deleted");
            println!("deleted {}", dir.display());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("nothing to delete at {}", dir.display());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<(), DbError> {
    let config = load_config(cli)?;
    match &cli.command {
        Command::ValidateConfig => {
            validate_config(&config);
            Ok(())
        }
        Command::List => list(&config),
        Command::Inspect { namespace } => inspect(&config, namespace),
        Command::Verify { namespace, deep } => verify(&config, namespace, *deep),
        Command::Delete { namespace } => delete(&config, namespace),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seriesdb=info,seriesctl=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
