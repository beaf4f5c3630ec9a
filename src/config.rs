//! Layered configuration: defaults, then an optional TOML file, then `SERIESDB__*`
//! environment variables, merged onto [`DbConfig`].
//!
//! ```toml
//! base_dir = "/var/lib/seriesdb"
//! flush_size = 5000
//! shift_index_units = [1, 10, 100]
//! lock_timeout_ms = 2000
//! update_policy = "skip_if_running"
//!
//! [compression]
//! type = "zstd"
//! level = 3
//!
//! [file_cache]
//! max_entries = 1024
//! ```
//!
//! Nested keys map to environment variables with a double underscore, e.g.
//! `SERIESDB__FILE_CACHE__MAX_ENTRIES=1024`.

use crate::chunk::ChunkCompression;
use crate::core::DbConfig;
use crate::error::DbError;
use crate::updater::UpdatePolicy;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SERIESDB";

/// File cache section. All fields optional.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileCacheFileConfig {
    pub max_entries: Option<usize>,
    pub expire_after_access_ms: Option<u64>,
    pub pool_capacity: Option<usize>,
}

/// Engine config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DbFileConfig {
    pub base_dir: Option<String>,
    pub flush_size: Option<usize>,
    /// Table form: `type = "none" | "lz4"` or `type = "zstd", level = 3`.
    pub compression: Option<ChunkCompression>,
    pub shift_index_units: Option<Vec<u32>>,
    pub lock_timeout_ms: Option<u64>,
    pub running_wait_ms: Option<u64>,
    pub update_policy: Option<UpdatePolicy>,
    pub verify_on_open: Option<bool>,
    pub file_cache: Option<FileCacheFileConfig>,
}

impl DbFileConfig {
    /// Reads `path` (if given) and the environment. A missing explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, DbError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(DbError::ConfigError(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(env_source());
        let merged = builder.build().map_err(config_error)?;
        merged.try_deserialize().map_err(config_error)
    }

    /// Parses a TOML document without consulting the environment.
    pub fn from_toml_str(s: &str) -> Result<Self, DbError> {
        Config::builder()
            .add_source(File::from_str(s, FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)
    }

    /// Overwrites the fields of `base` that are set here.
    pub fn merge_into(&self, base: &mut DbConfig) {
        if let Some(dir) = &self.base_dir {
            base.base_dir = PathBuf::from(dir);
        }
        if let Some(n) = self.flush_size {
            base.flush_size = n;
        }
        if let Some(c) = self.compression {
            base.compression = c;
        }
        if let Some(units) = &self.shift_index_units {
            base.shift_index_units = units.clone();
        }
        if let Some(ms) = self.lock_timeout_ms {
            base.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.running_wait_ms {
            base.running_wait = Duration::from_millis(ms);
        }
        if let Some(p) = self.update_policy {
            base.update_policy = p;
        }
        if let Some(b) = self.verify_on_open {
            base.verify_on_open = b;
        }
        if let Some(fc) = &self.file_cache {
            if let Some(n) = fc.max_entries {
                base.file_cache.max_entries = n;
            }
            if let Some(ms) = fc.expire_after_access_ms {
                base.file_cache.expire_after_access = Some(Duration::from_millis(ms));
            }
            if let Some(n) = fc.pool_capacity {
                base.file_cache.pool_capacity = n;
            }
        }
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .ignore_empty(true)
        .list_separator(",")
        .with_list_parse_key("shift_index_units")
}

fn config_error(e: config::ConfigError) -> DbError {
    DbError::ConfigError(e.to_string())
}

impl DbConfig {
    /// Defaults, then `path`, then `SERIESDB__*` variables. The result is validated.
    ///
    /// # Errors
    /// `ConfigError` when the file is missing or malformed, a value has the wrong type, or
    /// the merged configuration fails [`DbConfig::validate`].
    pub fn load(path: Option<&Path>) -> Result<DbConfig, DbError> {
        let partial = DbFileConfig::load(path)?;
        let mut config = DbConfig::default();
        partial.merge_into(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with a TOML document. The result is validated.
    pub fn from_toml_str(s: &str) -> Result<DbConfig, DbError> {
        let partial = DbFileConfig::from_toml_str(s)?;
        let mut config = DbConfig::default();
        partial.merge_into(&mut config);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_keeps_defaults() {
        let config = DbConfig::from_toml_str("").unwrap();
        let defaults = DbConfig::default();
        assert_eq!(config.flush_size, defaults.flush_size);
        assert_eq!(config.compression, defaults.compression);
        assert_eq!(config.lock_timeout, defaults.lock_timeout);
    }

    #[test]
    fn toml_overrides_fields() {
        let config = DbConfig::from_toml_str(
            r#"
            base_dir = "/tmp/sdb"
            flush_size = 128
            shift_index_units = [1, 5]
            lock_timeout_ms = 250
            update_policy = "skip_if_running"

            [compression]
            type = "zstd"
            level = 7

            [file_cache]
            max_entries = 8
            expire_after_access_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/tmp/sdb"));
        assert_eq!(config.flush_size, 128);
        assert_eq!(config.shift_index_units, vec![1, 5]);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.update_policy, UpdatePolicy::SkipIfRunning);
        assert_eq!(config.compression, ChunkCompression::Zstd { level: 7 });
        assert_eq!(config.file_cache.max_entries, 8);
        assert_eq!(
            config.file_cache.expire_after_access,
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = DbConfig::from_toml_str("flush_size = 0").unwrap_err();
        assert!(matches!(err, DbError::ConfigError(_)));
        let err = DbConfig::from_toml_str("[compression]\ntype = \"brotli\"").unwrap_err();
        assert!(matches!(err, DbError::ConfigError(_)));
        let err = DbConfig::from_toml_str("[compression]\ntype = \"zstd\"\nlevel = 40").unwrap_err();
        assert!(matches!(err, DbError::ConfigError(_)));
    }

    #[test]
    fn missing_file_is_rejected() {
        let err = DbConfig::load(Some(Path::new("/nonexistent/seriesdb.toml"))).unwrap_err();
        assert!(matches!(err, DbError::ConfigError(_)));
    }
}
