use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            worker_threads: default_worker_threads(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// JSON snapshot loaded at startup and written on persist.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    /// Observation journal; no journal when unset.
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            sqlite_path: None,
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_dialect")]
    pub dialect: String,
    #[serde(default = "default_notebook_weight")]
    pub notebook_weight: f64,
    #[serde(default = "default_worker_threads")]
    pub workers: usize,
    #[serde(default)]
    pub artifact_timeout_secs: Option<u64>,
    /// JSON object of table name -> column list.
    #[serde(default)]
    pub catalog_path: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dialect: default_dialect(),
            notebook_weight: default_notebook_weight(),
            workers: default_worker_threads(),
            artifact_timeout_secs: None,
            catalog_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            max_log_files: default_max_log_files(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_snapshot_path() -> String {
    "sdg.json".to_string()
}

fn default_dialect() -> String {
    "generic".to_string()
}

fn default_notebook_weight() -> f64 {
    0.6
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    7
}

fn default_pool_size() -> u32 {
    4
}

fn default_worker_threads() -> usize {
    4
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("Failed to parse config file")
    }

    /// Like [`AppConfig::from_file`], but a missing file yields the defaults.
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_config_uses_defaults() -> Result<()> {
        let config = AppConfig::from_toml_str("")?;
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.snapshot_path, "sdg.json");
        assert_eq!(config.store.sqlite_path, None);
        assert_eq!(config.ingest.dialect, "generic");
        assert_eq!(config.ingest.notebook_weight, 0.6);
        assert_eq!(config.logging.max_log_files, 7);
        Ok(())
    }

    #[test]
    fn test_partial_sections() -> Result<()> {
        let config = AppConfig::from_toml_str(
            r#"
            [server]
            port = 9000

            [store]
            sqlite_path = "journal.db"

            [ingest]
            dialect = "hive"
            artifact_timeout_secs = 30
            catalog_path = "catalog.json"
            "#,
        )?;
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.store.sqlite_path.as_deref(), Some("journal.db"));
        assert_eq!(config.store.pool_size, 4);
        assert_eq!(config.ingest.dialect, "hive");
        assert_eq!(config.ingest.artifact_timeout_secs, Some(30));
        assert_eq!(config.ingest.catalog_path.as_deref(), Some("catalog.json"));
        Ok(())
    }

    #[test]
    fn test_missing_file_falls_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = AppConfig::from_file_or_default(dir.path().join("absent.toml"))?;
        assert_eq!(config.ingest.workers, 4);
        assert!(AppConfig::from_file(dir.path().join("absent.toml")).is_err());
        Ok(())
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(AppConfig::from_toml_str("[server]\nport = \"x\"").is_err());
    }
}
