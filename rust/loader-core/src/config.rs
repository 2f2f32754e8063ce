// rust/loader-core/src/config.rs

//! Configuration management for the shard loader.
//!
//! Configuration is read from a TOML file, optionally overridden by
//! `SHARDLOADER_*` environment variables, and validated before use.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LoaderError, Result};

// Top-level loader configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub shuffle: ShuffleConfig,
    pub session: SessionConfig,
    pub catalog: CatalogConfig,
    pub datasets: Vec<DatasetConfig>,
}

/// Network settings for the RPC server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub address: String,
    /// Port to listen on.
    pub port: u16,
    /// Maximum encoded/decoded message size in bytes.
    pub max_message_bytes: usize,
}

/// Shard file access options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Whether to memory-map large shard files instead of positional reads.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
    // Upper bound for a single sample read, in milliseconds.
    pub read_timeout_ms: u64,
    // Concurrent sample reads while resolving one batch.
    pub read_parallelism: usize,
}

/// Shuffle buffer sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuffleConfig {
    /// Buffer capacity used when a session does not ask for one.
    pub default_buffer_capacity: u32,
    /// Largest buffer capacity a session may request.
    pub max_buffer_capacity: u32,
}

/// Session table limits and expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    // Idle time after which a session expires.
    pub idle_ttl_secs: u64,
    // How often the reaper scans for idle sessions.
    pub reap_interval_secs: u64,
    // How long closed/expired ids are remembered.
    pub tombstone_ttl_secs: u64,
    // Largest batch size a session may request.
    pub max_batch_size: u32,
    // Maximum number of concurrently open sessions.
    pub max_sessions: usize,
}

/// Catalog refresh options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Periodic rescan interval in seconds; 0 disables it.
    pub rescan_interval_secs: u64,
}

/// On-disk layout of a dataset's shard files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShardFormat {
    /// Pick per file by extension.
    #[default]
    Auto,
    /// Payloads followed by an index table and footer.
    Indexed,
    /// `[u32 LE size][payload]` records back to back.
    LengthPrefixed,
    /// One sample per line.
    Newline,
}

impl FromStr for ShardFormat {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "indexed" => Ok(Self::Indexed),
            "length-prefixed" | "length_prefixed" => Ok(Self::LengthPrefixed),
            "newline" => Ok(Self::Newline),
            other => Err(LoaderError::config(format!("unknown shard format '{other}'"))),
        }
    }
}

/// A dataset served by the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Identifier clients use in `OpenSession`.
    pub id: String,
    /// Shard file or directory of shard files.
    pub path: PathBuf,
    #[serde(default)]
    pub format: ShardFormat,
    /// Descend into subdirectories when `path` is a directory.
    #[serde(default = "default_recursive")]
    pub recursive: bool,
}

fn default_recursive() -> bool {
    true
}

impl DatasetConfig {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            format: ShardFormat::Auto,
            recursive: true,
        }
    }

    /// Parse an `id=path` or `id:format=path` pair as given on the
    /// command line.
    pub fn parse_pair(pair: &str) -> Result<Self> {
        let (key, path) = pair
            .split_once('=')
            .ok_or_else(|| LoaderError::config(format!("dataset '{pair}' must be id=path")))?;

        let (id, format) = match key.split_once(':') {
            Some((id, format)) => (id, format.trim().parse()?),
            None => (key, ShardFormat::Auto),
        };
        let mut dataset = Self::new(id.trim(), path.trim());
        dataset.format = format;
        Ok(dataset)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 50051,
            max_message_bytes: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            use_mmap: false,
            mmap_threshold: 1024 * 1024, // 1 MB
            read_timeout_ms: 30_000,
            read_parallelism: 4,
        }
    }
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            default_buffer_capacity: 4096,
            max_buffer_capacity: 1 << 20,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 300,
            reap_interval_secs: 5,
            tombstone_ttl_secs: 3600,
            max_batch_size: 4096,
            max_sessions: 1024,
        }
    }
}

impl StorageConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl SessionConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_ttl_secs)
    }
}

impl FromStr for LoaderConfig {
    type Err = LoaderError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| LoaderError::config_with_source("failed to parse TOML config", e))
    }
}

impl LoaderConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| LoaderError::io_with_source(path, "failed to read config file", e))?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `SHARDLOADER_` and name the section and
    // field, e.g. `SHARDLOADER_SESSION_IDLE_TTL_SECS`. Unparsable values
    // are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Server overrides
        if let Ok(val) = std::env::var("SHARDLOADER_SERVER_ADDRESS") {
            self.server.address = val;
        }
        if let Ok(val) = std::env::var("SHARDLOADER_SERVER_PORT") {
            if let Ok(v) = val.parse() {
                self.server.port = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDLOADER_SERVER_MAX_MESSAGE_BYTES") {
            if let Ok(v) = val.parse() {
                self.server.max_message_bytes = v;
            }
        }

        // Storage overrides
        if let Ok(val) = std::env::var("SHARDLOADER_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDLOADER_STORAGE_MMAP_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.storage.mmap_threshold = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDLOADER_STORAGE_READ_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.storage.read_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDLOADER_STORAGE_READ_PARALLELISM") {
            if let Ok(v) = val.parse() {
                self.storage.read_parallelism = v;
            }
        }

        // Shuffle overrides
        if let Ok(val) = std::env::var("SHARDLOADER_SHUFFLE_DEFAULT_BUFFER_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.shuffle.default_buffer_capacity = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDLOADER_SHUFFLE_MAX_BUFFER_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.shuffle.max_buffer_capacity = v;
            }
        }

        // Session overrides
        if let Ok(val) = std::env::var("SHARDLOADER_SESSION_IDLE_TTL_SECS") {
            if let Ok(v) = val.parse() {
                self.session.idle_ttl_secs = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDLOADER_SESSION_REAP_INTERVAL_SECS") {
            if let Ok(v) = val.parse() {
                self.session.reap_interval_secs = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDLOADER_SESSION_TOMBSTONE_TTL_SECS") {
            if let Ok(v) = val.parse() {
                self.session.tombstone_ttl_secs = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDLOADER_SESSION_MAX_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.session.max_batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDLOADER_SESSION_MAX_SESSIONS") {
            if let Ok(v) = val.parse() {
                self.session.max_sessions = v;
            }
        }

        // Catalog overrides
        if let Ok(val) = std::env::var("SHARDLOADER_CATALOG_RESCAN_INTERVAL_SECS") {
            if let Ok(v) = val.parse() {
                self.catalog.rescan_interval_secs = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_message_bytes == 0 {
            return Err(LoaderError::config(
                "server.max_message_bytes must be greater than 0",
            ));
        }

        // Storage validation
        if self.storage.read_timeout_ms == 0 {
            return Err(LoaderError::config(
                "storage.read_timeout_ms must be greater than 0",
            ));
        }
        if self.storage.read_parallelism == 0 {
            return Err(LoaderError::config(
                "storage.read_parallelism must be greater than 0",
            ));
        }

        // Shuffle validation
        if self.shuffle.default_buffer_capacity == 0 {
            return Err(LoaderError::config(
                "shuffle.default_buffer_capacity must be greater than 0",
            ));
        }
        if self.shuffle.default_buffer_capacity > self.shuffle.max_buffer_capacity {
            return Err(LoaderError::config(
                "shuffle.default_buffer_capacity must not exceed shuffle.max_buffer_capacity",
            ));
        }

        // Session validation
        if self.session.idle_ttl_secs == 0 {
            return Err(LoaderError::config(
                "session.idle_ttl_secs must be greater than 0",
            ));
        }
        if self.session.reap_interval_secs == 0 {
            return Err(LoaderError::config(
                "session.reap_interval_secs must be greater than 0",
            ));
        }
        if self.session.max_batch_size == 0 {
            return Err(LoaderError::config(
                "session.max_batch_size must be greater than 0",
            ));
        }
        if self.session.max_sessions == 0 {
            return Err(LoaderError::config(
                "session.max_sessions must be greater than 0",
            ));
        }

        // Dataset validation
        let mut seen = HashSet::new();
        for dataset in &self.datasets {
            if dataset.id.is_empty() {
                return Err(LoaderError::config("datasets.id must not be empty"));
            }
            if dataset.id.contains(['@', ':']) {
                return Err(LoaderError::config(format!(
                    "dataset id '{}' must not contain '@' or ':'",
                    dataset.id
                )));
            }
            if dataset.path.as_os_str().is_empty() {
                return Err(LoaderError::config(format!(
                    "dataset '{}' has an empty path",
                    dataset.id
                )));
            }
            if !seen.insert(dataset.id.as_str()) {
                return Err(LoaderError::config(format!(
                    "dataset id '{}' is configured more than once",
                    dataset.id
                )));
            }
        }

        Ok(())
    }
}
