//! Configuration file for the chatwire server.

use crate::server::{DEFAULT_CACHE_BUDGET, ServerConfig};
use chatwire_proto::{
    DEFAULT_CHUNK_SIZE, DEFAULT_PORT, MAX_CHUNK_SIZE, MAX_FILE_SIZE, TransferLimits,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Seconds a new connection has to send its handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for uploaded files
    #[serde(default = "default_storage_dir")]
    pub directory: PathBuf,
    /// Memory cache budget in bytes (0 disables caching)
    #[serde(default = "default_cache_budget")]
    pub cache_budget_bytes: u64,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Largest accepted upload
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Largest accepted upload chunk
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Seconds an upload may take before it is aborted
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
    /// Chunk size used when serving downloads
    #[serde(default = "default_download_chunk_size")]
    pub download_chunk_size: usize,
    /// Seconds between stale-upload sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("ServerFiles")
}

fn default_cache_budget() -> u64 {
    DEFAULT_CACHE_BUDGET
}

fn default_max_file_size() -> u64 {
    MAX_FILE_SIZE
}

fn default_max_chunk_size() -> usize {
    MAX_CHUNK_SIZE
}

fn default_upload_timeout() -> u64 {
    600
}

fn default_download_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_storage_dir(),
            cache_budget_bytes: default_cache_budget(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_chunk_size: default_max_chunk_size(),
            upload_timeout_secs: default_upload_timeout(),
            download_chunk_size: default_download_chunk_size(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("chatwire/server.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.listen_addr.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        if self.network.handshake_timeout_secs == 0 {
            anyhow::bail!("Handshake timeout must be at least 1 second");
        }

        if self.storage.directory.as_os_str().is_empty() {
            anyhow::bail!("Storage directory must not be empty");
        }

        let transfer = &self.transfer;
        if transfer.max_file_size == 0 || transfer.max_file_size > MAX_FILE_SIZE {
            anyhow::bail!("Max file size must be between 1 byte and {MAX_FILE_SIZE} bytes");
        }

        if transfer.max_chunk_size == 0 || transfer.max_chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!("Max chunk size must be between 1 byte and 10MB");
        }

        // Served chunks must be accepted by clients.
        if transfer.download_chunk_size == 0 || transfer.download_chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!("Download chunk size must be between 1 byte and 10MB");
        }

        if transfer.upload_timeout_secs == 0 {
            anyhow::bail!("Upload timeout must be at least 1 second");
        }

        if transfer.cleanup_interval_secs == 0 {
            anyhow::bail!("Cleanup interval must be at least 1 second");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Runtime server settings described by this file
    #[must_use]
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            storage_dir: self.storage.directory.clone(),
            cache_budget: self.storage.cache_budget_bytes,
            upload_limits: TransferLimits {
                max_file_size: self.transfer.max_file_size,
                max_chunk_size: self.transfer.max_chunk_size,
                timeout: Some(Duration::from_secs(self.transfer.upload_timeout_secs)),
            },
            download_chunk_size: self.transfer.download_chunk_size,
            handshake_timeout: Duration::from_secs(self.network.handshake_timeout_secs),
            cleanup_interval: Duration::from_secs(self.transfer.cleanup_interval_secs),
        }
    }
}
