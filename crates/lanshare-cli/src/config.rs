//! Configuration system for the LANSHARE CLI.

use lanshare_core::{DEFAULT_CHUNK_SIZE, DEFAULT_PORT, ShareConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// LANSHARE configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Receive configuration
    #[serde(default)]
    pub receive: ReceiveConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address for `serve`
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Socket write timeout in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// File read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Grace period on shutdown in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Transfers kept in history
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Transfer log file (appended)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Receive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveConfig {
    /// Server address for `receive`
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Directory received files are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Connect and idle read timeout in seconds
    #[serde(default = "default_receive_timeout")]
    pub timeout_secs: u64,
}

// Default values

fn default_listen_addr() -> String {
    format!("127.0.0.1:{DEFAULT_PORT}")
}

fn default_server_addr() -> String {
    format!("127.0.0.1:{DEFAULT_PORT}")
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_write_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_history_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_receive_timeout() -> u64 {
    30
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            write_timeout_secs: default_write_timeout(),
            read_timeout_secs: default_read_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            output_dir: default_output_dir(),
            timeout_secs: default_receive_timeout(),
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
            .join("lanshare/config.toml")
    }

    /// Load config from `path` if it exists, otherwise use defaults
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_addr(&self.network.listen_addr, "Listen address")
    }

    /// Parse receive server address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_server_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_addr(&self.receive.server_addr, "Server address")
    }

    /// Engine configuration derived from the `[transfer]` section
    #[must_use]
    pub fn share_config(&self) -> ShareConfig {
        ShareConfig {
            chunk_size: self.transfer.chunk_size,
            write_timeout: Duration::from_secs(self.transfer.write_timeout_secs),
            read_timeout: Duration::from_secs(self.transfer.read_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.transfer.shutdown_timeout_secs),
            history_capacity: self.transfer.history_capacity,
            ..ShareConfig::default()
        }
    }

    /// Receive idle timeout
    #[must_use]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive.timeout_secs)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let listen = self.parse_listen_addr()?;
        validate_port(listen.port(), "Listen address", true)?;

        let server = self.parse_server_addr()?;
        validate_port(server.port(), "Server address", false)?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.receive.timeout_secs == 0 {
            anyhow::bail!("Receive timeout must be non-zero");
        }

        self.share_config().validate()?;

        Ok(())
    }
}

fn parse_addr(addr: &str, name: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .map_err(|e| anyhow::anyhow!("{name} '{addr}' is not a valid ip:port ({e})"))
}

/// Ports below 1024 are reserved; 0 (ephemeral) is only meaningful for listening
fn validate_port(port: u16, name: &str, allow_ephemeral: bool) -> anyhow::Result<()> {
    if port == 0 && allow_ephemeral {
        return Ok(());
    }
    if port < 1024 {
        anyhow::bail!("{name} port must be between 1024 and 65535, got {port}");
    }
    Ok(())
}
