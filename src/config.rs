//! Configuration
//!
//! Configuration structures for the rendezvous server, the client and the
//! transfer protocol.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_signaling_host")]
    pub signaling_host: String,
    #[serde(default = "default_signaling_port")]
    pub signaling_port: u16,
    /// Rooms older than this are evicted regardless of state
    #[serde(default = "default_room_ttl_secs")]
    pub room_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Largest signaling frame accepted from a client
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// TLS is enabled on the signaling listener when both are set
    #[serde(default)]
    pub certfile: Option<PathBuf>,
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_signaling_host() -> String {
    "0.0.0.0".to_string()
}

fn default_signaling_port() -> u16 {
    3000
}

fn default_room_ttl_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            signaling_host: default_signaling_host(),
            signaling_port: default_signaling_port(),
            room_ttl_secs: default_room_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_message_size: default_max_message_size(),
            certfile: None,
            keyfile: None,
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn room_ttl(&self) -> Duration {
        Duration::from_secs(self.room_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn tls_enabled(&self) -> bool {
        self.certfile.is_some() && self.keyfile.is_some()
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_signaling_port")]
    pub signaling_port: u16,
    /// Connect to the signaling server over TLS
    #[serde(default)]
    pub tls: bool,
    /// Skip certificate verification (self-signed development servers)
    #[serde(default)]
    pub insecure: bool,
    /// Host written into offers instead of the locally bound address
    #[serde(default)]
    pub advertise_host: Option<String>,
    #[serde(default = "default_gather_timeout_ms")]
    pub gather_timeout_ms: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gather_timeout_ms() -> u64 {
    2000
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            signaling_port: default_signaling_port(),
            tls: false,
            insecure: false,
            advertise_host: None,
            gather_timeout_ms: default_gather_timeout_ms(),
            output_dir: default_output_dir(),
            transfer: TransferConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.transfer.validate()?;
        Ok(config)
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }
}

/// Chunking and flow-control parameters shared by sender and receiver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// The send loop suspends while the channel holds more than this
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    /// ...and resumes once it drains below this
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: usize,
    /// Reject an assembled artifact whose length differs from the declared size
    #[serde(default = "default_verify_size")]
    pub verify_size: bool,
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_high_water_mark() -> usize {
    16 * 1024 * 1024
}

fn default_low_water_mark() -> usize {
    4 * 1024 * 1024
}

fn default_verify_size() -> bool {
    true
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            high_water_mark: default_high_water_mark(),
            low_water_mark: default_low_water_mark(),
            verify_size: default_verify_size(),
        }
    }
}

impl TransferConfig {
    /// Reject settings under which the send loop could never make progress.
    ///
    /// The low-water crossing only fires when the buffer drains from above
    /// the low mark, so it must sit strictly below the high mark.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than 0".into()));
        }
        if self.low_water_mark >= self.high_water_mark {
            return Err(ConfigError::Invalid(format!(
                "low_water_mark ({}) must be below high_water_mark ({})",
                self.low_water_mark, self.high_water_mark
            )));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
