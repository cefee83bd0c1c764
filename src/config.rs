//! Client configuration
//!
//! Loaded from a TOML file. Every section and field has a default, so a
//! partial file (or none at all) yields a working client.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub identity: IdentityConfig,
    pub buffer: BufferConfig,
    pub sync: SyncConfig,
    pub output: OutputConfig,
    pub mode: ProcessingMode,
}

/// Where and how to reach the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub reconnect_backoff_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_SERVER_PORT,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            read_timeout_ms: READ_TIMEOUT_MS,
            reconnect_backoff_ms: RECONNECT_BACKOFF_MS,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

/// Identity announced in Hello
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub name: String,
    pub mac: String,
    pub instance: u32,
    /// Falls back to the MAC when empty
    pub id: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: "snapclient".into(),
            mac: "00:00:00:00:00:00".into(),
            instance: 1,
            id: String::new(),
        }
    }
}

impl IdentityConfig {
    pub fn client_id(&self) -> &str {
        if self.id.is_empty() {
            &self.mac
        } else {
            &self.id
        }
    }
}

/// Pipeline sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Explicit byte capacity; overrides `extended_memory`
    pub size: Option<usize>,
    pub extended_memory: bool,
    pub activation_percent: u8,
    pub max_queued_chunks: usize,
    pub write_wait_ms: u64,
    pub pop_timeout_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: None,
            extended_memory: true,
            activation_percent: DEFAULT_ACTIVATION_PERCENT,
            max_queued_chunks: MAX_QUEUED_CHUNKS,
            write_wait_ms: PIPELINE_WRITE_WAIT_MS,
            pop_timeout_ms: POP_TIMEOUT_MS,
        }
    }
}

impl BufferConfig {
    pub fn capacity(&self) -> usize {
        match self.size {
            Some(size) => size,
            None if self.extended_memory => BUFFER_SIZE_LARGE,
            None => BUFFER_SIZE_SMALL,
        }
    }

    /// Fill level in bytes at which the consumer starts draining
    pub fn activation_bytes(&self) -> usize {
        self.capacity() * self.activation_percent as usize / 100
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }
}

/// Clock synchronization tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub processing_lag_ms: i64,
    pub interval: usize,
    pub max_start_delay_ms: i64,
    /// Use this playback speed instead of the measured drift
    pub fixed_factor: Option<f64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            processing_lag_ms: DEFAULT_PROCESSING_LAG_MS,
            interval: DEFAULT_SYNC_INTERVAL,
            max_start_delay_ms: MAX_START_DELAY_MS,
            fixed_factor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output device name; the default device when unset
    pub device: Option<String>,
    /// Overall gain applied on top of the server volume
    pub volume_factor: f32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device: None,
            volume_factor: 1.0,
        }
    }
}

/// How the consumer side is scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Dedicated output thread
    #[default]
    Threaded,
    /// Output steps interleaved with the session loop
    Cooperative,
}

impl ClientConfig {
    /// Default location: `<config dir>/snapclient/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "snapcast", "snapclient")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write atomically through a temporary file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(Error::Config("server host is empty".into()));
        }
        if self.buffer.capacity() == 0 {
            return Err(Error::Config("buffer capacity is zero".into()));
        }
        if !(1..=100).contains(&self.buffer.activation_percent) {
            return Err(Error::Config(format!(
                "activation percent {} outside 1..=100",
                self.buffer.activation_percent
            )));
        }
        if self.buffer.max_queued_chunks == 0 {
            return Err(Error::Config("max queued chunks is zero".into()));
        }
        if self.sync.interval < 2 {
            return Err(Error::Config(format!(
                "sync interval {} must be at least 2",
                self.sync.interval
            )));
        }
        if let Some(factor) = self.sync.fixed_factor {
            if !(factor.is_finite() && factor > 0.0) {
                return Err(Error::Config(format!("invalid fixed factor {}", factor)));
            }
        }
        Ok(())
    }
}
