//! Configuration system for Succinct.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SUCCINCT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/succinct/config.toml
//!   3. ~/.config/succinct/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::heartbeat::{HEARTBEAT_MS, HEARTBEAT_PORT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SuccinctConfig {
    pub identity: IdentityConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub queue: QueueConfig,
    pub relay: RelayConfig,
    pub transports: Vec<TransportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the hex-encoded PeerId. Auto-generated on first run.
    pub peer_id_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the record logs and the fragment recovery file.
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP heartbeat port.
    pub port: u16,
    pub heartbeat_ms: u64,
    /// A link not heard for this long is dead.
    pub stale_after_ms: u64,
    /// Only use interfaces backed by a wireless phy.
    pub wireless_only: bool,
    pub interface_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Delay that coalesces rapid wakes into one send pass.
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// e.g. `http://relay.example:8080`. Relay path disabled when absent.
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// One fragment per datagram to a gateway on the local network.
    Udp { target: String, mtu: u32 },
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peer_id_path: config_dir().join("peer_id"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { root: data_dir() }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: HEARTBEAT_PORT,
            heartbeat_ms: HEARTBEAT_MS,
            stale_after_ms: 15_000,
            wireless_only: false,
            interface_poll_ms: 2_000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("succinct")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("succinct")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SuccinctConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse the file at `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(SuccinctConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SUCCINCT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        write_default_at(&path)?;
        Ok(path)
    }

    /// Apply SUCCINCT_* overrides, looking each key up through `var`.
    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("SUCCINCT_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = p;
        }
        if let Some(ms) = var("SUCCINCT_NETWORK__HEARTBEAT_MS").and_then(|v| v.parse().ok()) {
            self.network.heartbeat_ms = ms;
        }
        if let Some(url) = var("SUCCINCT_RELAY__BASE_URL") {
            self.relay.base_url = if url.is_empty() { None } else { Some(url) };
        }
        if let Some(root) = var("SUCCINCT_STORAGE__ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(ms) = var("SUCCINCT_QUEUE__DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            self.queue.debounce_ms = ms;
        }
    }
}

fn write_default_at(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
    }
    let text =
        toml::to_string_pretty(&SuccinctConfig::default()).map_err(ConfigError::SerializeFailed)?;
    std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
}
