//! Configuration system for Sidelink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SIDELINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/sidelink/config.toml
//!   3. ~/.config/sidelink/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::peer::PublicKey;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SidelinkConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name announced to peers in the identity message.
    pub alias: String,
    /// Public key bytes as hex. Empty = random key for this run.
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the daemon accepts socket links on.
    pub listen_addr: String,
    /// Largest chunk written to a link in one go.
    pub mtu: usize,
    /// Read poll interval; outgoing chunks are drained between reads.
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where bodies above the in-memory cutoff are written while receiving.
    pub overflow_dir: PathBuf,
    /// Where the daemon stores completed incoming transfers.
    pub received_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            alias: std::env::var("USER").unwrap_or_else(|_| "sidelink".to_string()),
            public_key: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7373".to_string(),
            mtu: 1024,
            read_timeout_ms: 50,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            overflow_dir: data_dir().join("overflow"),
            received_dir: data_dir().join("received"),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("sidelink")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("sidelink")
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
    #[error("identity.public_key is not valid hex: {0}")]
    InvalidPublicKey(hex::FromHexError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SidelinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit file, still applying env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            SidelinkConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SIDELINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SidelinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Configured key, or fresh random bytes when none is set.
    pub fn public_key(&self) -> Result<PublicKey, ConfigError> {
        let hex_key = self.identity.public_key.trim();
        if hex_key.is_empty() {
            return Ok(PublicKey::new(rand::random::<[u8; 32]>().to_vec()));
        }
        hex::decode(hex_key)
            .map(PublicKey::new)
            .map_err(ConfigError::InvalidPublicKey)
    }

    /// Apply SIDELINK_* overrides. Unparseable numbers are ignored.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SIDELINK_IDENTITY__ALIAS") {
            self.identity.alias = v;
        }
        if let Some(v) = var("SIDELINK_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = var("SIDELINK_NETWORK__MTU") {
            if let Ok(mtu) = v.parse() {
                self.network.mtu = mtu;
            }
        }
        if let Some(v) = var("SIDELINK_NETWORK__READ_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.network.read_timeout_ms = ms;
            }
        }
        if let Some(v) = var("SIDELINK_STORAGE__OVERFLOW_DIR") {
            self.storage.overflow_dir = PathBuf::from(v);
        }
    }
}
