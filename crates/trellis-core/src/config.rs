//! Configuration system for Trellis.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TRELLIS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/trellis/config.toml
//!   3. ~/.config/trellis/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub network: NetworkConfig,
    pub slicing: SlicingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Default connection targets, tried in order when an action names
    /// no explicit hop.
    pub connect_peers: Vec<String>,
    /// Protocol id presented to routed transports.
    pub chain_protocol_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicingConfig {
    /// Maximum frame for routed transports.
    pub routed_frame_bytes: usize,
    /// Maximum frame for direct peer links, which carry much smaller
    /// datagrams than routed paths.
    pub direct_frame_bytes: usize,
    /// Incomplete slice assemblies older than this are dropped.
    pub reassembly_ttl_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_peers: Vec::new(),
            chain_protocol_id: "/chain/1.0.0".into(),
        }
    }
}

impl Default for SlicingConfig {
    fn default() -> Self {
        Self {
            routed_frame_bytes: 4 * 1024 * 1024,
            direct_frame_bytes: 128 * 1024,
            reassembly_ttl_secs: 300,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("trellis")
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

impl ChainConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ChainConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TRELLIS_CONFIG")
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
            let text = toml::to_string_pretty(&ChainConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TRELLIS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRELLIS_NETWORK__CONNECT_PEERS") {
            self.network.connect_peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var("TRELLIS_NETWORK__CHAIN_PROTOCOL_ID") {
            self.network.chain_protocol_id = v;
        }
        if let Ok(v) = std::env::var("TRELLIS_SLICING__ROUTED_FRAME_BYTES") {
            if let Ok(n) = v.parse() {
                self.slicing.routed_frame_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("TRELLIS_SLICING__DIRECT_FRAME_BYTES") {
            if let Ok(n) = v.parse() {
                self.slicing.direct_frame_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("TRELLIS_SLICING__REASSEMBLY_TTL_SECS") {
            if let Ok(n) = v.parse() {
                self.slicing.reassembly_ttl_secs = n;
            }
        }
    }
}
