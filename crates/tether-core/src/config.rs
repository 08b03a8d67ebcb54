//! Configuration system for Tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::envelope::DEFAULT_CHUNK_CAPACITY;
use crate::wire::DEFAULT_MAX_PACKET_BYTES;

/// Hard ceiling on in-flight messages, far below the 2^24 id space.
pub const MAX_IN_FLIGHT_CEILING: usize = 1 << 20;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub pipe: PipeConfig,
    pub envelope: EnvelopeConfig,
    pub rpc: RpcConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Unacknowledged sends allowed before `send` fails fast.
    pub max_in_flight: usize,
    /// Largest packet body accepted from a stream.
    pub max_packet_bytes: usize,
    /// If true, losing the stream is a warning and the pipe waits for a
    /// replacement. If false, it ends the composition.
    ///
    /// Defaults to true. Pending sends and calls then wait until a new
    /// stream is attached or the channel is closed, even after a clean EOF
    /// from a peer that has exited. Embedders that never reattach should
    /// set this to false.
    pub reconnect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// Working buffer size for envelope chunks. Max 65535.
    pub chunk_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// How often a blocked caller wakes to recheck channel liveness.
    pub liveness_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// "stdio", "listen" or "connect".
    pub transport: String,
    /// Socket address for "listen" and "connect".
    pub address: String,
    /// Wrap stream writes in envelope framing.
    pub envelope: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4096,
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            reconnect: true,
        }
    }
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            liveness_interval_ms: 500,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".to_string(),
            address: "127.0.0.1:7300".to_string(),
            envelope: true,
        }
    }
}

impl PipeConfig {
    /// `max_in_flight`, clamped to `1..=MAX_IN_FLIGHT_CEILING`.
    pub fn in_flight_limit(&self) -> usize {
        self.max_in_flight.clamp(1, MAX_IN_FLIGHT_CEILING)
    }
}

impl RpcConfig {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tether")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TetherConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply TETHER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TETHER_PIPE__MAX_IN_FLIGHT") {
            if let Ok(n) = v.parse() {
                self.pipe.max_in_flight = n;
            }
        }
        if let Ok(v) = std::env::var("TETHER_PIPE__MAX_PACKET_BYTES") {
            if let Ok(n) = v.parse() {
                self.pipe.max_packet_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("TETHER_PIPE__RECONNECT") {
            self.pipe.reconnect = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TETHER_ENVELOPE__CHUNK_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.envelope.chunk_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("TETHER_RPC__LIVENESS_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.rpc.liveness_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("TETHER_AGENT__TRANSPORT") {
            self.agent.transport = v;
        }
        if let Ok(v) = std::env::var("TETHER_AGENT__ADDRESS") {
            self.agent.address = v;
        }
        if let Ok(v) = std::env::var("TETHER_AGENT__ENVELOPE") {
            self.agent.envelope = v == "true" || v == "1";
        }
    }
}
