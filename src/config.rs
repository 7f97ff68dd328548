//! Application configuration
//!
//! Loaded once at startup from a TOML file. Every field has a default, so a
//! partial file (or none at all) is valid.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// File name looked up in the platform config directory
pub const CONFIG_FILE_NAME: &str = "fx-radio.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub audio: AudioConfig,
    pub broadcast: BroadcastConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the browser UI assets
    pub public_dir: PathBuf,
    /// Directory searched by effect name
    pub effects_dir: PathBuf,
    /// Source streamed after `start`
    pub default_source: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            public_dir: PathBuf::from("public"),
            effects_dir: PathBuf::from("audio/fx"),
            default_source: PathBuf::from("audio/songs/conversation.mp3"),
        }
    }
}

/// External audio tool and rate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Path or name of the sox binary
    pub sox_path: PathBuf,
    /// Bitrate used when probing fails (bits per second)
    pub fallback_bitrate: u64,
    /// Probed bitrate is divided by this to obtain the throttle byte rate
    pub bitrate_divisor: u64,
    /// Container type passed to the mixer (`-t`)
    pub media_type: String,
    /// Volume of the live source while an effect is mixed in
    pub song_volume: f32,
    /// Volume of the effect
    pub fx_volume: f32,
    /// Upper bound for a single probe; `None` waits indefinitely
    pub probe_timeout_secs: Option<u64>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sox_path: PathBuf::from("sox"),
            fallback_bitrate: DEFAULT_FALLBACK_BITRATE,
            bitrate_divisor: DEFAULT_BITRATE_DIVISOR,
            media_type: "mp3".to_string(),
            song_volume: 0.99,
            fx_volume: 0.1,
            probe_timeout_secs: Some(10),
        }
    }
}

impl AudioConfig {
    pub fn probe_timeout(&self) -> Option<Duration> {
        self.probe_timeout_secs.map(Duration::from_secs)
    }
}

/// Listener fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Chunks queued per listener before chunks are dropped for it
    pub listener_queue_chunks: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            listener_queue_chunks: DEFAULT_LISTENER_QUEUE_CHUNKS,
        }
    }
}

impl AppConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Load from an explicit path, the platform config directory, or defaults
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match default_config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::load(&path)
            }
            _ => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.audio.bitrate_divisor == 0 {
            return Err(Error::Config("audio.bitrate_divisor must be non-zero".into()));
        }
        if self.audio.fallback_bitrate == 0 {
            return Err(Error::Config("audio.fallback_bitrate must be non-zero".into()));
        }
        if self.broadcast.listener_queue_chunks == 0 {
            return Err(Error::Config(
                "broadcast.listener_queue_chunks must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Platform-specific location of the configuration file
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "fx-radio").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
