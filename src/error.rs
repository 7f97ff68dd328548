//! Error types for the broadcast engine

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Effect error: {0}")]
    Effect(#[from] EffectError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Playback pipeline and splice errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Source unavailable: {path}: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Already streaming")]
    AlreadyStreaming,

    #[error("Not streaming")]
    NotStreaming,

    #[error("An effect is already playing")]
    EffectInProgress,

    #[error("Effect lookup failed: {0}")]
    Effect(#[from] EffectError),

    #[error("Mixer failed: {0}")]
    Mixer(String),

    #[error("Pipeline failed: {0}")]
    Pipeline(#[from] std::io::Error),
}

/// Effect library lookup errors
#[derive(Error, Debug)]
pub enum EffectError {
    #[error("the effect {0} wasn't found!")]
    NotFound(String),

    #[error("Cannot read effects directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EffectError {
    /// True when the lookup itself succeeded but nothing matched
    pub fn is_not_found(&self) -> bool {
        matches!(self, EffectError::NotFound(_))
    }
}

/// Bitrate probe failures. Never surfaced past the prober.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to spawn analysis tool: {0}")]
    Spawn(std::io::Error),

    #[error("Failed to read analysis output: {0}")]
    Read(std::io::Error),

    #[error("Analysis tool reported: {0}")]
    Stderr(String),

    #[error("Unrecognized analysis output: {0:?}")]
    Unparsable(String),

    #[error("Analysis timed out")]
    Timeout,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
