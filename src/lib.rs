//! # FX Radio
//!
//! Live audio broadcast engine with real-time sound effect splicing.
//!
//! ## Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────┐
//!                        │  Control (start/stop/fx) │
//!                        └────────────┬─────────────┘
//!                                     │
//!  ┌────────────┐   ┌─────────────────▼──────────────────┐
//!  │ Source file├──►│ Throttle (probed bitrate / divisor) ├──┐
//!  └────────────┘   └────────────────────────────────────┘  │
//!                                                            ▼
//!  during a splice:                                  ┌──────────────┐
//!  ┌────────────┐   ┌───────────┐   ┌──────────┐     │ Broadcaster  │
//!  │ Source file├──►│ sox -m    ├──►│ Throttle ├────►│  (fan-out)   │
//!  └────────────┘   │ + effect  │   └──────────┘     └──────┬───────┘
//!                   └───────────┘                           │
//!                                              ┌────────────┼────────────┐
//!                                              ▼            ▼            ▼
//!                                         Listener 0   Listener 1   Listener N
//! ```
//!
//! The [`playback::Engine`] owns the broadcast session. Exactly one throttle
//! is live at any time; a splice detaches the source reader from the live
//! throttle, routes it through the mixer and hands the mixed output to a
//! fresh throttle feeding the same [`broadcast::Broadcaster`].

pub mod audio;
pub mod broadcast;
pub mod config;
pub mod control;
pub mod error;
pub mod playback;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Bitrate used when the source cannot be analysed (bits per second)
    pub const DEFAULT_FALLBACK_BITRATE: u64 = 128_000;

    /// Divisor turning a probed bitrate into a throttle byte rate
    pub const DEFAULT_BITRATE_DIVISOR: u64 = 8;

    /// Default HTTP port for the web UI and listener stream
    pub const DEFAULT_HTTP_PORT: u16 = 3000;

    /// Chunks buffered per listener before it is considered lagging
    pub const DEFAULT_LISTENER_QUEUE_CHUNKS: usize = 64;

    /// Smallest chunk the throttle reads from its upstream
    pub const MIN_THROTTLE_CHUNK: usize = 512;

    /// Largest chunk the throttle reads from its upstream
    pub const MAX_THROTTLE_CHUNK: usize = 16 * 1024;

    /// Throttle chunks are sized to roughly this fraction of a second
    pub const THROTTLE_CHUNKS_PER_SECOND: f64 = 10.0;

    /// Capacity of the engine event channel
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
}
