//! Playback: the rate-limited pipeline and the broadcast session around it

pub mod engine;
pub mod throttle;

pub use engine::{
    CompletionReason, Engine, EngineEvent, EngineStatus, Playback, PlaybackOutcome, PlaybackState,
};
pub use throttle::{ThrottleExit, ThrottleHandle};
