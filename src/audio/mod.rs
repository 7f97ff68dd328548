//! Audio subsystem: external tool access, analysis, mixing and effect lookup

pub mod effects;
pub mod mixer;
pub mod probe;
pub mod sox;

pub use effects::EffectLibrary;
pub use mixer::{EffectMixer, MixSettings};
pub use probe::BitrateProber;
pub use sox::{AudioReader, SoxRunner, SystemSox};
