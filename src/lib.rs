pub mod admin;
pub mod catalog;
pub mod config;
pub mod gate;
pub mod playback;
pub mod recorder;
pub mod sequencer;
pub mod session;
pub mod table;

/// Extension of stimulus files (matched case-insensitively)
pub const AUDIO_EXTENSION: &str = "wav";

/// Application name for XDG paths
pub const APP_NAME: &str = "listening-lab";
