// Error types for the synchronization engine

use crate::sync::pulse::SyncSource;
use thiserror::Error;

/// Errors surfaced by the non-realtime parts of the sync engine.
///
/// The audio callback never propagates these; it logs them through
/// `Diagnostics` and degrades to "no sync" or "deferred correction".
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Negative tempo: {0} BPM")]
    NegativeTempo(f64),

    #[error("Invalid loop length: {0} frames")]
    InvalidLoopLength(i64),

    #[error("Tracker already locked: {0:?}")]
    TrackerLocked(SyncSource),

    #[error("MIDI init error: {0}")]
    MidiInit(String),

    #[error("MIDI connection error: {0}")]
    MidiConnect(String),

    #[error("MIDI send error: {0}")]
    MidiSend(String),

    #[error("Audio device error: {0}")]
    Audio(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RON error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}
