// Sync configuration - policies and thresholds read once per audio block

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where drift is checked and corrected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DriftCheckPoint {
    /// When the first track following the tracker crosses its own loop start
    #[default]
    Loop,
    /// When the tracker's external loop wraps to zero
    External,
}

/// How the MIDI input tempo is estimated from clock intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TempoEstimation {
    /// Plain average of recent clock intervals
    Average,
    /// Average rounded to tenths, only updated on significant change
    #[default]
    Smoothed,
}

/// Granularity of a realign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RealignTime {
    Now,
    Beat,
    Bar,
    #[default]
    Start,
}

/// What a realign of the out-sync master does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutRealignMode {
    /// Move the internal loop like any other track
    #[default]
    Realign,
    /// Leave the loop alone and resend MIDI Start to the external device
    RestartExternal,
}

/// What happens to clock output when the out-sync master is muted or paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MuteSyncMode {
    /// Send Stop, keep clocks running
    #[default]
    Transport,
    /// Stop clocks, no transport message
    Clocks,
    /// Send Stop and stop clocks
    Both,
    /// Ignore mute and pause
    None,
}

/// Quantization unit for MIDI/Host/Out synchronized recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncUnit {
    Beat,
    #[default]
    Bar,
}

/// Quantization unit for track-sync recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrackUnit {
    Subcycle,
    #[default]
    Cycle,
    Loop,
}

/// Sync engine configuration
///
/// Published to the audio thread as a whole object, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Drift (frames) above which a checkpoint triggers correction
    pub max_sync_drift: i64,
    pub drift_check_point: DriftCheckPoint,
    pub midi_tempo_mode: TempoEstimation,
    pub beats_per_bar: u32,
    pub min_tempo: f64,
    pub max_tempo: f64,
    pub realign_time: RealignTime,
    pub out_realign_mode: OutRealignMode,
    /// Suppress the automatic MIDI Start when the out-sync master is recorded
    pub manual_start: bool,
    pub mute_sync_mode: MuteSyncMode,
    pub record_unit: SyncUnit,
    pub track_unit: TrackUnit,
    /// Input latency compensation (frames) for raw MIDI stops
    pub input_latency: i64,
    pub output_latency: i64,
    /// Capacity of each realtime queue
    pub queue_capacity: usize,
    /// Time since the last clock after which MIDI input is considered idle
    pub clock_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_sync_drift: 2048,
            drift_check_point: DriftCheckPoint::default(),
            midi_tempo_mode: TempoEstimation::default(),
            beats_per_bar: 4,
            min_tempo: 20.0,
            max_tempo: 300.0,
            realign_time: RealignTime::default(),
            out_realign_mode: OutRealignMode::default(),
            manual_start: false,
            mute_sync_mode: MuteSyncMode::default(),
            record_unit: SyncUnit::default(),
            track_unit: TrackUnit::default(),
            input_latency: 0,
            output_latency: 0,
            queue_capacity: 128,
            clock_timeout_ms: 1000,
        }
    }
}

impl SyncConfig {
    /// Parse a RON document, missing fields take their defaults
    pub fn from_ron_str(text: &str) -> Result<Self, SyncError> {
        let mut config: SyncConfig = ron::from_str(text)?;
        config.validate();
        Ok(config)
    }

    /// Load from a RON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }

    pub fn to_ron_string(&self) -> Result<String, SyncError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Repair inconsistent values in place
    ///
    /// A conflicting tempo range is resolved in favor of the minimum.
    pub fn validate(&mut self) {
        if self.beats_per_bar == 0 {
            self.beats_per_bar = 4;
        }
        if self.min_tempo <= 0.0 {
            self.min_tempo = 20.0;
        }
        if self.max_tempo < self.min_tempo {
            self.max_tempo = self.min_tempo;
        }
        if self.max_sync_drift < 0 {
            self.max_sync_drift = -self.max_sync_drift;
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = 128;
        }
    }
}
