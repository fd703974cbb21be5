// Synchronized recording - per-track state while a recording follows a source

use crate::sync::pulse::SyncSource;
use crate::sync::track::TrackId;

/// What the loop engine should do with a record start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStart {
    /// Start recording immediately
    Now,
    /// Enter Synchronize and wait for a start pulse
    Synchronize,
}

/// Result of scheduling, extending or undoing a record stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSchedule {
    /// Stop immediately
    Now,
    /// A later pulse ends the recording, reported by use_event
    Pending,
    /// Stop when the recording reaches this many frames
    At { frame: i64 },
}

/// Transient state of one synchronized recording
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordSyncState {
    pub track: TrackId,
    pub source: SyncSource,
    /// Pulse number of the pulse that started the recording
    pub origin_pulse: u64,
    /// Counted pulses per loop cycle
    pub cycle_pulses: u32,
    /// Tracker-synthesized pulses are authoritative for this recording
    pub tracker_locked_at_start: bool,
    /// Waiting for a precomputed stop frame instead of a pulse
    pub rounding: bool,
    /// Still in Synchronize, waiting for the start pulse
    pub waiting_start: bool,
    /// Counted pulses since the recording started
    pub pulses: u32,
    /// Optimistic cycle count, one ahead while a cycle is in progress
    pub cycles: u32,
    pub stop_pending: bool,
    /// Units the recording must reach before it may stop
    pub units_required: u32,
    /// Counted pulses per unit
    pub unit_pulses: u32,
    /// Units added by one extension
    pub extend_units: u32,
    /// Frames per unit on the precomputed path
    pub unit_frames: i64,
    pub stop_frame: Option<i64>,
}

impl RecordSyncState {
    pub fn new(track: TrackId, source: SyncSource, cycle_pulses: u32) -> Self {
        Self {
            track,
            source,
            origin_pulse: 0,
            cycle_pulses: cycle_pulses.max(1),
            tracker_locked_at_start: false,
            rounding: false,
            waiting_start: false,
            pulses: 0,
            cycles: 1,
            stop_pending: false,
            units_required: 0,
            unit_pulses: 1,
            extend_units: 1,
            unit_frames: 0,
            stop_frame: None,
        }
    }

    /// Count one pulse, true when a cycle boundary was crossed
    pub fn count_pulse(&mut self) -> bool {
        self.pulses += 1;
        if self.pulses % self.cycle_pulses == 0 {
            self.cycles += 1;
            true
        } else {
            false
        }
    }

    pub fn completed_units(&self) -> u32 {
        self.pulses / self.unit_pulses.max(1)
    }

    /// Pulsed stop reached its unit count
    pub fn stop_reached(&self) -> bool {
        self.stop_pending && !self.rounding && self.pulses >= self.units_required * self.unit_pulses
    }

    /// Cycles of the finished recording
    ///
    /// The optimistic count is rounded back to one cycle unless the recording
    /// ended exactly on a cycle boundary.
    pub fn final_cycles(&self) -> u32 {
        if self.pulses > 0 && self.pulses % self.cycle_pulses == 0 {
            self.pulses / self.cycle_pulses
        } else {
            1
        }
    }

    /// Units needed so the stop lands at or after `recorded_frames`
    pub fn units_covering(&self, recorded_frames: i64) -> u32 {
        if self.unit_frames <= 0 {
            return self.units_required;
        }
        let units = (recorded_frames + self.unit_frames - 1) / self.unit_frames;
        (units.max(0) as u32).max(self.units_required)
    }

    /// Recompute the precomputed stop frame
    pub fn precomputed_stop(&mut self, recorded_frames: i64) -> StopSchedule {
        self.units_required = self.units_covering(recorded_frames).max(1);
        let frame = self.units_required as i64 * self.unit_frames;
        self.stop_frame = Some(frame);
        StopSchedule::At { frame }
    }
}

/// Frames per beat at `tempo`, 0 when the tempo is unknown
pub fn frames_per_beat(sample_rate: f64, tempo: f64) -> f64 {
    if tempo <= 0.0 {
        0.0
    } else {
        sample_rate * 60.0 / tempo
    }
}

/// Tempo of a loop cycle holding `beats` beats
pub fn tempo_for_cycle(sample_rate: f64, cycle_frames: i64, beats: u32) -> f64 {
    if cycle_frames <= 0 {
        0.0
    } else {
        sample_rate * 60.0 * beats as f64 / cycle_frames as f64
    }
}

/// Bring `tempo` into [min, max] by halving or doubling, adjusting the pulse
/// count in lock-step so pulses/frames stays exact
///
/// Halving stops once the pulse count is odd. Returns the new tempo and
/// pulse count.
pub fn clamp_tempo(mut tempo: f64, mut pulses: u32, min_tempo: f64, max_tempo: f64) -> (f64, u32) {
    if tempo <= 0.0 || pulses == 0 {
        return (tempo, pulses);
    }
    let max_tempo = max_tempo.max(min_tempo);
    while tempo > max_tempo && pulses % 2 == 0 {
        tempo /= 2.0;
        pulses /= 2;
    }
    while tempo < min_tempo && pulses < u32::MAX / 2 {
        tempo *= 2.0;
        pulses *= 2;
    }
    (tempo, pulses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_per_beat() {
        assert_eq!(frames_per_beat(44100.0, 120.0), 22050.0);
        assert_eq!(frames_per_beat(44100.0, 0.0), 0.0);
    }

    #[test]
    fn test_precomputed_stop() {
        let mut state = RecordSyncState::new(TrackId(0), SyncSource::Host, 4);
        state.unit_frames = 88200;
        state.units_required = 1;
        assert_eq!(state.precomputed_stop(1000), StopSchedule::At { frame: 88200 });

        // Already past the first bar
        assert_eq!(state.precomputed_stop(90000), StopSchedule::At { frame: 176400 });
        assert_eq!(state.units_required, 2);
    }

    #[test]
    fn test_cycle_rounding() {
        let mut state = RecordSyncState::new(TrackId(0), SyncSource::Midi, 4);
        for _ in 0..8 {
            state.count_pulse();
        }
        assert_eq!(state.cycles, 3);
        assert_eq!(state.final_cycles(), 2);

        state.count_pulse();
        assert_eq!(state.final_cycles(), 1);
    }

    #[test]
    fn test_stop_reached() {
        let mut state = RecordSyncState::new(TrackId(0), SyncSource::Midi, 4);
        state.unit_pulses = 4;
        state.units_required = 1;
        state.stop_pending = true;
        for _ in 0..3 {
            state.count_pulse();
        }
        assert!(!state.stop_reached());
        state.count_pulse();
        assert!(state.stop_reached());
        assert_eq!(state.completed_units(), 1);
    }

    #[test]
    fn test_clamp_tempo() {
        // 2 second bar of 4 beats
        let tempo = tempo_for_cycle(44100.0, 88200, 4);
        assert_eq!(tempo, 120.0);

        assert_eq!(clamp_tempo(480.0, 16 * 24, 20.0, 300.0), (240.0, 8 * 24));
        assert_eq!(clamp_tempo(15.0, 24, 20.0, 300.0), (30.0, 48));
        // Three beats halve into a bar of one and a half beats
        assert_eq!(clamp_tempo(450.0, 3 * 24, 20.0, 300.0), (225.0, 36));
        assert_eq!(clamp_tempo(2000.0, 3 * 24, 20.0, 300.0), (250.0, 9));
        // Odd pulse count cannot be halved further
        assert_eq!(clamp_tempo(4000.0, 3 * 24, 20.0, 300.0), (500.0, 9));
        // Conflicting bounds, the minimum wins
        assert_eq!(clamp_tempo(50.0, 96, 100.0, 60.0), (100.0, 192));
    }
}
