// Sync status - point-in-time state published by the audio thread for the UI

use crate::sync::pulse::SyncSource;
use crate::sync::track::TrackId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

const NO_TRACK: u32 = u32::MAX;

/// Per-tracker values
#[derive(Debug, Default)]
struct TrackerStatus {
    locked: AtomicBool,
    drift: AtomicI64,
    loop_frames: AtomicI64,
    pulse: AtomicU32,
    tempo_bits: AtomicU64,
}

/// Shared status, written once per block, read from any thread
#[derive(Debug)]
pub struct SharedSyncStatus {
    trackers: [TrackerStatus; 3],
    out_tempo_bits: AtomicU64,
    out_sending: AtomicBool,
    out_started: AtomicBool,
    out_beat: AtomicU64,
    out_bar: AtomicU64,
    out_starts: AtomicU64,
    midi_receiving: AtomicBool,
    midi_started: AtomicBool,
    midi_tempo_bits: AtomicU64,
    midi_beat: AtomicU64,
    host_playing: AtomicBool,
    host_tempo_bits: AtomicU64,
    track_master: AtomicU32,
    out_master: AtomicU32,
    blocks: AtomicU64,
}

/// Plain snapshot of SharedSyncStatus
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SyncStatus {
    pub out_tempo: f64,
    pub out_sending: bool,
    pub out_started: bool,
    pub out_beat: u64,
    pub out_bar: u64,
    pub out_starts: u64,
    pub midi_receiving: bool,
    pub midi_started: bool,
    pub midi_tempo: f64,
    pub midi_beat: u64,
    pub host_playing: bool,
    pub host_tempo: f64,
    pub track_sync_master: Option<TrackId>,
    pub out_sync_master: Option<TrackId>,
    pub locked: [bool; 3],
    pub drift: [i64; 3],
    pub blocks: u64,
}

impl SyncStatus {
    pub fn drift_of(&self, source: SyncSource) -> i64 {
        source.tracker_index().map(|i| self.drift[i]).unwrap_or(0)
    }

    pub fn is_locked(&self, source: SyncSource) -> bool {
        source.tracker_index().map(|i| self.locked[i]).unwrap_or(false)
    }
}

/// Values written for one tracker
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerSnapshot {
    pub locked: bool,
    pub drift: i64,
    pub loop_frames: i64,
    pub pulse: u32,
    pub tempo: f64,
}

fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}

fn store_track(cell: &AtomicU32, id: Option<TrackId>) {
    cell.store(id.map(|t| t.0).unwrap_or(NO_TRACK), Ordering::Relaxed);
}

fn load_track(cell: &AtomicU32) -> Option<TrackId> {
    match cell.load(Ordering::Relaxed) {
        NO_TRACK => None,
        id => Some(TrackId(id)),
    }
}

impl SharedSyncStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            trackers: Default::default(),
            out_tempo_bits: AtomicU64::new(0),
            out_sending: AtomicBool::new(false),
            out_started: AtomicBool::new(false),
            out_beat: AtomicU64::new(0),
            out_bar: AtomicU64::new(0),
            out_starts: AtomicU64::new(0),
            midi_receiving: AtomicBool::new(false),
            midi_started: AtomicBool::new(false),
            midi_tempo_bits: AtomicU64::new(0),
            midi_beat: AtomicU64::new(0),
            host_playing: AtomicBool::new(false),
            host_tempo_bits: AtomicU64::new(0),
            track_master: AtomicU32::new(NO_TRACK),
            out_master: AtomicU32::new(NO_TRACK),
            blocks: AtomicU64::new(0),
        })
    }

    pub fn set_tracker(&self, source: SyncSource, snapshot: TrackerSnapshot) {
        let Some(index) = source.tracker_index() else {
            return;
        };
        let tracker = &self.trackers[index];
        tracker.locked.store(snapshot.locked, Ordering::Relaxed);
        tracker.drift.store(snapshot.drift, Ordering::Relaxed);
        tracker.loop_frames.store(snapshot.loop_frames, Ordering::Relaxed);
        tracker.pulse.store(snapshot.pulse, Ordering::Relaxed);
        store_f64(&tracker.tempo_bits, snapshot.tempo);
    }

    pub fn tracker(&self, source: SyncSource) -> TrackerSnapshot {
        let Some(index) = source.tracker_index() else {
            return TrackerSnapshot::default();
        };
        let tracker = &self.trackers[index];
        TrackerSnapshot {
            locked: tracker.locked.load(Ordering::Relaxed),
            drift: tracker.drift.load(Ordering::Relaxed),
            loop_frames: tracker.loop_frames.load(Ordering::Relaxed),
            pulse: tracker.pulse.load(Ordering::Relaxed),
            tempo: load_f64(&tracker.tempo_bits),
        }
    }

    pub fn set_out(&self, tempo: f64, sending: bool, started: bool, beat: u64, bar: u64, starts: u64) {
        store_f64(&self.out_tempo_bits, tempo);
        self.out_sending.store(sending, Ordering::Relaxed);
        self.out_started.store(started, Ordering::Relaxed);
        self.out_beat.store(beat, Ordering::Relaxed);
        self.out_bar.store(bar, Ordering::Relaxed);
        self.out_starts.store(starts, Ordering::Relaxed);
    }

    pub fn set_midi(&self, receiving: bool, started: bool, tempo: f64, beat: u64) {
        self.midi_receiving.store(receiving, Ordering::Relaxed);
        self.midi_started.store(started, Ordering::Relaxed);
        store_f64(&self.midi_tempo_bits, tempo);
        self.midi_beat.store(beat, Ordering::Relaxed);
    }

    pub fn set_host(&self, playing: bool, tempo: f64) {
        self.host_playing.store(playing, Ordering::Relaxed);
        store_f64(&self.host_tempo_bits, tempo);
    }

    pub fn set_masters(&self, track_master: Option<TrackId>, out_master: Option<TrackId>) {
        store_track(&self.track_master, track_master);
        store_track(&self.out_master, out_master);
    }

    pub fn finish_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStatus {
        let mut locked = [false; 3];
        let mut drift = [0; 3];
        for (i, tracker) in self.trackers.iter().enumerate() {
            locked[i] = tracker.locked.load(Ordering::Relaxed);
            drift[i] = tracker.drift.load(Ordering::Relaxed);
        }

        SyncStatus {
            out_tempo: load_f64(&self.out_tempo_bits),
            out_sending: self.out_sending.load(Ordering::Relaxed),
            out_started: self.out_started.load(Ordering::Relaxed),
            out_beat: self.out_beat.load(Ordering::Relaxed),
            out_bar: self.out_bar.load(Ordering::Relaxed),
            out_starts: self.out_starts.load(Ordering::Relaxed),
            midi_receiving: self.midi_receiving.load(Ordering::Relaxed),
            midi_started: self.midi_started.load(Ordering::Relaxed),
            midi_tempo: load_f64(&self.midi_tempo_bits),
            midi_beat: self.midi_beat.load(Ordering::Relaxed),
            host_playing: self.host_playing.load(Ordering::Relaxed),
            host_tempo: load_f64(&self.host_tempo_bits),
            track_sync_master: load_track(&self.track_master),
            out_sync_master: load_track(&self.out_master),
            locked,
            drift,
            blocks: self.blocks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let status = SharedSyncStatus::new();
        status.set_out(120.0, true, true, 2, 5, 1);
        status.set_masters(Some(TrackId(3)), None);
        status.set_tracker(
            SyncSource::Midi,
            TrackerSnapshot {
                locked: true,
                drift: -12,
                loop_frames: 88200,
                pulse: 4,
                tempo: 120.0,
            },
        );
        status.finish_block();

        let snapshot = status.snapshot();
        assert_eq!(snapshot.out_tempo, 120.0);
        assert_eq!(snapshot.out_bar, 5);
        assert_eq!(snapshot.track_sync_master, Some(TrackId(3)));
        assert_eq!(snapshot.out_sync_master, None);
        assert!(snapshot.is_locked(SyncSource::Midi));
        assert_eq!(snapshot.drift_of(SyncSource::Midi), -12);
        assert_eq!(snapshot.drift_of(SyncSource::Track), 0);
        assert_eq!(snapshot.blocks, 1);
        assert_eq!(status.tracker(SyncSource::Midi).loop_frames, 88200);
    }

    #[test]
    fn test_readable_from_another_thread() {
        let status = SharedSyncStatus::new();
        let reader = status.clone();
        status.set_host(true, 98.5);

        let handle = std::thread::spawn(move || reader.snapshot());
        let snapshot = handle.join().unwrap();
        assert!(snapshot.host_playing);
        assert_eq!(snapshot.host_tempo, 98.5);
    }
}
