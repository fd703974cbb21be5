// Integration test: Synchronized recording start and stop scheduling
//
// Drives the Synchronizer through invoke() the way a loop engine would and
// checks where recordings start and end for each sync source.

use loopsync::midi::event::RealtimeMessage;
use loopsync::sync::{FunctionOutcome, RecordStart, StopSchedule};
use loopsync::{
    CaptureSink, Diagnostics, HostTimeInfo, RealtimeEventQueue, RealtimeProducer, SyncConfig,
    SyncFunction, SyncOutcome, SyncSource, Synchronizer, TrackId, TrackMode, VirtualTrack,
    clock_transport, config_channel,
};
use std::sync::Arc;

const SAMPLE_RATE: f64 = 44100.0;
const BLOCK: usize = 256;

/// 120 BPM: 60_000_000 / (120 * 24)
const CLOCK_INTERVAL_US: u64 = 20833;

fn synchronizer(config: SyncConfig) -> (Synchronizer, RealtimeProducer) {
    let diagnostics = Arc::new(Diagnostics::default());
    let (_publisher, receiver) = config_channel(config, diagnostics.clone());
    let (midi_in, midi) = RealtimeEventQueue::new(SyncSource::Midi, 256, diagnostics.clone());
    let (transport, _generator) = clock_transport(
        SAMPLE_RATE,
        Box::new(CaptureSink::new()),
        256,
        diagnostics.clone(),
    );
    let sync = Synchronizer::new(SAMPLE_RATE, receiver, midi, transport, 8, diagnostics);
    (sync, midi_in)
}

fn host_stopped_at_120() -> HostTimeInfo {
    HostTimeInfo {
        tempo: 120.0,
        beat: 0,
        beats_per_bar: 4,
        beat_boundary: false,
        bar_boundary: false,
        boundary_offset: 0,
        playing: false,
    }
}

/// Run every pending event of the block against one track
fn consume(sync: &mut Synchronizer, track: &mut VirtualTrack) -> Vec<SyncOutcome> {
    let mut outcomes = Vec::new();
    sync.prepare(&*track);
    while sync.get_next_event().is_some() {
        match sync.use_event(track) {
            SyncOutcome::None => {}
            outcome => outcomes.push(outcome),
        }
    }
    sync.finish(&*track);
    outcomes
}

/// AutoRecord against a stopped host lands on exact bar frames
#[test]
fn test_auto_record_from_host_tempo() {
    let (mut sync, _midi_in) = synchronizer(SyncConfig::default());
    let mut tracks = vec![VirtualTrack::new(0, Some(SyncSource::Host))];
    sync.interrupt_start(BLOCK, Some(&host_stopped_at_120()));

    let outcome = sync.invoke(SyncFunction::AutoRecord { bars: 1 }, TrackId(0), &mut tracks, 0);
    assert_eq!(
        outcome,
        FunctionOutcome::AutoRecord {
            start: RecordStart::Now,
            stop: StopSchedule::At { frame: 88200 },
        }
    );
}

/// Invoking AutoRecord again while recording extends the stop by one bar each time
#[test]
fn test_auto_record_extensions_and_undo() {
    let (mut sync, _midi_in) = synchronizer(SyncConfig::default());
    let mut tracks = vec![VirtualTrack::new(0, Some(SyncSource::Host))];
    let function = SyncFunction::AutoRecord { bars: 1 };
    sync.interrupt_start(BLOCK, Some(&host_stopped_at_120()));

    sync.invoke(function, TrackId(0), &mut tracks, 0);
    tracks[0].mode = TrackMode::Record;
    tracks[0].frames = 10000;

    let mut previous = 88200;
    for _ in 0..3 {
        let FunctionOutcome::RecordStop(StopSchedule::At { frame }) =
            sync.invoke(function, TrackId(0), &mut tracks, 0)
        else {
            panic!("extension must keep a precomputed stop");
        };
        assert_eq!(frame, previous + 88200);
        previous = frame;
    }
    assert_eq!(previous, 4 * 88200);

    // Undo never goes below what is already recorded
    tracks[0].frames = 3 * 88200 + 1;
    assert_eq!(
        sync.invoke(SyncFunction::UndoRecordStop, TrackId(0), &mut tracks, 0),
        FunctionOutcome::RecordStop(StopSchedule::At { frame: 4 * 88200 })
    );
}

/// Clocks without Start give a tempo but no transport: record starts at once
/// and the stop is computed from the clock tempo
#[test]
fn test_midi_precomputed_stop_locks_tracker() {
    let (mut sync, mut midi_in) = synchronizer(SyncConfig::default());
    let mut tracks = vec![VirtualTrack::new(0, Some(SyncSource::Midi))];

    for clock in 0..25 {
        midi_in.add_at(RealtimeMessage::Clock, clock * CLOCK_INTERVAL_US);
    }
    sync.interrupt_start(BLOCK, None);
    assert!(!sync.midi_queue().is_started());
    assert_eq!(sync.source_tempo(SyncSource::Midi), 120.0);

    let outcome = sync.invoke(SyncFunction::AutoRecord { bars: 1 }, TrackId(0), &mut tracks, 0);
    assert_eq!(
        outcome,
        FunctionOutcome::AutoRecord {
            start: RecordStart::Now,
            stop: StopSchedule::At { frame: 88200 },
        }
    );

    tracks[0].mode = TrackMode::Record;
    tracks[0].frames = 88200;
    let result = sync.loop_record_stop(TrackId(0), &mut tracks, 0);
    tracks[0].mode = TrackMode::Play;

    assert_eq!(result.cycles, 1);
    assert_eq!(result.beats, 4);
    let tracker = sync.sync_tracker(SyncSource::Midi).unwrap();
    assert!(tracker.is_locked());
    assert_eq!(tracker.get_loop_frames(), 88200);
    assert_eq!(tracker.loop_pulses(), 4 * 24);
    assert_eq!(sync.masters().track_sync_master, Some(TrackId(0)));
}

/// Record pressed while MIDI is running waits for the next bar; with the
/// tracker still unlocked the stop is computed from the clock tempo
#[test]
fn test_midi_record_waits_for_bar() {
    let (mut sync, mut midi_in) = synchronizer(SyncConfig::default());
    let mut tracks = vec![VirtualTrack::new(0, Some(SyncSource::Midi))];

    midi_in.add_at(RealtimeMessage::Start, 0);
    midi_in.add_at(RealtimeMessage::Clock, 1);
    sync.interrupt_start(BLOCK, None);
    sync.interrupt_end(&mut tracks);

    assert_eq!(
        sync.invoke(SyncFunction::Record, TrackId(0), &mut tracks, 0),
        FunctionOutcome::RecordStart(RecordStart::Synchronize)
    );
    tracks[0].mode = TrackMode::Synchronize;

    // Beats 1 to 3 pass, clock 96 is the downbeat of bar 1
    let mut timestamp = 1;
    for _ in 0..72 {
        timestamp += CLOCK_INTERVAL_US;
        midi_in.add_at(RealtimeMessage::Clock, timestamp);
    }
    sync.interrupt_start(BLOCK, None);
    assert!(consume(&mut sync, &mut tracks[0]).is_empty());
    sync.interrupt_end(&mut tracks);

    for _ in 0..24 {
        timestamp += CLOCK_INTERVAL_US;
        midi_in.add_at(RealtimeMessage::Clock, timestamp);
    }
    sync.interrupt_start(BLOCK, None);
    assert_eq!(
        consume(&mut sync, &mut tracks[0]),
        vec![SyncOutcome::StartRecording { frame_offset: 0 }]
    );
    tracks[0].mode = TrackMode::Record;
    sync.interrupt_end(&mut tracks);

    assert_eq!(
        sync.invoke(SyncFunction::Record, TrackId(0), &mut tracks, 0),
        FunctionOutcome::RecordStop(StopSchedule::At { frame: 88200 })
    );
}

/// A stop requested before the start pulse cancels the recording
#[test]
fn test_stop_while_synchronizing_cancels() {
    let (mut sync, mut midi_in) = synchronizer(SyncConfig::default());
    let mut tracks = vec![VirtualTrack::new(0, Some(SyncSource::Midi))];

    midi_in.add_at(RealtimeMessage::Start, 0);
    midi_in.add_at(RealtimeMessage::Clock, 1);
    sync.interrupt_start(BLOCK, None);
    sync.interrupt_end(&mut tracks);

    sync.invoke(SyncFunction::Record, TrackId(0), &mut tracks, 0);
    tracks[0].mode = TrackMode::Synchronize;
    assert_eq!(
        sync.invoke(SyncFunction::Record, TrackId(0), &mut tracks, 0),
        FunctionOutcome::RecordStop(StopSchedule::Now)
    );
    assert!(sync.record_state(TrackId(0)).is_none());
}

/// Tracks without a sync source record freely
#[test]
fn test_unsynced_track_starts_now() {
    let (mut sync, _midi_in) = synchronizer(SyncConfig::default());
    let mut tracks = vec![VirtualTrack::new(0, None)];

    assert_eq!(
        sync.invoke(SyncFunction::Record, TrackId(0), &mut tracks, 0),
        FunctionOutcome::RecordStart(RecordStart::Now)
    );
    assert_eq!(
        sync.invoke(SyncFunction::Realign, TrackId(0), &mut tracks, 0),
        FunctionOutcome::Ignored
    );
}
