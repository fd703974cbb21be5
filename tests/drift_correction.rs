// Integration test: Drift checkpoints and correction
//
// A host whose beats arrive consistently late is followed block by block.
// Drift is only corrected at the configured checkpoint, and never while a
// dependent track is busy.

use loopsync::config::DriftCheckPoint;
use loopsync::sync::FunctionOutcome;
use loopsync::{
    CaptureSink, Counter, Diagnostics, HostTimeInfo, RealtimeEventQueue, SyncConfig, SyncFunction,
    SyncSource, Synchronizer, TrackId, TrackMode, VirtualTrack, clock_transport, config_channel,
};
use std::sync::Arc;

const SAMPLE_RATE: f64 = 44100.0;
const BLOCK: usize = 441;
const BEAT: i64 = 22050;
const LOOP: i64 = 4 * BEAT;
/// Host beats are reported this many frames after their ideal position
const LATE: i64 = 100;

fn synchronizer(config: SyncConfig) -> Synchronizer {
    let diagnostics = Arc::new(Diagnostics::default());
    let (_publisher, receiver) = config_channel(config, diagnostics.clone());
    let (_midi_in, midi) = RealtimeEventQueue::new(SyncSource::Midi, 256, diagnostics.clone());
    let (transport, _generator) = clock_transport(
        SAMPLE_RATE,
        Box::new(CaptureSink::new()),
        256,
        diagnostics.clone(),
    );
    let mut sync = Synchronizer::new(SAMPLE_RATE, receiver, midi, transport, 8, diagnostics);
    sync.sync_tracker_mut(SyncSource::Host)
        .unwrap()
        .lock(0, 4, LOOP, 1.0, 4)
        .unwrap();
    sync
}

fn host_tracks() -> Vec<VirtualTrack> {
    vec![
        VirtualTrack::new(0, Some(SyncSource::Host)).with_loop(LOOP, 1),
        VirtualTrack::new(1, Some(SyncSource::Host)).with_loop(LOOP, 1),
    ]
}

/// Host position for the block starting at `position`
fn host_info(position: i64) -> HostTimeInfo {
    let block = BLOCK as i64;
    // First beat reported at or after the block start
    let next = (position - LATE + BEAT - 1).div_euclid(BEAT);
    let reported = next * BEAT + LATE;
    let (beat, boundary) = if reported < position + block {
        (next, Some((reported - position) as usize))
    } else {
        ((position - LATE).div_euclid(BEAT).max(0), None)
    };
    HostTimeInfo {
        tempo: 120.0,
        beat,
        beats_per_bar: 4,
        beat_boundary: boundary.is_some(),
        bar_boundary: boundary.is_some() && beat % 4 == 0,
        boundary_offset: boundary.unwrap_or(0),
        playing: true,
    }
}

/// Play `blocks` blocks, reporting loop start points for `report` tracks
fn run(
    sync: &mut Synchronizer,
    tracks: &mut [VirtualTrack],
    position: &mut i64,
    blocks: usize,
    report: &[TrackId],
) {
    for _ in 0..blocks {
        sync.interrupt_start(BLOCK, Some(&host_info(*position)));
        for track in tracks.iter_mut() {
            if track.advance(BLOCK) && report.contains(&track.id) {
                sync.loop_local_start_point(track.id, 0);
            }
        }
        sync.interrupt_end(tracks);
        *position += BLOCK as i64;
    }
}

fn external_checkpoint(max_sync_drift: i64) -> SyncConfig {
    SyncConfig {
        drift_check_point: DriftCheckPoint::External,
        max_sync_drift,
        ..SyncConfig::default()
    }
}

#[test]
fn test_late_host_measured_as_drift() {
    let mut sync = synchronizer(external_checkpoint(50));
    let mut tracks = host_tracks();
    let mut position = 0;

    // One beat in, well before the external loop wraps
    run(&mut sync, &mut tracks, &mut position, 60, &[]);
    assert_eq!(sync.sync_tracker(SyncSource::Host).unwrap().get_drift(), LATE);
    assert_eq!(sync.status().drift_of(SyncSource::Host), LATE);
    assert_eq!(sync.diagnostics().count(Counter::Correction), 0);
}

#[test]
fn test_corrected_when_external_loop_wraps() {
    let mut sync = synchronizer(external_checkpoint(50));
    let mut tracks = host_tracks();
    let mut position = 0;

    run(&mut sync, &mut tracks, &mut position, 199, &[]);
    assert_eq!(sync.diagnostics().count(Counter::Correction), 0);

    // Block 200 ends exactly on the external loop boundary
    run(&mut sync, &mut tracks, &mut position, 1, &[]);
    assert_eq!(sync.diagnostics().count(Counter::Correction), 1);
    assert_eq!(sync.sync_tracker(SyncSource::Host).unwrap().get_drift(), 0);
    assert_eq!(tracks[0].frame, LOOP - LATE);
    assert_eq!(tracks[1].frame, LOOP - LATE);

    // The late downbeat now lands where the tracker expects it
    run(&mut sync, &mut tracks, &mut position, 1, &[]);
    assert_eq!(sync.sync_tracker(SyncSource::Host).unwrap().get_drift(), 0);
}

#[test]
fn test_small_drift_left_alone() {
    let mut sync = synchronizer(external_checkpoint(2048));
    let mut tracks = host_tracks();
    let mut position = 0;

    run(&mut sync, &mut tracks, &mut position, 200, &[]);
    assert_eq!(sync.diagnostics().count(Counter::Correction), 0);
    assert_eq!(sync.sync_tracker(SyncSource::Host).unwrap().get_drift(), LATE);
    assert_eq!(tracks[0].frame, 0);
}

#[test]
fn test_forced_correction_ignores_threshold() {
    let mut sync = synchronizer(external_checkpoint(2048));
    let mut tracks = host_tracks();
    let mut position = 0;

    run(&mut sync, &mut tracks, &mut position, 100, &[]);
    assert_eq!(
        sync.invoke(SyncFunction::DriftCorrect, TrackId(0), &mut tracks, 0),
        FunctionOutcome::CorrectionScheduled
    );
    run(&mut sync, &mut tracks, &mut position, 100, &[]);
    assert_eq!(sync.diagnostics().count(Counter::Correction), 1);
    assert_eq!(tracks[0].frame, LOOP - LATE);

    // The force is used up
    run(&mut sync, &mut tracks, &mut position, 200, &[]);
    assert_eq!(sync.diagnostics().count(Counter::Correction), 1);
}

#[test]
fn test_correction_deferred_while_recording() {
    let mut sync = synchronizer(external_checkpoint(50));
    let mut tracks = host_tracks();
    let mut position = 0;

    run(&mut sync, &mut tracks, &mut position, 150, &[]);
    tracks[1].mode = TrackMode::Record;
    run(&mut sync, &mut tracks, &mut position, 50, &[]);

    assert_eq!(sync.diagnostics().count(Counter::Correction), 0);
    assert_eq!(sync.diagnostics().count(Counter::DeferredCorrection), 1);
    assert_eq!(sync.sync_tracker(SyncSource::Host).unwrap().get_drift(), LATE);
    assert_eq!(tracks[0].frame, 0);
}

#[test]
fn test_correction_deferred_while_feedback_lowered() {
    let mut sync = synchronizer(external_checkpoint(50));
    let mut tracks = host_tracks();
    tracks[0].feedback = 100;
    let mut position = 0;

    run(&mut sync, &mut tracks, &mut position, 200, &[]);
    assert_eq!(sync.diagnostics().count(Counter::Correction), 0);
    assert_eq!(sync.diagnostics().count(Counter::DeferredCorrection), 1);

    // Next wrap with full feedback goes through
    tracks[0].feedback = 127;
    run(&mut sync, &mut tracks, &mut position, 200, &[]);
    assert_eq!(sync.diagnostics().count(Counter::Correction), 1);
    assert_eq!(sync.sync_tracker(SyncSource::Host).unwrap().get_drift(), 0);
}

#[test]
fn test_loop_checkpoint_follows_first_track() {
    let mut sync = synchronizer(SyncConfig {
        drift_check_point: DriftCheckPoint::Loop,
        max_sync_drift: 50,
        ..SyncConfig::default()
    });
    let mut tracks = host_tracks();
    let mut position = 0;

    // Only the second follower reports its start point: no checkpoint
    run(&mut sync, &mut tracks, &mut position, 200, &[TrackId(1)]);
    assert_eq!(sync.diagnostics().count(Counter::Correction), 0);
    assert_eq!(sync.sync_tracker(SyncSource::Host).unwrap().get_drift(), LATE);

    run(&mut sync, &mut tracks, &mut position, 200, &[TrackId(0)]);
    assert_eq!(sync.diagnostics().count(Counter::Correction), 1);
    assert_eq!(tracks[0].frame, LOOP - LATE);
}
