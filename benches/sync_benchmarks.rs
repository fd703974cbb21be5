use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use loopsync::midi::RealtimeMessage;
use loopsync::sync::pool::EventPool;
use loopsync::sync::tracker::SyncTracker;
use loopsync::{
    CaptureSink, Diagnostics, HostTimeInfo, PulseType, RealtimeEventQueue, SyncConfig, SyncPulse,
    SyncSource, Synchronizer, VirtualTrack, clock_transport, config_channel,
};
use std::sync::Arc;

const SAMPLE_RATE: f64 = 48000.0;

fn synchronizer() -> Synchronizer {
    let diagnostics = Arc::new(Diagnostics::default());
    let (_publisher, receiver) = config_channel(SyncConfig::default(), diagnostics.clone());
    let (_midi_in, midi) = RealtimeEventQueue::new(SyncSource::Midi, 256, diagnostics.clone());
    let (transport, _generator) = clock_transport(
        SAMPLE_RATE,
        Box::new(CaptureSink::new()),
        256,
        diagnostics.clone(),
    );
    Synchronizer::new(SAMPLE_RATE, receiver, midi, transport, 8, diagnostics)
}

/// Full block cycle with a locked host tracker (runs on every audio callback)
fn bench_block_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_cycle");

    for buffer_size in [64usize, 256, 512, 1024] {
        let mut sync = synchronizer();
        sync.sync_tracker_mut(SyncSource::Host)
            .unwrap()
            .lock(0, 4, 96000, 1.0, 4)
            .unwrap();
        let mut tracks = vec![
            VirtualTrack::new(0, Some(SyncSource::Host)).with_loop(96000, 1),
            VirtualTrack::new(1, Some(SyncSource::Host)).with_loop(96000, 1),
        ];
        let info = HostTimeInfo {
            tempo: 120.0,
            beat: 0,
            beats_per_bar: 4,
            beat_boundary: false,
            bar_boundary: false,
            boundary_offset: 0,
            playing: true,
        };

        group.bench_with_input(
            BenchmarkId::from_parameter(buffer_size),
            &buffer_size,
            |b, &size| {
                b.iter(|| {
                    sync.interrupt_start(size, Some(&info));
                    for track in tracks.iter_mut() {
                        sync.prepare(&*track);
                        while sync.get_next_event().is_some() {
                            black_box(sync.use_event(track));
                        }
                        sync.finish(&*track);
                        track.advance(size);
                    }
                    sync.interrupt_end(&mut tracks);
                });
            },
        );
    }

    group.finish();
}

/// Draining one beat of MIDI clock
fn bench_queue_drain(c: &mut Criterion) {
    let diagnostics = Arc::new(Diagnostics::default());
    let (mut producer, mut queue) = RealtimeEventQueue::new(SyncSource::Midi, 256, diagnostics);
    producer.add_at(RealtimeMessage::Start, 0);
    producer.add_at(RealtimeMessage::Clock, 0);
    let mut pulses = Vec::with_capacity(64);
    queue.drain(256, &mut pulses);
    let mut timestamp = 0u64;

    c.bench_function("queue_drain_24_clocks", |b| {
        b.iter(|| {
            for _ in 0..24 {
                timestamp += 20_833;
                producer.add_at(RealtimeMessage::Clock, timestamp);
            }
            pulses.clear();
            black_box(queue.drain(256, &mut pulses));
        });
    });
}

/// Tracker advance with pulse synthesis
fn bench_tracker_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_advance");

    for pulses_per_loop in [4u32, 96, 384] {
        let mut tracker = SyncTracker::new(SyncSource::Midi, Arc::new(Diagnostics::default()));
        let _ = tracker.lock(0, pulses_per_loop, 96000, 1.0, 4);
        let mut sink = Vec::with_capacity(64);

        group.bench_with_input(
            BenchmarkId::from_parameter(pulses_per_loop),
            &pulses_per_loop,
            |b, _| {
                b.iter(|| {
                    sink.clear();
                    tracker.advance(black_box(512), Some(&mut sink));
                    let mut pulse = SyncPulse::pulse(SyncSource::Midi, PulseType::Clock, 1);
                    tracker.event(&mut pulse);
                    black_box(tracker.get_drift());
                });
            },
        );
    }

    group.finish();
}

/// Event pool acquire/release (one pair per sync event)
fn bench_event_pool(c: &mut Criterion) {
    let mut pool = EventPool::new(256);
    let pulse = SyncPulse::pulse(SyncSource::Host, PulseType::Beat, 1);

    c.bench_function("event_pool_acquire_release", |b| {
        b.iter(|| {
            if let Some(handle) = pool.acquire(black_box(pulse)) {
                black_box(pool.release(handle));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_block_cycle,
    bench_queue_drain,
    bench_tracker_advance,
    bench_event_pool
);
criterion_main!(benches);
