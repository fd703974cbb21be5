use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use loopsync::midi::input::MidiClockInput;
use loopsync::sync::function::FunctionOutcome;
use loopsync::sync::record::{RecordStart, StopSchedule};
use loopsync::{
    ClockThread, Diagnostics, LoopTrack, NullSink, PulseType, RealtimeEventQueue, SyncConfig,
    SyncError, SyncFunction, SyncOutcome, SyncSource, Synchronizer, TrackId, TrackMode,
    VirtualTrack, clock_transport, config_channel, open_output,
};
use std::time::Duration;

// Demo run length when no duration is given
const DEFAULT_RUN_SECONDS: u64 = 30;
const MAX_TRACKS: usize = 8;

/// Scripted loop functions: (seconds, function, track)
const SCRIPT: [(f64, SyncFunction, u32); 8] = [
    (1.0, SyncFunction::Record, 0),
    (5.0, SyncFunction::Record, 0),
    (6.0, SyncFunction::AutoRecord { bars: 1 }, 1),
    (7.0, SyncFunction::Record, 2),
    (11.0, SyncFunction::Record, 2),
    (14.0, SyncFunction::Realign, 1),
    (18.0, SyncFunction::MidiStop, 0),
    (20.0, SyncFunction::MidiStart, 0),
];

/// Stand-in for a loop engine: virtual tracks driven by the Synchronizer
struct DemoLooper {
    sync: Synchronizer,
    tracks: Vec<VirtualTrack>,
    stop_at: Vec<Option<i64>>,
    sample_rate: f64,
    elapsed: u64,
    next_step: usize,
}

impl DemoLooper {
    fn new(sync: Synchronizer, sample_rate: f64) -> Self {
        let tracks = vec![
            VirtualTrack::new(0, Some(SyncSource::Out)),
            VirtualTrack::new(1, Some(SyncSource::Track)),
            VirtualTrack::new(2, Some(SyncSource::Midi)),
        ];
        let stop_at = vec![None; tracks.len()];
        Self {
            sync,
            tracks,
            stop_at,
            sample_rate,
            elapsed: 0,
            next_step: 0,
        }
    }

    /// One audio block
    fn process(&mut self, frames: usize) {
        self.sync.interrupt_start(frames, None);
        self.run_script();
        self.master_pulses(frames);
        for i in 0..self.tracks.len() {
            self.process_track(i, frames);
        }
        self.sync.interrupt_end(&mut self.tracks);
        self.elapsed += frames as u64;
    }

    fn run_script(&mut self) {
        while let Some(&(seconds, function, track)) = SCRIPT.get(self.next_step) {
            if (seconds * self.sample_rate) as u64 > self.elapsed {
                break;
            }
            self.next_step += 1;
            let Some(i) = self.tracks.iter().position(|t| t.id == TrackId(track)) else {
                continue;
            };
            let outcome = self.sync.invoke(function, TrackId(track), &mut self.tracks, 0);
            log::info!("{} {}: {:?}", TrackId(track), function.name(), outcome);
            self.apply_outcome(i, outcome);
        }
    }

    fn apply_outcome(&mut self, i: usize, outcome: FunctionOutcome) {
        match outcome {
            FunctionOutcome::RecordStart(start) => self.apply_start(i, start),
            FunctionOutcome::AutoRecord { start, stop } => {
                self.apply_start(i, start);
                self.apply_stop(i, stop);
            }
            FunctionOutcome::RecordStop(stop) => self.apply_stop(i, stop),
            _ => {}
        }
    }

    fn apply_start(&mut self, i: usize, start: RecordStart) {
        let track = &mut self.tracks[i];
        match start {
            RecordStart::Now => {
                track.mode = TrackMode::Record;
                track.frames = 0;
                track.frame = 0;
            }
            RecordStart::Synchronize => track.mode = TrackMode::Synchronize,
        }
    }

    fn apply_stop(&mut self, i: usize, stop: StopSchedule) {
        match stop {
            StopSchedule::Now if self.tracks[i].mode == TrackMode::Synchronize => {
                // Stopped before the start pulse arrived
                let id = self.tracks[i].id;
                self.tracks[i].reset();
                self.sync.loop_reset(id, &mut self.tracks);
            }
            StopSchedule::Now => self.finish_record(i, 0),
            StopSchedule::Pending => {}
            StopSchedule::At { frame } => self.stop_at[i] = Some(frame),
        }
    }

    fn finish_record(&mut self, i: usize, frame_offset: usize) {
        self.stop_at[i] = None;
        let id = self.tracks[i].id;
        self.tracks[i].mode = TrackMode::Play;
        self.tracks[i].frame = 0;
        let result = self.sync.loop_record_stop(id, &mut self.tracks, frame_offset);
        log::info!(
            "{} recorded {} frames, {} cycles, tempo {:?}",
            id,
            self.tracks[i].frames,
            result.cycles,
            result.tempo
        );
    }

    /// Cycle and loop boundaries of the track sync master inside this block
    fn master_pulses(&mut self, frames: usize) {
        let Some(master) = self.sync.masters().track_sync_master else {
            return;
        };
        let Some(track) = self.tracks.iter().find(|t| t.id == master) else {
            return;
        };
        if track.mode != TrackMode::Play || track.is_empty() {
            return;
        }

        let cycle_frames = track.cycle_frames().max(1);
        let next = (track.frame / cycle_frames + 1) * cycle_frames;
        let offset = ((next - track.frame) as f32 / track.speed) as usize;
        if offset < frames {
            let pulse_type = if next >= track.frames {
                PulseType::Loop
            } else {
                PulseType::Cycle
            };
            let master_frame = next % track.frames;
            self.sync.add_track_pulse(master, pulse_type, offset, master_frame);
        }
    }

    fn process_track(&mut self, i: usize, frames: usize) {
        let mut position = 0;
        self.sync.prepare(&self.tracks[i]);
        while let Some(offset) = self.sync.get_next_event().map(|e| e.frame_offset) {
            let offset = offset.clamp(position, frames);
            self.advance_segment(i, position, offset - position);
            position = offset;

            match self.sync.use_event(&mut self.tracks[i]) {
                SyncOutcome::StartRecording { .. } => {
                    let track = &mut self.tracks[i];
                    track.mode = TrackMode::Record;
                    track.frames = 0;
                    track.frame = 0;
                }
                SyncOutcome::StopRecording { .. } => self.finish_record(i, position),
                SyncOutcome::Realigned { frame } => {
                    log::debug!("{} realigned to {}", self.tracks[i].id, frame);
                }
                SyncOutcome::CycleCrossed { cycles } => {
                    log::debug!("{} recording cycle {}", self.tracks[i].id, cycles);
                }
                SyncOutcome::None => {}
            }
        }
        self.sync.finish(&self.tracks[i]);
        self.advance_segment(i, position, frames - position);
    }

    fn advance_segment(&mut self, i: usize, offset: usize, count: usize) {
        if count == 0 {
            return;
        }
        if self.tracks[i].mode == TrackMode::Record {
            if let Some(stop) = self.stop_at[i] {
                let room = (stop - self.tracks[i].frames).max(0) as usize;
                if room <= count {
                    self.tracks[i].advance(room);
                    self.finish_record(i, offset + room);
                    self.advance_segment(i, offset + room, count - room);
                    return;
                }
            }
        }

        let track = &mut self.tracks[i];
        let to_end = ((track.frames - track.frame).max(0) as f32 / track.speed) as usize;
        let id = track.id;
        if track.advance(count) {
            self.sync.loop_local_start_point(id, offset + to_end.min(count - 1));
        }
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut looper: DemoLooper,
) -> Result<Stream, SyncError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                // No allocations, no I/O, no blocking locks
                looper.process(data.len() / channels);
                for sample in data.iter_mut() {
                    *sample = T::EQUILIBRIUM;
                }
            },
            |err| log::error!("Audio stream error: {}", err),
            None,
        )
        .map_err(|e| SyncError::Audio(e.to_string()))
}

fn run() -> Result<(), SyncError> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SyncConfig::load(&path)?,
        None => SyncConfig::default(),
    };
    let seconds = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_RUN_SECONDS);

    let diagnostics = Diagnostics::new("loopsync", log::max_level());

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SyncError::Audio("No audio device found".to_string()))?;
    log::info!(
        "Audio device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );
    let supported = device
        .default_output_config()
        .map_err(|e| SyncError::Audio(e.to_string()))?;
    let sample_format = supported.sample_format();
    let sample_rate = supported.sample_rate().0 as f64;
    let stream_config: StreamConfig = supported.into();

    // MIDI in: external clock
    let (midi_producer, midi_queue) =
        RealtimeEventQueue::new(SyncSource::Midi, config.queue_capacity, diagnostics.clone());
    let midi_input = MidiClockInput::open(None, midi_producer)?;
    if let Some(name) = midi_input.port_name() {
        log::info!("MIDI sync source: {}", name);
    }

    // MIDI out: generated clock
    let sink = open_output(None).unwrap_or_else(|e| {
        log::warn!("{}, clock output disabled", e);
        Box::new(NullSink)
    });
    let (transport, generator) =
        clock_transport(sample_rate, sink, config.queue_capacity, diagnostics.clone());
    let clock_thread = ClockThread::spawn(generator)?;

    let (mut publisher, receiver) = config_channel(config, diagnostics.clone());
    let sync = Synchronizer::new(
        sample_rate,
        receiver,
        midi_queue,
        transport,
        MAX_TRACKS,
        diagnostics.clone(),
    );
    let status = sync.shared_status();
    let looper = DemoLooper::new(sync, sample_rate);

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, looper)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, looper)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, looper)?,
        other => {
            return Err(SyncError::Audio(format!(
                "Unsupported sample format: {:?}",
                other
            )));
        }
    };
    stream.play().map_err(|e| SyncError::Audio(e.to_string()))?;
    log::info!("Sync engine running at {} Hz for {} s", sample_rate, seconds);

    for _ in 0..seconds {
        std::thread::sleep(Duration::from_secs(1));
        publisher.collect();

        let s = status.snapshot();
        log::info!(
            "out {:.1} BPM sending={} bar {} beat {} | midi {:.1} BPM receiving={} | drift out={} midi={} | masters track={:?} out={:?}",
            s.out_tempo,
            s.out_sending,
            s.out_bar,
            s.out_beat,
            s.midi_tempo,
            s.midi_receiving,
            s.drift_of(SyncSource::Out),
            s.drift_of(SyncSource::Midi),
            s.track_sync_master,
            s.out_sync_master,
        );
    }

    drop(stream);
    if let Some(generator) = clock_thread.shutdown() {
        log::info!(
            "Clock generator stopped: {} clocks sent, {} send errors",
            generator.clocks_sent(),
            generator.send_errors()
        );
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("=== loopsync ===");
    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
