// SyncTracker - virtual "external loop" following one sync source
//
// Unlocked: raw pulses pass through and only feed a frames-per-pulse estimate.
// Locked: the tracker knows the pulse/frame ratio and the external loop
// length, advances a virtual frame with the audio stream, synthesizes
// Beat/Bar/Loop pulses at exact frame boundaries and measures drift against
// the raw pulses.

use crate::diagnostics::Diagnostics;
use crate::error::SyncError;
use crate::sync::pulse::{PulseType, SyncEventType, SyncPulse, SyncSource};
use std::sync::Arc;

/// Raw pulse intervals kept for the unlocked estimate
const ESTIMATE_WINDOW: usize = 24;

/// Weight of a new interval in the smoothed estimate
const SMOOTHING: f64 = 0.1;

/// Geometry staged by resize(), applied at the next pulse boundary
#[derive(Debug, Clone, Copy, PartialEq)]
struct FutureGeometry {
    pulses: u32,
    loop_frames: i64,
    speed: f32,
}

#[derive(Debug, Clone)]
struct PulseEstimate {
    intervals: [f64; ESTIMATE_WINDOW],
    count: usize,
    next: usize,
    smoothed: f64,
    frames_since_pulse: i64,
    seen_pulse: bool,
}

impl PulseEstimate {
    fn new() -> Self {
        Self {
            intervals: [0.0; ESTIMATE_WINDOW],
            count: 0,
            next: 0,
            smoothed: 0.0,
            frames_since_pulse: 0,
            seen_pulse: false,
        }
    }

    fn restart(&mut self, frame_offset: usize) {
        self.count = 0;
        self.next = 0;
        self.smoothed = 0.0;
        self.seen_pulse = true;
        self.frames_since_pulse = -(frame_offset as i64);
    }

    fn pulse(&mut self, frame_offset: usize) {
        let interval = self.frames_since_pulse + frame_offset as i64;
        if self.seen_pulse && interval > 0 {
            let interval = interval as f64;
            self.intervals[self.next] = interval;
            self.next = (self.next + 1) % ESTIMATE_WINDOW;
            self.count = (self.count + 1).min(ESTIMATE_WINDOW);
            self.smoothed = if self.smoothed == 0.0 {
                interval
            } else {
                self.smoothed + (interval - self.smoothed) * SMOOTHING
            };
        }
        self.seen_pulse = true;
        self.frames_since_pulse = -(frame_offset as i64);
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.intervals[..self.count].iter().sum::<f64>() / self.count as f64
        }
    }
}

pub struct SyncTracker {
    source: SyncSource,
    diagnostics: Arc<Diagnostics>,
    pulses_per_beat: u32,

    locked: bool,
    pulse_frames: f64,
    loop_frames: i64,
    loop_pulses: u32,
    beats_per_bar: u32,
    speed: f32,

    audio_frame: f64,
    block_start_frame: f64,
    raw_pulse: u32,
    drift: i64,
    wrapped: bool,
    future: Option<FutureGeometry>,

    estimate: PulseEstimate,
}

impl SyncTracker {
    pub fn new(source: SyncSource, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            source,
            diagnostics,
            pulses_per_beat: source.pulses_per_beat(),
            locked: false,
            pulse_frames: 0.0,
            loop_frames: 0,
            loop_pulses: 0,
            beats_per_bar: 4,
            speed: 1.0,
            audio_frame: 0.0,
            block_start_frame: 0.0,
            raw_pulse: 0,
            drift: 0,
            wrapped: false,
            future: None,
            estimate: PulseEstimate::new(),
        }
    }

    /// Back to Unlocked, only when no track follows this tracker
    pub fn reset(&mut self) {
        if self.locked {
            self.diagnostics
                .debug(format_args!("{:?} tracker reset", self.source));
        }
        self.locked = false;
        self.pulse_frames = 0.0;
        self.loop_frames = 0;
        self.loop_pulses = 0;
        self.speed = 1.0;
        self.audio_frame = 0.0;
        self.block_start_frame = 0.0;
        self.raw_pulse = 0;
        self.drift = 0;
        self.wrapped = false;
        self.future = None;
        self.estimate = PulseEstimate::new();
    }

    /// Fix the pulse/frame ratio and the external loop length
    pub fn lock(
        &mut self,
        origin_pulse: u32,
        pulses_per_loop: u32,
        loop_frames: i64,
        speed: f32,
        beats_per_bar: u32,
    ) -> Result<(), SyncError> {
        if self.locked {
            self.diagnostics.debug(format_args!(
                "{:?} tracker: lock ignored, already locked",
                self.source
            ));
            return Err(SyncError::TrackerLocked(self.source));
        }
        if loop_frames <= 0 || pulses_per_loop == 0 {
            self.diagnostics.warn(format_args!(
                "{:?} tracker: invalid lock geometry {} frames / {} pulses",
                self.source, loop_frames, pulses_per_loop
            ));
            return Err(SyncError::InvalidLoopLength(loop_frames));
        }

        self.locked = true;
        self.loop_frames = loop_frames;
        self.loop_pulses = pulses_per_loop;
        self.pulse_frames = loop_frames as f64 / pulses_per_loop as f64;
        self.beats_per_bar = beats_per_bar.max(1);
        self.speed = if speed > 0.0 { speed } else { 1.0 };
        self.raw_pulse = origin_pulse % pulses_per_loop;
        self.audio_frame = self.raw_pulse as f64 * self.pulse_frames;
        self.block_start_frame = self.audio_frame;
        self.drift = 0;
        self.future = None;

        if self.pulse_frames.fract() != 0.0 {
            self.diagnostics.warn(format_args!(
                "{:?} tracker: fractional pulse frames {:.4}",
                self.source, self.pulse_frames
            ));
        }
        self.diagnostics.info(format_args!(
            "{:?} tracker locked: {} frames, {} pulses, {:.4} frames/pulse",
            self.source, loop_frames, pulses_per_loop, self.pulse_frames
        ));
        Ok(())
    }

    /// Move the virtual frame by `frame_count * speed`
    ///
    /// When locked and a sink is given, Beat/Bar/Loop pulses are synthesized
    /// for every boundary in [start, end) of this block.
    pub fn advance(&mut self, frame_count: usize, sink: Option<&mut Vec<SyncPulse>>) {
        self.wrapped = false;
        self.block_start_frame = self.audio_frame;

        if !self.locked {
            self.estimate.frames_since_pulse += frame_count as i64;
            return;
        }

        let speed = self.speed as f64;
        let loop_frames = self.loop_frames as f64;
        let start = self.audio_frame;
        let end = start + frame_count as f64 * speed;

        if let Some(sink) = sink {
            self.synthesize(start, end, frame_count, sink);
        }

        let wrapped_end = end - (end / loop_frames).floor() * loop_frames;
        if end >= loop_frames {
            self.wrapped = true;
        }
        self.audio_frame = wrapped_end;
    }

    fn synthesize(&mut self, start: f64, end: f64, frame_count: usize, sink: &mut Vec<SyncPulse>) {
        let speed = self.speed as f64;
        let loop_frames = self.loop_frames as f64;
        let beat_frames = self.beat_frames();
        let mut loop_base = 0.0;

        while loop_base < end {
            let first = if start > loop_base {
                ((start - loop_base) / beat_frames).ceil() as u64
            } else {
                0
            };

            let mut beat = first;
            loop {
                let boundary = loop_base + beat as f64 * beat_frames;
                if boundary >= loop_base + loop_frames || boundary >= end {
                    break;
                }
                if boundary >= start {
                    let pulse_type = if beat == 0 {
                        PulseType::Loop
                    } else if beat % self.beats_per_bar as u64 == 0 {
                        PulseType::Bar
                    } else {
                        PulseType::Beat
                    };
                    let offset = (((boundary - start) / speed) as usize).min(frame_count.saturating_sub(1));
                    let mut pulse = SyncPulse::pulse(
                        self.source,
                        pulse_type,
                        beat * self.pulses_per_beat as u64,
                    )
                    .at(offset)
                    .synthesized();
                    pulse.is_loop_start_point = beat == 0;
                    sink.push(pulse);
                }
                beat += 1;
            }
            loop_base += loop_frames;
        }
    }

    /// Feed a raw pulse from the source
    ///
    /// Must be called before advance() for the block the pulse belongs to.
    /// Marks the pulse as a loop start point when the external pulse counter
    /// wraps to zero.
    pub fn event(&mut self, pulse: &mut SyncPulse) {
        if pulse.event_type == SyncEventType::Stop {
            return;
        }

        if !self.locked {
            if pulse.event_type.is_restart() {
                self.estimate.restart(pulse.frame_offset);
            } else {
                self.estimate.pulse(pulse.frame_offset);
            }
            return;
        }

        self.apply_future();

        match pulse.event_type {
            SyncEventType::Start => self.raw_pulse = 0,
            SyncEventType::Continue => {
                self.raw_pulse = (pulse.continue_pulse % self.loop_pulses as u64) as u32;
            }
            _ => self.raw_pulse = (self.raw_pulse + 1) % self.loop_pulses,
        }
        pulse.is_loop_start_point = self.raw_pulse == 0;

        let virtual_frame = self.wrap(self.audio_frame + pulse.frame_offset as f64 * self.speed as f64);
        let expected = self.raw_pulse as f64 * self.pulse_frames;
        self.drift = self.wrap_signed(virtual_frame - expected).round() as i64;

        self.diagnostics.trace(format_args!(
            "{:?} tracker pulse {} drift {}",
            self.source, self.raw_pulse, self.drift
        ));
    }

    /// Stage a new geometry, applied atomically at the next pulse boundary
    pub fn resize(&mut self, new_pulses: u32, new_loop_frames: i64, new_speed: f32) {
        if !self.locked {
            self.diagnostics.debug(format_args!(
                "{:?} tracker: resize ignored while unlocked",
                self.source
            ));
            return;
        }
        if new_pulses == 0 || new_loop_frames <= 0 {
            self.diagnostics.warn(format_args!(
                "{:?} tracker: invalid resize {} frames / {} pulses",
                self.source, new_loop_frames, new_pulses
            ));
            return;
        }
        self.future = Some(FutureGeometry {
            pulses: new_pulses,
            loop_frames: new_loop_frames,
            speed: if new_speed > 0.0 { new_speed } else { self.speed },
        });
    }

    /// Apply a staged resize now, used when the source is not pulsing
    pub fn commit_resize(&mut self) {
        self.apply_future();
    }

    fn apply_future(&mut self) {
        let Some(future) = self.future.take() else {
            return;
        };

        // Keep the position in pulses across the ratio change
        let position = self.audio_frame / self.pulse_frames;
        self.loop_pulses = future.pulses;
        self.loop_frames = future.loop_frames;
        self.pulse_frames = future.loop_frames as f64 / future.pulses as f64;
        self.speed = future.speed;
        self.raw_pulse %= self.loop_pulses;
        self.audio_frame = self.wrap(position * self.pulse_frames);

        self.diagnostics.debug(format_args!(
            "{:?} tracker resized: {} frames, {} pulses",
            self.source, self.loop_frames, self.loop_pulses
        ));
    }

    /// Place the virtual frame, used when locking mid-block or on master handover
    pub fn set_position(&mut self, frame: f64) {
        if !self.locked {
            return;
        }
        self.audio_frame = self.wrap(frame);
        self.block_start_frame = self.audio_frame;
        self.raw_pulse =
            (((self.audio_frame + 1e-6) / self.pulse_frames).floor() as u32) % self.loop_pulses;
    }

    /// Snap the virtual frame onto the raw pulse stream
    ///
    /// Returns the frame delta applied, which dependent tracks must apply too.
    pub fn correct(&mut self) -> i64 {
        if !self.locked {
            return 0;
        }
        let delta = -self.drift;
        self.audio_frame = self.wrap(self.audio_frame + delta as f64);
        self.drift = 0;
        delta
    }

    fn wrap(&self, frame: f64) -> f64 {
        if self.loop_frames <= 0 {
            return frame;
        }
        let loop_frames = self.loop_frames as f64;
        frame - (frame / loop_frames).floor() * loop_frames
    }

    /// Fold a frame difference into (-loop/2, loop/2]
    fn wrap_signed(&self, delta: f64) -> f64 {
        let loop_frames = self.loop_frames as f64;
        let mut delta = self.wrap(delta);
        if delta > loop_frames / 2.0 {
            delta -= loop_frames;
        }
        delta
    }

    pub fn source(&self) -> SyncSource {
        self.source
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn get_drift(&self) -> i64 {
        self.drift
    }

    /// Virtual pulse position derived from the virtual frame
    pub fn get_pulse(&self) -> u32 {
        if !self.locked || self.pulse_frames <= 0.0 {
            return 0;
        }
        (((self.audio_frame + 1e-6) / self.pulse_frames).floor() as u32) % self.loop_pulses
    }

    /// External pulse counter within the loop
    pub fn raw_pulse(&self) -> u32 {
        self.raw_pulse
    }

    pub fn get_loop_frames(&self) -> i64 {
        self.loop_frames
    }

    pub fn loop_pulses(&self) -> u32 {
        self.loop_pulses
    }

    pub fn get_beats_per_bar(&self) -> u32 {
        self.beats_per_bar
    }

    pub fn pulse_frames(&self) -> f64 {
        self.pulse_frames
    }

    pub fn pulses_per_beat(&self) -> u32 {
        self.pulses_per_beat
    }

    pub fn beat_frames(&self) -> f64 {
        self.pulse_frames * self.pulses_per_beat as f64
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn audio_frame(&self) -> f64 {
        self.audio_frame
    }

    /// Virtual frame at an offset into the current block
    pub fn frame_at_offset(&self, frame_offset: usize) -> f64 {
        self.wrap(self.block_start_frame + frame_offset as f64 * self.speed as f64)
    }

    /// True if the external loop wrapped during the last advance()
    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    pub fn has_pending_resize(&self) -> bool {
        self.future.is_some()
    }

    /// Beat within the bar of the external loop
    pub fn beat(&self) -> u32 {
        if !self.locked {
            return 0;
        }
        ((self.audio_frame / self.beat_frames()).floor() as u32) % self.beats_per_bar
    }

    pub fn bar(&self) -> u32 {
        if !self.locked {
            return 0;
        }
        (self.audio_frame / (self.beat_frames() * self.beats_per_bar as f64)).floor() as u32
    }

    /// Tempo implied by the locked ratio, or the raw pulse estimate when unlocked
    pub fn tempo(&self, sample_rate: f64, smoothed: bool) -> f64 {
        let pulse_frames = if self.locked {
            self.pulse_frames / self.speed as f64
        } else {
            self.estimated_pulse_frames(smoothed)
        };
        if pulse_frames <= 0.0 {
            0.0
        } else {
            sample_rate * 60.0 / (pulse_frames * self.pulses_per_beat as f64)
        }
    }

    /// Frames per raw pulse measured while unlocked
    pub fn estimated_pulse_frames(&self, smoothed: bool) -> f64 {
        if smoothed {
            self.estimate.smoothed
        } else {
            self.estimate.average()
        }
    }
}
