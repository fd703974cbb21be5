// Realtime event queue - MIDI thread → audio thread hand-off for clock pulses
//
// The producer half is owned by the thread receiving (or generating) MIDI
// realtime bytes. The consumer half is drained once per audio block and runs
// the clock/beat/bar state machine.

use crate::diagnostics::Diagnostics;
use crate::messaging::channels::{Receiver, Sender, spsc_channel};
use crate::midi::event::{CLOCKS_PER_BEAT, RealtimeEvent, RealtimeMessage};
use crate::midi::tempo::TempoMonitor;
use crate::sync::pulse::{PulseType, SyncEventType, SyncPulse, SyncSource};
use std::sync::Arc;
use std::time::Instant;

pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Transport message waiting for the clock that must follow it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitingStatus {
    Start,
    Continue,
}

/// Producer half, never blocks
pub struct RealtimeProducer {
    sender: Sender<RealtimeEvent>,
    epoch: Instant,
}

impl RealtimeProducer {
    /// Queue a message stamped with the current time
    pub fn add(&mut self, message: RealtimeMessage) -> bool {
        let timestamp_us = self.epoch.elapsed().as_micros() as u64;
        self.add_at(message, timestamp_us)
    }

    /// Queue a message with an explicit timestamp (microseconds since the queue epoch)
    pub fn add_at(&mut self, message: RealtimeMessage, timestamp_us: u64) -> bool {
        self.sender.send(RealtimeEvent {
            message,
            timestamp_us,
        })
    }

    /// Parse raw bytes and queue them if they are a realtime message
    pub fn add_bytes(&mut self, bytes: &[u8]) -> bool {
        match RealtimeMessage::from_bytes(bytes) {
            Some(message) => self.add(message),
            None => false,
        }
    }

    /// Pulses dropped because the queue was full
    pub fn overflows(&self) -> u64 {
        self.sender.dropped()
    }

    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

/// Consumer half with the running clock state
pub struct RealtimeEventQueue {
    receiver: Receiver<RealtimeEvent>,
    source: SyncSource,
    epoch: Instant,
    diagnostics: Arc<Diagnostics>,
    tempo: TempoMonitor,
    beats_per_bar: u32,
    clock_timeout_us: u64,

    // Clock state machine
    last_clock_us: Option<u64>,
    song_clock: u64,
    beat: u64,
    waiting_status: Option<WaitingStatus>,
    pending_song_position: Option<u16>,
    started: bool,
    frames_since_clock: u64,
    starts: u64,
}

impl RealtimeEventQueue {
    /// Create a queue whose pulses are tagged with `source`
    pub fn new(
        source: SyncSource,
        capacity: usize,
        diagnostics: Arc<Diagnostics>,
    ) -> (RealtimeProducer, RealtimeEventQueue) {
        let (sender, receiver) = spsc_channel(capacity, diagnostics.clone());
        let epoch = Instant::now();

        let producer = RealtimeProducer { sender, epoch };
        let queue = RealtimeEventQueue {
            receiver,
            source,
            epoch,
            diagnostics,
            tempo: TempoMonitor::new(),
            beats_per_bar: 4,
            clock_timeout_us: 1_000_000,
            last_clock_us: None,
            song_clock: 0,
            beat: 0,
            waiting_status: None,
            pending_song_position: None,
            started: false,
            frames_since_clock: 0,
            starts: 0,
        };
        (producer, queue)
    }

    pub fn set_beats_per_bar(&mut self, beats_per_bar: u32) {
        self.beats_per_bar = beats_per_bar.max(1);
    }

    pub fn set_clock_timeout_ms(&mut self, timeout_ms: u64) {
        self.clock_timeout_us = timeout_ms * 1000;
    }

    /// Empty the queue, appending the resulting pulses to `out` in arrival order
    ///
    /// All pulses are placed at frame offset 0: they were queued before this
    /// block started. Returns the number of pulses appended.
    pub fn drain(&mut self, block_frames: usize, out: &mut Vec<SyncPulse>) -> usize {
        let before = out.len();
        self.frames_since_clock += block_frames as u64;

        while let Some(event) = self.receiver.recv() {
            self.process(event, out);
        }

        out.len() - before
    }

    fn process(&mut self, event: RealtimeEvent, out: &mut Vec<SyncPulse>) {
        match event.message {
            RealtimeMessage::SongPosition(position) => {
                // Only honored by the next Continue
                self.pending_song_position = Some(position);
            }
            RealtimeMessage::Start => {
                self.waiting_status = Some(WaitingStatus::Start);
            }
            RealtimeMessage::Continue => {
                self.waiting_status = Some(WaitingStatus::Continue);
            }
            RealtimeMessage::Stop => {
                self.started = false;
                self.waiting_status = None;
                let mut pulse =
                    SyncPulse::new(self.source, SyncEventType::Stop, PulseType::Undefined);
                pulse.pulse_number = self.song_clock;
                out.push(pulse);
            }
            RealtimeMessage::Clock => self.clock(event.timestamp_us, out),
        }
    }

    fn clock(&mut self, timestamp_us: u64, out: &mut Vec<SyncPulse>) {
        self.last_clock_us = Some(timestamp_us);
        self.frames_since_clock = 0;
        self.tempo.clock(timestamp_us);

        match self.waiting_status.take() {
            Some(WaitingStatus::Start) => {
                // The clock following Start is the downbeat itself
                self.song_clock = 0;
                self.beat = 0;
                self.started = true;
                self.starts += 1;
                self.pending_song_position = None;
                out.push(SyncPulse::new(self.source, SyncEventType::Start, PulseType::Bar));
            }
            Some(WaitingStatus::Continue) => {
                if let Some(position) = self.pending_song_position.take() {
                    self.song_clock = RealtimeMessage::song_position_clock(position);
                }
                self.beat = self.song_clock / CLOCKS_PER_BEAT as u64;
                self.started = true;

                let mut pulse = SyncPulse::new(
                    self.source,
                    SyncEventType::Continue,
                    self.pulse_type_at(self.song_clock),
                );
                pulse.pulse_number = self.song_clock;
                pulse.continue_pulse = self.song_clock;
                out.push(pulse);
            }
            None => {
                if !self.started {
                    // Clocks while stopped only feed the tempo monitor
                    return;
                }
                self.song_clock += 1;
                let pulse_type = self.pulse_type_at(self.song_clock);
                if pulse_type != PulseType::Clock {
                    self.beat += 1;
                }
                out.push(SyncPulse::pulse(self.source, pulse_type, self.song_clock));
            }
        }
    }

    fn pulse_type_at(&self, song_clock: u64) -> PulseType {
        if song_clock % CLOCKS_PER_BEAT as u64 != 0 {
            PulseType::Clock
        } else if (song_clock / CLOCKS_PER_BEAT as u64) % self.beats_per_bar as u64 == 0 {
            PulseType::Bar
        } else {
            PulseType::Beat
        }
    }

    pub fn source(&self) -> SyncSource {
        self.source
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn song_clock(&self) -> u64 {
        self.song_clock
    }

    /// Beats since Start
    pub fn beat_count(&self) -> u64 {
        self.beat
    }

    /// Beat within the bar
    pub fn beat(&self, beats_per_bar: u32) -> u64 {
        self.beat % beats_per_bar.max(1) as u64
    }

    pub fn bar(&self, beats_per_bar: u32) -> u64 {
        self.beat / beats_per_bar.max(1) as u64
    }

    /// Starts observed since creation
    pub fn starts(&self) -> u64 {
        self.starts
    }

    /// Count a Start that was deliberately not sent
    pub fn inc_starts(&mut self) {
        self.starts += 1;
    }

    pub fn frames_since_clock(&self) -> u64 {
        self.frames_since_clock
    }

    pub fn tempo_monitor(&self) -> &TempoMonitor {
        &self.tempo
    }

    pub fn tempo_monitor_mut(&mut self) -> &mut TempoMonitor {
        &mut self.tempo
    }

    pub fn is_receiving_clocks(&self) -> bool {
        self.is_receiving_clocks_at(self.epoch.elapsed().as_micros() as u64)
    }

    /// Staleness check against an explicit time
    pub fn is_receiving_clocks_at(&self, now_us: u64) -> bool {
        match self.last_clock_us {
            Some(last) => now_us.saturating_sub(last) < self.clock_timeout_us,
            None => false,
        }
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }
}
