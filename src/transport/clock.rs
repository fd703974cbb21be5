// ClockTransport - audio-thread control of the outbound MIDI clock
//
// Commands go to the ClockGenerator on the timer thread. What the generator
// actually sends comes back through the loopback queue and is drained here,
// so the Out source is measured exactly like received MIDI clock.

use crate::diagnostics::Diagnostics;
use crate::error::SyncError;
use crate::messaging::channels::{Sender, spsc_channel};
use crate::messaging::command::TransportCommand;
use crate::midi::event::CLOCKS_PER_BEAT;
use crate::midi::output::MidiSink;
use crate::midi::queue::RealtimeEventQueue;
use crate::sync::pulse::{SyncPulse, SyncSource};
use crate::transport::generator::ClockGenerator;
use std::sync::Arc;

/// Commands in flight between two timer ticks
const COMMAND_CAPACITY: usize = 32;

pub struct ClockTransport {
    commands: Sender<TransportCommand>,
    loopback: RealtimeEventQueue,
    diagnostics: Arc<Diagnostics>,
    sample_rate: f64,
    tempo: f64,
    frames_per_pulse: f64,
    sending: bool,
    starts_sent: u64,
    stops_sent: u64,
}

/// Create the audio-side transport and the generator to run on a timer thread
pub fn clock_transport(
    sample_rate: f64,
    sink: Box<dyn MidiSink>,
    loopback_capacity: usize,
    diagnostics: Arc<Diagnostics>,
) -> (ClockTransport, ClockGenerator) {
    let (commands, command_rx) = spsc_channel(COMMAND_CAPACITY, diagnostics.clone());
    let (producer, loopback) =
        RealtimeEventQueue::new(SyncSource::Out, loopback_capacity, diagnostics.clone());

    let generator = ClockGenerator::new(sink, command_rx, producer, diagnostics.clone());
    let transport = ClockTransport {
        commands,
        loopback,
        diagnostics,
        sample_rate,
        tempo: 0.0,
        frames_per_pulse: 0.0,
        sending: false,
        starts_sent: 0,
        stops_sent: 0,
    };
    (transport, generator)
}

impl ClockTransport {
    fn send(&mut self, command: TransportCommand) {
        if !self.commands.send(command) {
            self.diagnostics
                .warn(format_args!("transport command dropped: {:?}", command));
        }
    }

    /// Set the clock tempo, 0 disables output sync
    pub fn set_tempo(&mut self, bpm: f64) -> Result<(), SyncError> {
        if bpm < 0.0 {
            self.diagnostics
                .warn(format_args!("ignoring negative tempo {}", bpm));
            return Err(SyncError::NegativeTempo(bpm));
        }

        self.tempo = bpm;
        if bpm == 0.0 {
            self.frames_per_pulse = 0.0;
            self.sending = false;
        } else {
            self.frames_per_pulse =
                self.sample_rate / (bpm / 60.0 * CLOCKS_PER_BEAT as f64);
            if self.frames_per_pulse.fract() != 0.0 {
                self.diagnostics.trace(format_args!(
                    "fractional frames per pulse {:.4} at {} BPM",
                    self.frames_per_pulse, bpm
                ));
            }
        }
        self.send(TransportCommand::SetTempo(bpm));
        Ok(())
    }

    /// Send Start and begin clocks
    pub fn start(&mut self) {
        if self.tempo <= 0.0 {
            self.diagnostics
                .debug(format_args!("transport start ignored, no tempo"));
            return;
        }
        self.send(TransportCommand::Start);
        self.sending = true;
        self.starts_sent += 1;
    }

    /// Send Continue, preceded by a Song Position when given
    pub fn continue_(&mut self, song_position: Option<u16>) {
        if self.tempo <= 0.0 {
            self.diagnostics
                .debug(format_args!("transport continue ignored, no tempo"));
            return;
        }
        self.send(TransportCommand::Continue { song_position });
        self.sending = true;
    }

    pub fn stop(&mut self, send_transport_message: bool, stop_clocks: bool) {
        self.send(TransportCommand::Stop {
            send_transport: send_transport_message,
            stop_clocks,
        });
        if stop_clocks {
            self.sending = false;
        }
        if send_transport_message {
            self.stops_sent += 1;
        }
    }

    /// Resume clocks without a transport message
    pub fn start_clocks(&mut self) {
        if self.tempo <= 0.0 {
            return;
        }
        self.send(TransportCommand::StartClocks);
        self.sending = true;
    }

    /// Count a Start that the caller decided not to send
    pub fn inc_starts(&mut self) {
        self.loopback.inc_starts();
    }

    /// Drain the loopback queue for this block
    pub fn drain(&mut self, block_frames: usize, out: &mut Vec<SyncPulse>) -> usize {
        self.loopback.drain(block_frames, out)
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    /// True once the loopback has seen the clock following our Start
    pub fn is_started(&self) -> bool {
        self.loopback.is_started()
    }

    pub fn get_beat(&self, beats_per_bar: u32) -> u64 {
        self.loopback.beat(beats_per_bar)
    }

    pub fn get_bar(&self, beats_per_bar: u32) -> u64 {
        self.loopback.bar(beats_per_bar)
    }

    pub fn get_tempo(&self) -> f64 {
        self.tempo
    }

    pub fn frames_per_pulse(&self) -> f64 {
        self.frames_per_pulse
    }

    /// Starts seen on the loopback, including suppressed ones
    pub fn starts(&self) -> u64 {
        self.loopback.starts()
    }

    pub fn starts_sent(&self) -> u64 {
        self.starts_sent
    }

    pub fn stops_sent(&self) -> u64 {
        self.stops_sent
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn set_beats_per_bar(&mut self, beats_per_bar: u32) {
        self.loopback.set_beats_per_bar(beats_per_bar);
    }

    pub fn loopback(&self) -> &RealtimeEventQueue {
        &self.loopback
    }
}
