// Clock generator - timer-thread side of the outbound MIDI clock
//
// Receives TransportCommands from the audio thread, writes realtime bytes to
// the MIDI sink and mirrors every message into the loopback queue so the
// audio side can measure our own clock like an external one.

use crate::diagnostics::Diagnostics;
use crate::error::SyncError;
use crate::messaging::channels::Receiver;
use crate::messaging::command::TransportCommand;
use crate::midi::event::{CLOCKS_PER_BEAT, RealtimeMessage};
use crate::midi::output::MidiSink;
use crate::midi::queue::RealtimeProducer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Clocks emitted in one tick at most, after that the grid is re-phased
const MAX_CATCH_UP: u32 = 24;

pub struct ClockGenerator {
    sink: Box<dyn MidiSink>,
    commands: Receiver<TransportCommand>,
    loopback: RealtimeProducer,
    diagnostics: Arc<Diagnostics>,
    tempo: f64,
    running: bool,
    next_clock_ms: f64,
    clocks_sent: u64,
    send_errors: u64,
}

impl ClockGenerator {
    pub(crate) fn new(
        sink: Box<dyn MidiSink>,
        commands: Receiver<TransportCommand>,
        loopback: RealtimeProducer,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            sink,
            commands,
            loopback,
            diagnostics,
            tempo: 0.0,
            running: false,
            next_clock_ms: 0.0,
            clocks_sent: 0,
            send_errors: 0,
        }
    }

    /// Milliseconds on the loopback queue's clock
    pub fn now_ms(&self) -> f64 {
        self.loopback.now_us() as f64 / 1000.0
    }

    fn interval_ms(&self) -> Option<f64> {
        if self.tempo > 0.0 {
            Some(60_000.0 / (self.tempo * CLOCKS_PER_BEAT as f64))
        } else {
            None
        }
    }

    /// Process pending commands then emit every clock due at `now_ms`
    ///
    /// Returns the number of clocks sent.
    pub fn tick(&mut self, now_ms: f64) -> u32 {
        while let Some(command) = self.commands.recv() {
            self.apply(command, now_ms);
        }

        if !self.running {
            return 0;
        }
        let Some(interval) = self.interval_ms() else {
            return 0;
        };

        let mut sent = 0;
        while self.next_clock_ms <= now_ms {
            if sent == MAX_CATCH_UP {
                self.diagnostics
                    .debug(format_args!("clock generator late, re-phasing grid"));
                self.next_clock_ms = now_ms + interval;
                break;
            }
            self.emit(RealtimeMessage::Clock, now_ms);
            self.next_clock_ms += interval;
            sent += 1;
        }
        sent
    }

    fn apply(&mut self, command: TransportCommand, now_ms: f64) {
        match command {
            TransportCommand::SetTempo(tempo) => {
                let old_interval = self.interval_ms();
                self.tempo = tempo.max(0.0);
                match (old_interval, self.interval_ms()) {
                    // Keep the phase of the last clock sent
                    (Some(old), Some(new)) => self.next_clock_ms = self.next_clock_ms - old + new,
                    (None, Some(new)) => self.next_clock_ms = now_ms + new,
                    _ => {}
                }
            }
            TransportCommand::Start => {
                self.emit(RealtimeMessage::Start, now_ms);
                self.restart_clocks(now_ms);
            }
            TransportCommand::Continue { song_position } => {
                if let Some(position) = song_position {
                    self.emit(RealtimeMessage::SongPosition(position), now_ms);
                }
                self.emit(RealtimeMessage::Continue, now_ms);
                self.restart_clocks(now_ms);
            }
            TransportCommand::Stop {
                send_transport,
                stop_clocks,
            } => {
                if send_transport {
                    self.emit(RealtimeMessage::Stop, now_ms);
                }
                if stop_clocks {
                    self.running = false;
                }
            }
            TransportCommand::StartClocks => {
                if !self.running {
                    self.running = true;
                    if let Some(interval) = self.interval_ms() {
                        self.next_clock_ms = now_ms + interval;
                    }
                }
            }
        }
    }

    /// Start/Continue must be followed by a clock: send it now and put the
    /// grid one interval later so the timer does not send a second one
    fn restart_clocks(&mut self, now_ms: f64) {
        self.running = true;
        self.emit(RealtimeMessage::Clock, now_ms);
        self.next_clock_ms = now_ms + self.interval_ms().unwrap_or(0.0);
    }

    fn emit(&mut self, message: RealtimeMessage, now_ms: f64) {
        let mut bytes = [0u8; 3];
        let len = message.write_bytes(&mut bytes);
        if let Err(e) = self.sink.send(&bytes[..len]) {
            self.send_errors += 1;
            // First failure is a warning, the rest would flood the log
            if self.send_errors == 1 {
                self.diagnostics.warn(format_args!("MIDI clock send failed: {}", e));
            }
        }
        if message == RealtimeMessage::Clock {
            self.clocks_sent += 1;
        }
        self.loopback.add_at(message, (now_ms * 1000.0) as u64);
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn clocks_sent(&self) -> u64 {
        self.clocks_sent
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors
    }
}

/// Millisecond timer thread driving a ClockGenerator
pub struct ClockThread {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<ClockGenerator>>,
}

impl ClockThread {
    pub fn spawn(mut generator: ClockGenerator) -> Result<Self, SyncError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name("loopsync-clock".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    let now = generator.now_ms();
                    generator.tick(now);
                    thread::sleep(Duration::from_millis(1));
                }
                generator
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the timer and get the generator back
    pub fn shutdown(mut self) -> Option<ClockGenerator> {
        self.join()
    }

    fn join(&mut self) -> Option<ClockGenerator> {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.take().and_then(|handle| handle.join().ok())
    }
}

impl Drop for ClockThread {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::channels::{Sender, spsc_channel};
    use crate::midi::event::{MS_CLOCK, MS_CONTINUE, MS_SONG_POSITION, MS_START, MS_STOP};
    use crate::midi::output::CaptureSink;
    use crate::midi::queue::RealtimeEventQueue;
    use crate::sync::pulse::SyncSource;

    fn generator() -> (
        ClockGenerator,
        Sender<TransportCommand>,
        RealtimeEventQueue,
        CaptureSink,
    ) {
        let diag = Arc::new(Diagnostics::default());
        let capture = CaptureSink::new();
        let (tx, rx) = spsc_channel(16, diag.clone());
        let (producer, queue) = RealtimeEventQueue::new(SyncSource::Out, 256, diag.clone());
        let generator = ClockGenerator::new(Box::new(capture.clone()), rx, producer, diag);
        (generator, tx, queue, capture)
    }

    #[test]
    fn test_no_clocks_until_started() {
        let (mut generator, mut tx, _queue, capture) = generator();
        tx.send(TransportCommand::SetTempo(125.0));
        assert_eq!(generator.tick(100.0), 0);
        assert!(capture.messages().is_empty());
    }

    #[test]
    fn test_start_sends_start_and_clock() {
        let (mut generator, mut tx, _queue, capture) = generator();
        // 125 BPM is exactly 20 ms per clock
        tx.send(TransportCommand::SetTempo(125.0));
        tx.send(TransportCommand::Start);
        generator.tick(0.0);
        assert_eq!(capture.status_bytes(), vec![MS_START, MS_CLOCK]);

        // Not due yet
        assert_eq!(generator.tick(10.0), 0);
        assert_eq!(generator.tick(20.0), 1);
        assert_eq!(generator.tick(65.0), 2);
        assert_eq!(generator.clocks_sent(), 4);
    }

    #[test]
    fn test_continue_with_song_position() {
        let (mut generator, mut tx, _queue, capture) = generator();
        tx.send(TransportCommand::SetTempo(120.0));
        tx.send(TransportCommand::Continue {
            song_position: Some(16),
        });
        generator.tick(0.0);
        assert_eq!(
            capture.status_bytes(),
            vec![MS_SONG_POSITION, MS_CONTINUE, MS_CLOCK]
        );
        assert_eq!(capture.messages()[0], vec![MS_SONG_POSITION, 16, 0]);
    }

    #[test]
    fn test_stop_variants() {
        let (mut generator, mut tx, _queue, capture) = generator();
        tx.send(TransportCommand::SetTempo(125.0));
        tx.send(TransportCommand::Start);
        generator.tick(0.0);

        // Transport message only, clocks keep running
        tx.send(TransportCommand::Stop {
            send_transport: true,
            stop_clocks: false,
        });
        generator.tick(20.0);
        assert!(generator.is_running());
        assert_eq!(capture.status_bytes(), vec![MS_START, MS_CLOCK, MS_STOP, MS_CLOCK]);

        tx.send(TransportCommand::Stop {
            send_transport: false,
            stop_clocks: true,
        });
        assert_eq!(generator.tick(100.0), 0);
        assert!(!generator.is_running());
    }

    #[test]
    fn test_loopback_mirrors_output() {
        let (mut generator, mut tx, mut queue, _capture) = generator();
        tx.send(TransportCommand::SetTempo(125.0));
        tx.send(TransportCommand::Start);
        generator.tick(0.0);
        for i in 1..=24 {
            generator.tick(i as f64 * 20.0);
        }

        let mut pulses = Vec::new();
        queue.drain(256, &mut pulses);
        assert!(queue.is_started());
        assert_eq!(queue.song_clock(), 24);
        assert_eq!(queue.beat_count(), 1);
        assert!((queue.tempo_monitor().average_tempo() - 125.0).abs() < 0.01);
    }

    #[test]
    fn test_tempo_zero_disables_clocks() {
        let (mut generator, mut tx, _queue, _capture) = generator();
        tx.send(TransportCommand::SetTempo(125.0));
        tx.send(TransportCommand::Start);
        generator.tick(0.0);
        tx.send(TransportCommand::SetTempo(0.0));
        assert_eq!(generator.tick(200.0), 0);
    }

    #[test]
    fn test_clock_thread_lifecycle() {
        let (generator, mut tx, _queue, capture) = generator();
        tx.send(TransportCommand::SetTempo(300.0));
        tx.send(TransportCommand::Start);

        let thread = ClockThread::spawn(generator).unwrap();
        thread::sleep(Duration::from_millis(50));
        let generator = thread.shutdown().unwrap();

        assert!(generator.is_running());
        assert!(generator.clocks_sent() >= 1);
        assert_eq!(capture.status_bytes()[0], MS_START);
    }
}
