// Host transport - per-block timing from the plugin host, turned into pulses

use crate::sync::pulse::{PulseType, SyncEventType, SyncPulse, SyncSource};

/// Timing the host supplies with every audio block
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HostTimeInfo {
    pub tempo: f64,
    /// Absolute beat, monotonic while playing
    pub beat: i64,
    pub beats_per_bar: u32,
    /// A beat starts inside this block at `boundary_offset`
    pub beat_boundary: bool,
    pub bar_boundary: bool,
    pub boundary_offset: usize,
    pub playing: bool,
}

/// Classifies host transport changes the same way MIDI transport is read
///
/// A playing flip becomes Start (beat 0), Continue or Stop. While playing, a
/// beat that advances by exactly one on a boundary is a Pulse; any other beat
/// change is a Continue so jitter smoothing starts over.
#[derive(Debug, Clone, Default)]
pub struct HostTransportMonitor {
    playing: bool,
    last_beat: Option<i64>,
    tempo: f64,
    beats_per_bar: u32,
    starts: u64,
}

impl HostTransportMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append this block's host pulses to `out`, returns how many
    pub fn process(&mut self, info: &HostTimeInfo, out: &mut Vec<SyncPulse>) -> usize {
        let before = out.len();
        if info.tempo > 0.0 {
            self.tempo = info.tempo;
        }
        if info.beats_per_bar > 0 {
            self.beats_per_bar = info.beats_per_bar;
        }
        let offset = if info.beat_boundary {
            info.boundary_offset
        } else {
            0
        };

        if info.playing != self.playing {
            self.playing = info.playing;
            if info.playing {
                out.push(self.restart(info.beat, offset));
                self.last_beat = Some(info.beat);
            } else {
                let mut stop =
                    SyncPulse::new(SyncSource::Host, SyncEventType::Stop, PulseType::Undefined);
                stop.pulse_number = self.last_beat.unwrap_or(0).max(0) as u64;
                out.push(stop);
                self.last_beat = None;
            }
            return out.len() - before;
        }

        if !info.playing {
            return 0;
        }

        match self.last_beat {
            None => self.last_beat = Some(info.beat),
            Some(last) if info.beat == last => {}
            Some(last) => {
                if info.beat_boundary && info.beat == last + 1 {
                    let pulse_type = if info.bar_boundary {
                        PulseType::Bar
                    } else {
                        PulseType::Beat
                    };
                    out.push(
                        SyncPulse::pulse(SyncSource::Host, pulse_type, info.beat.max(0) as u64)
                            .at(offset),
                    );
                } else {
                    out.push(self.restart(info.beat, offset));
                }
                self.last_beat = Some(info.beat);
            }
        }
        out.len() - before
    }

    fn restart(&mut self, beat: i64, offset: usize) -> SyncPulse {
        let beat = beat.max(0) as u64;
        let event_type = if beat == 0 {
            self.starts += 1;
            SyncEventType::Start
        } else {
            SyncEventType::Continue
        };
        let bpb = self.beats_per_bar.max(1) as u64;
        let pulse_type = if beat % bpb == 0 {
            PulseType::Bar
        } else {
            PulseType::Beat
        };

        let mut pulse = SyncPulse::new(SyncSource::Host, event_type, pulse_type).at(offset);
        pulse.pulse_number = beat;
        pulse.continue_pulse = beat;
        pulse
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar
    }

    /// Last beat seen while playing
    pub fn beat(&self) -> Option<i64> {
        self.last_beat
    }

    pub fn starts(&self) -> u64 {
        self.starts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(beat: i64, playing: bool) -> HostTimeInfo {
        HostTimeInfo {
            tempo: 120.0,
            beat,
            beats_per_bar: 4,
            playing,
            ..HostTimeInfo::default()
        }
    }

    fn boundary(beat: i64, offset: usize) -> HostTimeInfo {
        HostTimeInfo {
            beat_boundary: true,
            bar_boundary: beat % 4 == 0,
            boundary_offset: offset,
            ..info(beat, true)
        }
    }

    #[test]
    fn test_start_and_beats() {
        let mut monitor = HostTransportMonitor::new();
        let mut out = Vec::new();

        monitor.process(&boundary(0, 0), &mut out);
        assert_eq!(out[0].event_type, SyncEventType::Start);
        assert_eq!(out[0].pulse_type, PulseType::Bar);

        out.clear();
        monitor.process(&info(0, true), &mut out);
        assert!(out.is_empty());

        monitor.process(&boundary(1, 300), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, SyncEventType::Pulse);
        assert_eq!(out[0].pulse_type, PulseType::Beat);
        assert_eq!(out[0].frame_offset, 300);

        out.clear();
        monitor.process(&boundary(2, 10), &mut out);
        monitor.process(&boundary(3, 10), &mut out);
        monitor.process(&boundary(4, 10), &mut out);
        assert_eq!(out[2].pulse_type, PulseType::Bar);
        assert_eq!(monitor.tempo(), 120.0);
    }

    #[test]
    fn test_jump_is_continue() {
        let mut monitor = HostTransportMonitor::new();
        let mut out = Vec::new();
        monitor.process(&boundary(0, 0), &mut out);
        monitor.process(&boundary(1, 0), &mut out);

        out.clear();
        monitor.process(&boundary(9, 64), &mut out);
        assert_eq!(out[0].event_type, SyncEventType::Continue);
        assert_eq!(out[0].continue_pulse, 9);
        assert_eq!(out[0].frame_offset, 64);
    }

    #[test]
    fn test_stop_and_resume_mid_song() {
        let mut monitor = HostTransportMonitor::new();
        let mut out = Vec::new();
        monitor.process(&boundary(0, 0), &mut out);
        monitor.process(&boundary(1, 0), &mut out);

        out.clear();
        monitor.process(&info(1, false), &mut out);
        assert_eq!(out[0].event_type, SyncEventType::Stop);
        assert!(!monitor.is_playing());

        out.clear();
        monitor.process(&info(5, true), &mut out);
        assert_eq!(out[0].event_type, SyncEventType::Continue);
        assert_eq!(out[0].continue_pulse, 5);
        assert_eq!(monitor.starts(), 1);
    }

    #[test]
    fn test_stopped_host_is_silent() {
        let mut monitor = HostTransportMonitor::new();
        let mut out = Vec::new();
        monitor.process(&info(0, false), &mut out);
        monitor.process(&info(3, false), &mut out);
        assert!(out.is_empty());
        assert_eq!(monitor.beat(), None);
    }
}
