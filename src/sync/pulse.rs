// Sync pulses - the events delivered to tracks once per audio block

/// Where a pulse came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncSource {
    /// Internally generated MIDI clock (loopback of our own output)
    Out,
    /// Host DAW transport
    Host,
    /// Externally received MIDI clock
    Midi,
    /// Boundaries of the track-sync master
    Track,
}

impl SyncSource {
    pub const ALL: [SyncSource; 4] = [
        SyncSource::Out,
        SyncSource::Host,
        SyncSource::Midi,
        SyncSource::Track,
    ];

    /// Sources backed by a SyncTracker
    pub const TRACKED: [SyncSource; 3] = [SyncSource::Out, SyncSource::Host, SyncSource::Midi];

    /// Index into per-tracker tables, None for track sync
    pub fn tracker_index(&self) -> Option<usize> {
        match self {
            SyncSource::Out => Some(0),
            SyncSource::Host => Some(1),
            SyncSource::Midi => Some(2),
            SyncSource::Track => None,
        }
    }

    /// Raw pulses per beat for this source
    pub fn pulses_per_beat(&self) -> u32 {
        match self {
            SyncSource::Out | SyncSource::Midi => crate::midi::event::CLOCKS_PER_BEAT,
            SyncSource::Host | SyncSource::Track => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEventType {
    Pulse,
    Start,
    Stop,
    Continue,
}

impl SyncEventType {
    /// Start and Continue re-anchor the pulse count
    pub fn is_restart(&self) -> bool {
        matches!(self, SyncEventType::Start | SyncEventType::Continue)
    }
}

/// Musical weight of a pulse, ordered from finest to coarsest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PulseType {
    Undefined,
    Clock,
    Beat,
    Bar,
    Subcycle,
    Cycle,
    Loop,
}

impl PulseType {
    /// Beat or coarser (Beat, Bar, Loop for external sources)
    pub fn is_beat(&self) -> bool {
        matches!(self, PulseType::Beat | PulseType::Bar | PulseType::Loop)
    }

    pub fn is_bar(&self) -> bool {
        matches!(self, PulseType::Bar | PulseType::Loop)
    }
}

/// Immutable sync event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPulse {
    pub source: SyncSource,
    pub event_type: SyncEventType,
    pub pulse_type: PulseType,
    /// Position within the current audio block
    pub frame_offset: usize,
    pub pulse_number: u64,
    /// Pulse a Continue resumes from
    pub continue_pulse: u64,
    /// True exactly when the source's own pulse counter wrapped to zero
    pub is_loop_start_point: bool,
    /// Generated by a locked SyncTracker rather than the raw source
    pub is_tracker_synthesized: bool,
}

impl SyncPulse {
    pub fn new(source: SyncSource, event_type: SyncEventType, pulse_type: PulseType) -> Self {
        Self {
            source,
            event_type,
            pulse_type,
            frame_offset: 0,
            pulse_number: 0,
            continue_pulse: 0,
            is_loop_start_point: false,
            is_tracker_synthesized: false,
        }
    }

    pub fn pulse(source: SyncSource, pulse_type: PulseType, pulse_number: u64) -> Self {
        Self {
            pulse_number,
            ..Self::new(source, SyncEventType::Pulse, pulse_type)
        }
    }

    pub fn at(mut self, frame_offset: usize) -> Self {
        self.frame_offset = frame_offset;
        self
    }

    pub fn synthesized(mut self) -> Self {
        self.is_tracker_synthesized = true;
        self
    }

    /// Beat-level (or coarser) pulse, or a transport Start/Continue
    pub fn is_beat_or_restart(&self) -> bool {
        self.event_type.is_restart()
            || (self.event_type == SyncEventType::Pulse && self.pulse_type.is_beat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_type_order() {
        assert!(PulseType::Clock < PulseType::Beat);
        assert!(PulseType::Beat < PulseType::Bar);
        assert!(PulseType::Cycle < PulseType::Loop);
        assert!(PulseType::Loop.is_bar());
        assert!(!PulseType::Clock.is_beat());
    }

    #[test]
    fn test_builders() {
        let pulse = SyncPulse::pulse(SyncSource::Host, PulseType::Bar, 8)
            .at(128)
            .synthesized();
        assert_eq!(pulse.frame_offset, 128);
        assert_eq!(pulse.pulse_number, 8);
        assert!(pulse.is_tracker_synthesized);
        assert!(pulse.is_beat_or_restart());

        let clock = SyncPulse::pulse(SyncSource::Midi, PulseType::Clock, 3);
        assert!(!clock.is_beat_or_restart());

        let start = SyncPulse::new(SyncSource::Midi, SyncEventType::Start, PulseType::Bar);
        assert!(start.is_beat_or_restart());
    }

    #[test]
    fn test_tracker_index() {
        assert_eq!(SyncSource::Track.tracker_index(), None);
        let indexes: Vec<usize> = SyncSource::TRACKED
            .iter()
            .filter_map(|s| s.tracker_index())
            .collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(SyncSource::Midi.pulses_per_beat(), 24);
        assert_eq!(SyncSource::Host.pulses_per_beat(), 1);
    }
}
