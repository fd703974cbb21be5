// Loop tracks - the view of a track the Synchronizer needs
//
// The loop engine owns its tracks; the Synchronizer only ever sees them
// through this trait and refers to them by TrackId.

use crate::sync::pulse::SyncSource;
use std::fmt;

/// Maximum (unattenuated) feedback level
pub const MAX_FEEDBACK: u8 = 127;

/// Opaque track identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track {}", self.0)
    }
}

/// Mode of a track's loop state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackMode {
    #[default]
    Reset,
    /// Waiting for a sync pulse before recording
    Synchronize,
    Threshold,
    Record,
    Play,
    Overdub,
    Multiply,
    Insert,
    Replace,
    Mute,
    Pause,
    Confirm,
}

impl TrackMode {
    pub fn is_recording(&self) -> bool {
        matches!(
            self,
            TrackMode::Record | TrackMode::Overdub | TrackMode::Multiply | TrackMode::Insert | TrackMode::Replace
        )
    }

    /// Modes in which the play frame can be moved without damaging content
    pub fn is_correctable(&self) -> bool {
        matches!(
            self,
            TrackMode::Play | TrackMode::Mute | TrackMode::Confirm | TrackMode::Reset
        )
    }
}

/// Event scheduled on a track that has not happened yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingEvent {
    #[default]
    None,
    DriftCheck,
    /// Waiting for a sync pulse
    PulseWait,
    RecordStop,
    Realign,
    /// Any other scheduled function
    Other,
}

impl PendingEvent {
    /// Pending events that a frame jump does not invalidate
    pub fn allows_correction(&self) -> bool {
        matches!(
            self,
            PendingEvent::None | PendingEvent::DriftCheck | PendingEvent::PulseWait
        )
    }
}

pub trait LoopTrack {
    fn id(&self) -> TrackId;

    /// Sync source the track follows, None when unsynchronized
    fn sync_source(&self) -> Option<SyncSource>;

    fn mode(&self) -> TrackMode;

    fn feedback(&self) -> u8 {
        MAX_FEEDBACK
    }

    fn pending(&self) -> PendingEvent {
        PendingEvent::None
    }

    /// Current play frame within the loop
    fn frame(&self) -> i64;

    fn set_frame(&mut self, frame: i64);

    /// Loop length in frames, 0 when empty
    fn frames(&self) -> i64;

    fn cycles(&self) -> u32 {
        1
    }

    /// Cycle count reported while recording and corrected at record stop
    fn set_cycles(&mut self, cycles: u32);

    fn subcycles(&self) -> u32 {
        4
    }

    fn speed(&self) -> f32 {
        1.0
    }

    fn is_empty(&self) -> bool {
        self.frames() <= 0
    }

    fn cycle_frames(&self) -> i64 {
        let cycles = self.cycles().max(1) as i64;
        self.frames() / cycles
    }

    /// Whether a drift correction may move this track
    fn is_correctable(&self) -> bool {
        self.mode().is_correctable()
            && self.feedback() >= MAX_FEEDBACK
            && self.pending().allows_correction()
    }
}

/// Minimal in-memory track, used by the demo and by tests
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualTrack {
    pub id: TrackId,
    pub sync_source: Option<SyncSource>,
    pub mode: TrackMode,
    pub feedback: u8,
    pub pending: PendingEvent,
    pub frame: i64,
    pub frames: i64,
    pub cycles: u32,
    pub subcycles: u32,
    pub speed: f32,
}

impl VirtualTrack {
    pub fn new(id: u32, sync_source: Option<SyncSource>) -> Self {
        Self {
            id: TrackId(id),
            sync_source,
            mode: TrackMode::Reset,
            feedback: MAX_FEEDBACK,
            pending: PendingEvent::None,
            frame: 0,
            frames: 0,
            cycles: 1,
            subcycles: 4,
            speed: 1.0,
        }
    }

    /// Playing loop of `frames` frames split into `cycles` cycles
    pub fn with_loop(mut self, frames: i64, cycles: u32) -> Self {
        self.frames = frames;
        self.cycles = cycles.max(1);
        self.mode = TrackMode::Play;
        self
    }

    /// Advance the play frame, true when the loop start was crossed
    pub fn advance(&mut self, frame_count: usize) -> bool {
        match self.mode {
            TrackMode::Record | TrackMode::Synchronize | TrackMode::Threshold => {
                if self.mode == TrackMode::Record {
                    self.frames += frame_count as i64;
                    self.frame = self.frames;
                }
                false
            }
            TrackMode::Reset | TrackMode::Pause => false,
            _ if self.frames <= 0 => false,
            _ => {
                let delta = (frame_count as f64 * self.speed as f64) as i64;
                let next = self.frame + delta;
                self.frame = next.rem_euclid(self.frames);
                next >= self.frames
            }
        }
    }

    pub fn reset(&mut self) {
        self.mode = TrackMode::Reset;
        self.frame = 0;
        self.frames = 0;
        self.cycles = 1;
        self.pending = PendingEvent::None;
    }
}

impl LoopTrack for VirtualTrack {
    fn id(&self) -> TrackId {
        self.id
    }

    fn sync_source(&self) -> Option<SyncSource> {
        self.sync_source
    }

    fn mode(&self) -> TrackMode {
        self.mode
    }

    fn feedback(&self) -> u8 {
        self.feedback
    }

    fn pending(&self) -> PendingEvent {
        self.pending
    }

    fn frame(&self) -> i64 {
        self.frame
    }

    fn set_frame(&mut self, frame: i64) {
        self.frame = if self.frames > 0 {
            frame.rem_euclid(self.frames)
        } else {
            0
        };
    }

    fn frames(&self) -> i64 {
        self.frames
    }

    fn cycles(&self) -> u32 {
        self.cycles
    }

    fn set_cycles(&mut self, cycles: u32) {
        self.cycles = cycles.max(1);
    }

    fn subcycles(&self) -> u32 {
        self.subcycles
    }

    fn speed(&self) -> f32 {
        self.speed
    }
}

/// Index of the track with `id`
pub fn find_track<T: LoopTrack>(tracks: &[T], id: TrackId) -> Option<usize> {
    tracks.iter().position(|t| t.id() == id)
}
