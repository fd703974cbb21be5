// Sync functions - loop functions that need scheduling against a sync source
//
// Each function maps to a static strategy entry describing how the
// Synchronizer handles it. The set is fixed so the table is resolved at
// compile time.

use crate::sync::record::{RecordStart, StopSchedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFunction {
    /// Start recording, or stop at the next unit when already recording
    Record,
    /// Record a fixed number of bars; invoking again while recording extends it
    AutoRecord { bars: u32 },
    /// Undo the last AutoRecord extension
    UndoRecordStop,
    Realign,
    /// Mute now, unmute when the realign happens
    MuteRealign,
    /// Send MIDI Start at the next start point of the track
    MidiStart,
    /// Send MIDI Stop now
    MidiStop,
    /// Correct drift at the next checkpoint regardless of the threshold
    DriftCorrect,
}

/// Tag of a SyncFunction, used as the strategy table key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Record = 0,
    AutoRecord,
    UndoRecordStop,
    Realign,
    MuteRealign,
    MidiStart,
    MidiStop,
    DriftCorrect,
}

/// What the Synchronizer does for a function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionAction {
    /// Start a synchronized recording or schedule its stop
    RecordToggle,
    /// Undo a record stop extension
    UndoStop,
    /// Move the track into phase with its master
    Realign { mute: bool },
    /// Resend Start to the external device at the track's start point
    ExternalStart,
    ExternalStop,
    ForceCorrection,
}

#[derive(Debug)]
pub struct FunctionStrategy {
    pub kind: FunctionKind,
    pub name: &'static str,
    pub action: FunctionAction,
    /// Needs a synchronized source to be meaningful
    pub needs_sync: bool,
}

static STRATEGIES: [FunctionStrategy; 8] = [
    FunctionStrategy {
        kind: FunctionKind::Record,
        name: "Record",
        action: FunctionAction::RecordToggle,
        needs_sync: false,
    },
    FunctionStrategy {
        kind: FunctionKind::AutoRecord,
        name: "AutoRecord",
        action: FunctionAction::RecordToggle,
        needs_sync: false,
    },
    FunctionStrategy {
        kind: FunctionKind::UndoRecordStop,
        name: "UndoRecordStop",
        action: FunctionAction::UndoStop,
        needs_sync: false,
    },
    FunctionStrategy {
        kind: FunctionKind::Realign,
        name: "Realign",
        action: FunctionAction::Realign { mute: false },
        needs_sync: true,
    },
    FunctionStrategy {
        kind: FunctionKind::MuteRealign,
        name: "MuteRealign",
        action: FunctionAction::Realign { mute: true },
        needs_sync: true,
    },
    FunctionStrategy {
        kind: FunctionKind::MidiStart,
        name: "MidiStart",
        action: FunctionAction::ExternalStart,
        needs_sync: false,
    },
    FunctionStrategy {
        kind: FunctionKind::MidiStop,
        name: "MidiStop",
        action: FunctionAction::ExternalStop,
        needs_sync: false,
    },
    FunctionStrategy {
        kind: FunctionKind::DriftCorrect,
        name: "DriftCorrect",
        action: FunctionAction::ForceCorrection,
        needs_sync: true,
    },
];

impl SyncFunction {
    pub fn kind(&self) -> FunctionKind {
        match self {
            SyncFunction::Record => FunctionKind::Record,
            SyncFunction::AutoRecord { .. } => FunctionKind::AutoRecord,
            SyncFunction::UndoRecordStop => FunctionKind::UndoRecordStop,
            SyncFunction::Realign => FunctionKind::Realign,
            SyncFunction::MuteRealign => FunctionKind::MuteRealign,
            SyncFunction::MidiStart => FunctionKind::MidiStart,
            SyncFunction::MidiStop => FunctionKind::MidiStop,
            SyncFunction::DriftCorrect => FunctionKind::DriftCorrect,
        }
    }

    pub fn strategy(&self) -> &'static FunctionStrategy {
        &STRATEGIES[self.kind() as usize]
    }

    pub fn name(&self) -> &'static str {
        self.strategy().name
    }

    /// Bars requested by AutoRecord
    pub fn auto_bars(&self) -> Option<u32> {
        match self {
            SyncFunction::AutoRecord { bars } => Some((*bars).max(1)),
            _ => None,
        }
    }
}

/// Where a realign will happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealignSchedule {
    /// Track moved to `frame` immediately
    Now { frame: i64 },
    /// Waiting for a matching pulse
    Pending,
    /// The external device will be restarted instead
    External,
    /// Nothing to align with
    Ignored,
}

/// Result of invoking a SyncFunction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionOutcome {
    RecordStart(RecordStart),
    /// AutoRecord schedules both ends at once
    AutoRecord { start: RecordStart, stop: StopSchedule },
    RecordStop(StopSchedule),
    Realign { schedule: RealignSchedule, mute: bool },
    TransportSent,
    TransportScheduled,
    CorrectionScheduled,
    Ignored,
}
