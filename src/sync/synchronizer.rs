// Synchronizer - per-block mediator between sync sources and loop tracks
//
// Once per audio block interrupt_start() drains the MIDI queue, the clock
// loopback and the host timing, feeds raw pulses to the trackers, advances
// them and merges everything into one offset-ordered event list. Tracks walk
// that list with prepare/get_next_event/use_event/finish, and the loop engine
// reports state changes through the loop_* callbacks. interrupt_end() runs the
// drift checkpoints and clears the block.

use crate::config::{
    DriftCheckPoint, MuteSyncMode, OutRealignMode, RealignTime, SyncConfig, SyncUnit,
    TempoEstimation, TrackUnit,
};
use crate::diagnostics::{Counter, Diagnostics};
use crate::messaging::command::ConfigReceiver;
use crate::midi::queue::RealtimeEventQueue;
use crate::sync::function::{FunctionAction, FunctionOutcome, RealignSchedule, SyncFunction};
use crate::sync::host::{HostTimeInfo, HostTransportMonitor};
use crate::sync::master::{MasterAssignment, is_out_master_eligible};
use crate::sync::pool::{Borrowed, EventHandle, EventPool};
use crate::sync::pulse::{PulseType, SyncEventType, SyncPulse, SyncSource};
use crate::sync::record::{
    RecordStart, RecordSyncState, StopSchedule, clamp_tempo, frames_per_beat, tempo_for_cycle,
};
use crate::sync::status::{SharedSyncStatus, SyncStatus, TrackerSnapshot};
use crate::sync::track::{LoopTrack, TrackId, find_track};
use crate::sync::tracker::SyncTracker;
use crate::transport::clock::ClockTransport;
use std::sync::Arc;

/// Events one block can hold
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// What a consumed event means for the track that consumed it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    None,
    /// Synchronize is over, start recording at this offset
    StartRecording { frame_offset: usize },
    /// End the recording at this offset, which may include input latency
    StopRecording { frame_offset: usize },
    /// The track's play frame was moved
    Realigned { frame: i64 },
    /// A recording crossed a cycle boundary, the track now has `cycles`
    CycleCrossed { cycles: u32 },
}

/// Geometry of a finished recording
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordStopResult {
    pub cycles: u32,
    /// Counted beats, 0 when the recording was not pulse-synchronized
    pub beats: u32,
    /// Clock tempo when this recording became the out-sync master
    pub tempo: Option<f64>,
}

/// Which events a prepared track sees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EventFilter {
    source: SyncSource,
    synthesized: bool,
}

impl EventFilter {
    fn matches(&self, pulse: &SyncPulse) -> bool {
        pulse.source == self.source
            && pulse.is_tracker_synthesized == self.synthesized
            && !(pulse.event_type == SyncEventType::Pulse && pulse.pulse_type == PulseType::Clock)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRealign {
    track: TrackId,
    time: RealignTime,
}

fn track_unit_pulse(unit: TrackUnit) -> PulseType {
    match unit {
        TrackUnit::Subcycle => PulseType::Subcycle,
        TrackUnit::Cycle => PulseType::Cycle,
        TrackUnit::Loop => PulseType::Loop,
    }
}

pub struct Synchronizer {
    sample_rate: f64,
    diagnostics: Arc<Diagnostics>,
    config: ConfigReceiver,
    midi: RealtimeEventQueue,
    transport: ClockTransport,
    host: HostTransportMonitor,
    trackers: [SyncTracker; 3],

    pool: EventPool<SyncPulse>,
    events: Vec<EventHandle>,
    scratch: Vec<SyncPulse>,
    block_frames: usize,

    cursor: usize,
    current: Option<TrackId>,
    filter: Option<EventFilter>,

    records: Vec<RecordSyncState>,
    max_records: usize,
    realigns: Vec<PendingRealign>,
    local_start_points: Vec<TrackId>,
    pending_external_start: Option<TrackId>,
    forced: [bool; 3],
    masters: MasterAssignment,
    status: Arc<SharedSyncStatus>,
}

impl Synchronizer {
    pub fn new(
        sample_rate: f64,
        config: ConfigReceiver,
        midi: RealtimeEventQueue,
        transport: ClockTransport,
        max_tracks: usize,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let max_tracks = max_tracks.max(1);
        let mut sync = Self {
            sample_rate,
            config,
            midi,
            transport,
            host: HostTransportMonitor::new(),
            trackers: [
                SyncTracker::new(SyncSource::Out, diagnostics.clone()),
                SyncTracker::new(SyncSource::Host, diagnostics.clone()),
                SyncTracker::new(SyncSource::Midi, diagnostics.clone()),
            ],
            pool: EventPool::new(DEFAULT_EVENT_CAPACITY),
            events: Vec::with_capacity(DEFAULT_EVENT_CAPACITY),
            scratch: Vec::with_capacity(DEFAULT_EVENT_CAPACITY),
            block_frames: 0,
            cursor: 0,
            current: None,
            filter: None,
            records: Vec::with_capacity(max_tracks),
            max_records: max_tracks,
            realigns: Vec::with_capacity(max_tracks),
            local_start_points: Vec::with_capacity(max_tracks),
            pending_external_start: None,
            forced: [false; 3],
            masters: MasterAssignment::new(),
            status: SharedSyncStatus::new(),
            diagnostics,
        };
        sync.apply_config();
        sync
    }

    fn cfg(&self) -> &SyncConfig {
        self.config.current()
    }

    fn apply_config(&mut self) {
        let bpb = self.cfg().beats_per_bar;
        let timeout = self.cfg().clock_timeout_ms;
        self.midi.set_beats_per_bar(bpb);
        self.midi.set_clock_timeout_ms(timeout);
        self.transport.set_beats_per_bar(bpb);
    }

    fn tracker(&self, source: SyncSource) -> Option<&SyncTracker> {
        source.tracker_index().map(|i| &self.trackers[i])
    }

    fn is_locked(&self, source: SyncSource) -> bool {
        self.tracker(source).is_some_and(|t| t.is_locked())
    }

    fn record_index(&self, id: TrackId) -> Option<usize> {
        self.records.iter().position(|r| r.track == id)
    }

    fn beats_per_bar(&self, source: SyncSource) -> u32 {
        match self.tracker(source) {
            Some(tracker) if tracker.is_locked() => tracker.get_beats_per_bar(),
            _ if source == SyncSource::Host && self.host.beats_per_bar() > 0 => {
                self.host.beats_per_bar()
            }
            _ => self.cfg().beats_per_bar,
        }
    }

    /// Tempo currently observed for a source, 0 when unknown
    pub fn source_tempo(&self, source: SyncSource) -> f64 {
        match source {
            SyncSource::Midi => self.midi.tempo_monitor().tempo(self.cfg().midi_tempo_mode),
            SyncSource::Host => self.host.tempo(),
            SyncSource::Out => self.transport.get_tempo(),
            SyncSource::Track => 0.0,
        }
    }

    // --- Block processing ---------------------------------------------------

    /// Gather and order this block's sync events
    pub fn interrupt_start(&mut self, block_frames: usize, host: Option<&HostTimeInfo>) {
        self.block_frames = block_frames;
        if self.config.poll() {
            self.apply_config();
            self.diagnostics.debug(format_args!("sync config updated"));
        }

        self.release_events();
        self.scratch.clear();
        self.midi.drain(block_frames, &mut self.scratch);
        self.transport.drain(block_frames, &mut self.scratch);
        if let Some(info) = host {
            self.host.process(info, &mut self.scratch);
        }

        // Raw pulses are measured against the position at block start
        for pulse in self.scratch.iter_mut() {
            if let Some(index) = pulse.source.tracker_index() {
                self.trackers[index].event(pulse);
            }
        }
        for tracker in self.trackers.iter_mut() {
            tracker.advance(block_frames, Some(&mut self.scratch));
        }

        for i in 0..self.scratch.len() {
            let pulse = self.scratch[i];
            self.insert_event(pulse);
        }
        self.scratch.clear();
        self.cursor = 0;
        self.current = None;
        self.filter = None;
    }

    /// Insert keeping offsets non-decreasing, returns the position
    fn insert_event(&mut self, pulse: SyncPulse) -> Option<usize> {
        let Some(handle) = self.pool.acquire(pulse) else {
            self.diagnostics.bump(Counter::PoolExhausted);
            self.diagnostics
                .debug(format_args!("sync event pool exhausted, {:?} dropped", pulse.source));
            return None;
        };
        let pool = &self.pool;
        let position = self.events.partition_point(|h| {
            pool.get(*h)
                .is_some_and(|p| p.frame_offset <= pulse.frame_offset)
        });
        self.events.insert(position, handle);
        Some(position)
    }

    fn release_events(&mut self) {
        for handle in self.events.drain(..) {
            self.pool.release(handle);
        }
    }

    /// Events in this block's merged list
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Event at a list position, regardless of any track filter
    pub fn event_at(&self, index: usize) -> Option<Borrowed<'_, SyncPulse>> {
        self.events.get(index).and_then(|h| self.pool.borrow(*h))
    }

    /// Start iterating this block's events for `track`
    pub fn prepare<T: LoopTrack + ?Sized>(&mut self, track: &T) {
        let id = track.id();
        self.cursor = 0;
        self.current = Some(id);
        self.filter = track.sync_source().map(|source| {
            let synthesized = match source.tracker_index() {
                None => false,
                Some(index) => match self.record_index(id) {
                    Some(r) => self.records[r].tracker_locked_at_start,
                    None => self.trackers[index].is_locked(),
                },
            };
            EventFilter {
                source,
                synthesized,
            }
        });
    }

    /// Next event relevant to the prepared track, not consumed
    pub fn get_next_event(&mut self) -> Option<Borrowed<'_, SyncPulse>> {
        let filter = self.filter?;
        while self.cursor < self.events.len() {
            let handle = self.events[self.cursor];
            let relevant = self.pool.get(handle).is_some_and(|p| filter.matches(p));
            if relevant {
                return self.pool.borrow(handle);
            }
            self.cursor += 1;
        }
        None
    }

    /// Consume the event returned by get_next_event
    pub fn use_event<T: LoopTrack + ?Sized>(&mut self, track: &mut T) -> SyncOutcome {
        let Some(&handle) = self.events.get(self.cursor) else {
            return SyncOutcome::None;
        };
        let Some(pulse) = self.pool.get(handle).copied() else {
            return SyncOutcome::None;
        };
        self.cursor += 1;

        match self.record_index(track.id()) {
            Some(index) => self.record_event(index, &pulse, track),
            None => self.realign_event(&pulse, track),
        }
    }

    /// End iteration for `track`, reporting relevant events it never consumed
    pub fn finish<T: LoopTrack + ?Sized>(&mut self, track: &T) -> usize {
        let mut left = 0;
        if let Some(filter) = self.filter {
            for handle in &self.events[self.cursor.min(self.events.len())..] {
                if self.pool.get(*handle).is_some_and(|p| filter.matches(p)) {
                    left += 1;
                    self.diagnostics.bump(Counter::UnconsumedEvent);
                }
            }
        }
        if left > 0 {
            self.diagnostics.debug(format_args!(
                "{}: {} sync events left unconsumed",
                track.id(),
                left
            ));
        }
        self.current = None;
        self.filter = None;
        left
    }

    /// Pulse from the track sync master at one of its boundaries
    ///
    /// `master_frame` is the master's play frame at the pulse and becomes the
    /// pulse number. Ignored unless `track_id` is the track sync master.
    pub fn add_track_pulse(
        &mut self,
        track_id: TrackId,
        pulse_type: PulseType,
        frame_offset: usize,
        master_frame: i64,
    ) -> bool {
        if !self.masters.is_track_master(track_id) {
            self.diagnostics.trace(format_args!(
                "{}: track pulse ignored, not the track sync master",
                track_id
            ));
            return false;
        }
        let mut pulse =
            SyncPulse::pulse(SyncSource::Track, pulse_type, master_frame.max(0) as u64).at(frame_offset);
        pulse.is_loop_start_point = pulse_type == PulseType::Loop;

        match self.insert_event(pulse) {
            Some(position) => {
                if position < self.cursor {
                    self.cursor += 1;
                }
                true
            }
            None => false,
        }
    }

    /// Drift checkpoints, then clear the block
    pub fn interrupt_end<T: LoopTrack>(&mut self, tracks: &mut [T]) {
        for source in SyncSource::TRACKED {
            let Some(index) = source.tracker_index() else {
                continue;
            };
            if !self.trackers[index].is_locked() {
                continue;
            }

            let checkpoint = match self.cfg().drift_check_point {
                DriftCheckPoint::External => self.trackers[index].wrapped(),
                DriftCheckPoint::Loop => tracks
                    .iter()
                    .find(|t| t.sync_source() == Some(source) && !t.is_empty())
                    .is_some_and(|t| self.local_start_points.contains(&t.id())),
            };
            if !checkpoint {
                continue;
            }

            let drift = self.trackers[index].get_drift();
            let forced = self.forced[index];
            if drift.abs() <= self.cfg().max_sync_drift && !forced {
                continue;
            }

            if self.correct_drift(source, tracks) {
                self.forced[index] = false;
                self.diagnostics.bump(Counter::Correction);
            } else {
                self.diagnostics.bump(Counter::DeferredCorrection);
                self.diagnostics.debug(format_args!(
                    "{:?} drift {} correction deferred",
                    source, drift
                ));
            }
        }

        self.release_events();
        self.local_start_points.clear();
        self.cursor = 0;
        self.current = None;
        self.filter = None;
        self.publish_status();
    }

    // --- Drift ---------------------------------------------------------------

    /// Correct a tracker and every track depending on it
    ///
    /// Refused, leaving all state unchanged, when any dependent track cannot
    /// be moved. Returns true when the correction was applied.
    pub fn correct_drift<T: LoopTrack>(&mut self, source: SyncSource, tracks: &mut [T]) -> bool {
        let Some(index) = source.tracker_index() else {
            return false;
        };
        if !self.trackers[index].is_locked() {
            return false;
        }

        // Track-sync slaves move with a master that follows Out
        let slaves_follow = source == SyncSource::Out
            && self
                .masters
                .track_sync_master
                .and_then(|id| find_track(tracks, id))
                .and_then(|i| tracks[i].sync_source())
                == Some(SyncSource::Out);
        let depends = |t: &T| -> bool {
            !t.is_empty()
                && (t.sync_source() == Some(source)
                    || (slaves_follow && t.sync_source() == Some(SyncSource::Track)))
        };

        if let Some(blocking) = tracks.iter().find(|t| depends(*t) && !t.is_correctable()) {
            self.diagnostics.debug(format_args!(
                "{:?} correction refused by {} in {:?}",
                source,
                blocking.id(),
                blocking.mode()
            ));
            return false;
        }

        let drift = self.trackers[index].get_drift();
        let delta = self.trackers[index].correct();
        for track in tracks.iter_mut() {
            if depends(&*track) {
                let frame = (track.frame() + delta).rem_euclid(track.frames());
                track.set_frame(frame);
            }
        }
        self.diagnostics
            .info(format_args!("{:?} drift {} corrected", source, drift));
        true
    }

    /// Correct at the next checkpoint even below the drift threshold
    pub fn force_drift_correction(&mut self, source: SyncSource) {
        if let Some(index) = source.tracker_index() {
            self.forced[index] = true;
        }
    }

    // --- Synchronized recording ----------------------------------------------

    fn is_start_pulse(&self, pulse: &SyncPulse, record: &RecordSyncState) -> bool {
        if record.source == SyncSource::Track {
            return pulse.event_type == SyncEventType::Pulse
                && pulse.pulse_type >= track_unit_pulse(self.cfg().track_unit);
        }
        let on_bar = record.unit_pulses > 1;
        match pulse.event_type {
            SyncEventType::Start => true,
            SyncEventType::Stop => false,
            SyncEventType::Continue | SyncEventType::Pulse => {
                if on_bar {
                    pulse.pulse_type.is_bar()
                } else {
                    pulse.pulse_type.is_beat()
                }
            }
        }
    }

    fn counts_pulse(&self, pulse: &SyncPulse, source: SyncSource) -> bool {
        if pulse.event_type != SyncEventType::Pulse {
            return false;
        }
        match source {
            SyncSource::Track => pulse.pulse_type >= track_unit_pulse(self.cfg().track_unit),
            _ => pulse.pulse_type.is_beat(),
        }
    }

    fn record_event<T: LoopTrack + ?Sized>(
        &mut self,
        index: usize,
        pulse: &SyncPulse,
        track: &mut T,
    ) -> SyncOutcome {
        let record = self.records[index];
        if record.waiting_start {
            if !self.is_start_pulse(pulse, &record) {
                return SyncOutcome::None;
            }
            let record = &mut self.records[index];
            record.waiting_start = false;
            record.origin_pulse = pulse.pulse_number;
            record.pulses = 0;
            record.cycles = 1;
            self.diagnostics.debug(format_args!(
                "{}: synchronized record start at offset {}",
                record.track, pulse.frame_offset
            ));
            return SyncOutcome::StartRecording {
                frame_offset: pulse.frame_offset,
            };
        }

        if !self.counts_pulse(pulse, record.source) {
            return SyncOutcome::None;
        }
        let latency = self.cfg().input_latency.max(0) as usize;
        let record = &mut self.records[index];
        let crossed = record.count_pulse();
        if !record.stop_reached() {
            if !crossed {
                return SyncOutcome::None;
            }
            let cycles = record.cycles;
            track.set_cycles(cycles);
            self.diagnostics.trace(format_args!(
                "{}: recording entered cycle {}",
                record.track, cycles
            ));
            return SyncOutcome::CycleCrossed { cycles };
        }

        record.stop_pending = false;
        let mut frame_offset = pulse.frame_offset;
        if record.source == SyncSource::Midi && !pulse.is_tracker_synthesized {
            frame_offset += latency;
        }
        self.diagnostics.debug(format_args!(
            "{}: pulsed record stop after {} pulses",
            record.track, record.pulses
        ));
        SyncOutcome::StopRecording { frame_offset }
    }

    /// Decide whether a recording starts now or waits for a pulse
    pub fn schedule_record_start<T: LoopTrack + ?Sized>(
        &mut self,
        track: &T,
        function: SyncFunction,
    ) -> RecordStart {
        let id = track.id();
        if let Some(index) = self.record_index(id) {
            self.records.swap_remove(index);
        }
        let Some(source) = track.sync_source() else {
            return RecordStart::Now;
        };

        let locked = self.is_locked(source);
        let synchronize = match source {
            SyncSource::Track => self.masters.track_sync_master.is_some_and(|m| m != id),
            SyncSource::Out => locked,
            SyncSource::Midi => locked || self.midi.is_started(),
            SyncSource::Host => locked || self.host.is_playing(),
        };

        let bpb = self.beats_per_bar(source);
        let (cycle_pulses, unit_pulses) = match source {
            SyncSource::Track => (1, 1),
            _ if function.auto_bars().is_some() || self.cfg().record_unit == SyncUnit::Bar => {
                (bpb, bpb)
            }
            _ => (bpb, 1),
        };

        let mut record = RecordSyncState::new(id, source, cycle_pulses);
        record.unit_pulses = unit_pulses;
        record.tracker_locked_at_start = locked && source != SyncSource::Track;
        record.waiting_start = synchronize;
        if self.records.len() >= self.max_records {
            self.diagnostics.warn(format_args!(
                "{}: record state table full, recording unsynchronized",
                id
            ));
            return RecordStart::Now;
        }
        self.records.push(record);

        if synchronize {
            RecordStart::Synchronize
        } else {
            RecordStart::Now
        }
    }

    /// Schedule the end of a synchronized recording
    ///
    /// Pulsed for track sync and for locked trackers, precomputed from the
    /// observed tempo for unlocked MIDI/Host. An unlocked Out source stops
    /// now, the recording will define the clock tempo.
    pub fn schedule_record_stop<T: LoopTrack + ?Sized>(
        &mut self,
        track: &T,
        function: SyncFunction,
    ) -> StopSchedule {
        let Some(index) = self.record_index(track.id()) else {
            return StopSchedule::Now;
        };
        let auto_bars = function.auto_bars();
        let source = self.records[index].source;

        if self.records[index].waiting_start && auto_bars.is_none() {
            // Stop while still synchronizing cancels the recording
            self.records.swap_remove(index);
            return StopSchedule::Now;
        }

        let pulsed = source == SyncSource::Track || self.is_locked(source);
        if source == SyncSource::Out && !pulsed {
            return StopSchedule::Now;
        }

        let required = auto_bars.unwrap_or(1);
        if let Some(bars) = auto_bars {
            let record = &mut self.records[index];
            record.extend_units = bars;
            if source != SyncSource::Track {
                record.unit_pulses = record.cycle_pulses;
            }
        }

        if pulsed {
            let record = &mut self.records[index];
            record.units_required = required.max(record.completed_units() + 1);
            record.stop_pending = true;
            record.rounding = false;
            return StopSchedule::Pending;
        }

        let fpb = frames_per_beat(self.sample_rate, self.source_tempo(source));
        if fpb <= 0.0 {
            self.diagnostics.warn(format_args!(
                "{}: no {:?} tempo, stopping now",
                track.id(),
                source
            ));
            return StopSchedule::Now;
        }
        let unit = fpb * self.records[index].unit_pulses as f64;
        if unit.fract() != 0.0 {
            self.diagnostics.warn(format_args!(
                "{}: fractional record unit {:.3} frames rounded",
                track.id(),
                unit
            ));
        }

        let record = &mut self.records[index];
        record.unit_frames = unit.round() as i64;
        record.units_required = required;
        record.rounding = true;
        record.stop_pending = true;
        record.precomputed_stop(track.frames())
    }

    /// Add units to a pending stop
    pub fn extend_record_stop<T: LoopTrack + ?Sized>(&mut self, track: &T) -> StopSchedule {
        let Some(index) = self.record_index(track.id()) else {
            return StopSchedule::Now;
        };
        if !self.records[index].stop_pending {
            return self.schedule_record_stop(track, SyncFunction::Record);
        }

        let record = &mut self.records[index];
        record.units_required += record.extend_units;
        if record.rounding {
            record.precomputed_stop(track.frames())
        } else {
            StopSchedule::Pending
        }
    }

    /// Remove the last extension, never below what is already recorded
    pub fn undo_record_stop<T: LoopTrack + ?Sized>(&mut self, track: &T) -> Option<StopSchedule> {
        let index = self.record_index(track.id())?;
        let record = &mut self.records[index];
        if !record.stop_pending {
            return None;
        }

        let floor = if record.rounding {
            let units_before = record.units_required;
            record.units_required = 0;
            let covering = record.units_covering(track.frames());
            record.units_required = units_before;
            covering
        } else {
            record.completed_units() + 1
        };
        record.units_required = record
            .units_required
            .saturating_sub(record.extend_units)
            .max(floor)
            .max(1);

        if record.rounding {
            Some(record.precomputed_stop(track.frames()))
        } else {
            Some(StopSchedule::Pending)
        }
    }

    pub fn record_state(&self, id: TrackId) -> Option<&RecordSyncState> {
        self.record_index(id).map(|i| &self.records[i])
    }

    /// Recording on `track_id` ended `frame_offset` frames into this block
    ///
    /// Locks the source's tracker if needed, and elects the track as a master
    /// where the role is vacant.
    pub fn loop_record_stop<T: LoopTrack>(
        &mut self,
        track_id: TrackId,
        tracks: &mut [T],
        frame_offset: usize,
    ) -> RecordStopResult {
        let record = self.record_index(track_id).map(|i| self.records.swap_remove(i));
        let Some(i) = find_track(tracks, track_id) else {
            return RecordStopResult {
                cycles: 1,
                beats: 0,
                tempo: None,
            };
        };

        let source = tracks[i].sync_source();
        let frames = tracks[i].frames();
        let speed = tracks[i].speed();
        let bpb = source.map(|s| self.beats_per_bar(s)).unwrap_or(self.cfg().beats_per_bar);

        let (beats, cycles) = match record {
            Some(r) if r.rounding => {
                let beats = r.units_required * r.unit_pulses;
                let cycles = if beats % bpb.max(1) == 0 { beats / bpb.max(1) } else { 1 };
                (beats, cycles.max(1))
            }
            Some(r) if r.source != SyncSource::Track => (r.pulses, r.final_cycles()),
            Some(r) => (0, r.final_cycles()),
            None => (0, tracks[i].cycles().max(1)),
        };

        let remaining = self.block_frames.saturating_sub(frame_offset) as f64 * speed as f64;
        let mut tempo = None;

        match source {
            Some(source @ (SyncSource::Midi | SyncSource::Host)) if frames > 0 => {
                if let Some(index) = source.tracker_index() {
                    if !self.trackers[index].is_locked() {
                        let beats = if beats > 0 {
                            beats
                        } else {
                            let fpb = frames_per_beat(self.sample_rate, self.source_tempo(source));
                            if fpb > 0.0 {
                                ((frames as f64 / fpb).round() as u32).max(1)
                            } else {
                                bpb
                            }
                        };
                        let pulses = beats * source.pulses_per_beat();
                        if self.trackers[index].lock(0, pulses, frames, speed, bpb).is_ok() {
                            self.trackers[index].set_position(remaining);
                        }
                    }
                }
            }
            Some(SyncSource::Out) if frames > 0 && self.masters.out_sync_master.is_none() => {
                let cycle_frames = frames / cycles.max(1) as i64;
                tempo = self.lock_out_tracker(cycle_frames, cycles, frames, speed, remaining);
                if tempo.is_some() {
                    self.masters.out_sync_master = Some(track_id);
                    if !self.cfg().manual_start {
                        self.transport.start();
                    }
                }
            }
            _ => {}
        }

        tracks[i].set_cycles(cycles);
        if self.masters.track_sync_master.is_none() && frames > 0 {
            self.masters.track_sync_master = Some(track_id);
        }
        self.diagnostics.info(format_args!(
            "{}: record stop, {} frames, {} cycles, {} beats",
            track_id, frames, cycles, beats
        ));

        RecordStopResult {
            cycles,
            beats,
            tempo,
        }
    }

    /// Lock the Out tracker to a master loop and set the clock tempo
    ///
    /// Returns the tempo, None when the geometry is unusable.
    fn lock_out_tracker(
        &mut self,
        cycle_frames: i64,
        cycles: u32,
        frames: i64,
        speed: f32,
        position: f64,
    ) -> Option<f64> {
        if cycle_frames <= 0 || frames <= 0 {
            self.diagnostics
                .warn(format_args!("zero length out-sync loop, tempo unchanged"));
            return None;
        }
        let (tempo, pulses) = self.out_geometry(cycle_frames, cycles, speed);
        let bpb = self.cfg().beats_per_bar;

        let tracker = &mut self.trackers[0];
        tracker.reset();
        if tracker.lock(0, pulses, frames, speed, bpb).is_err() {
            return None;
        }
        tracker.set_position(position);

        if self.transport.set_tempo(tempo).is_err() {
            return None;
        }
        Some(tempo)
    }

    /// Clamped clock tempo and Out pulses per loop for a master geometry
    fn out_geometry(&self, cycle_frames: i64, cycles: u32, speed: f32) -> (f64, u32) {
        let config = self.cfg();
        let bpb = config.beats_per_bar;
        let raw = tempo_for_cycle(self.sample_rate, cycle_frames, bpb) * speed as f64;
        let cycle_pulses = bpb * SyncSource::Out.pulses_per_beat();
        let (tempo, cycle_pulses) =
            clamp_tempo(raw, cycle_pulses, config.min_tempo, config.max_tempo);
        if tempo > config.max_tempo.max(config.min_tempo) {
            self.diagnostics.warn(format_args!(
                "out tempo {:.2} cannot be halved below {:.2}",
                raw, tempo
            ));
        } else if tempo != raw {
            self.diagnostics.debug(format_args!(
                "out tempo {:.2} clamped to {:.2}",
                raw, tempo
            ));
        }
        (tempo, cycle_pulses * cycles.max(1))
    }

    // --- Loop engine callbacks -----------------------------------------------

    /// Track was reset: drop its roles, hand them over, release idle trackers
    pub fn loop_reset<T: LoopTrack>(&mut self, track_id: TrackId, tracks: &mut [T]) {
        if let Some(index) = self.record_index(track_id) {
            self.records.swap_remove(index);
        }
        self.realigns.retain(|r| r.track != track_id);
        if self.pending_external_start == Some(track_id) {
            self.pending_external_start = None;
        }

        let was_out_master = self.masters.is_out_master(track_id);
        let was_track_master = self.masters.is_track_master(track_id);
        self.masters.release(track_id);

        if was_out_master {
            if self.transport.is_sending() {
                self.transport.stop(true, true);
            }
            self.trackers[0].reset();
            self.masters.elect_out_master(tracks, Some(track_id));

            if let Some(new_master) = self.masters.out_sync_master {
                if let Some(i) = find_track(tracks, new_master) {
                    let track = &tracks[i];
                    let (cycle_frames, cycles, frames, speed, frame) = (
                        track.cycle_frames(),
                        track.cycles(),
                        track.frames(),
                        track.speed(),
                        track.frame(),
                    );
                    if self
                        .lock_out_tracker(cycle_frames, cycles, frames, speed, frame as f64)
                        .is_some()
                    {
                        self.transport.start_clocks();
                        if !self.cfg().manual_start {
                            // Start goes out when the new master reaches its start point
                            self.pending_external_start = Some(new_master);
                        }
                        self.diagnostics
                            .info(format_args!("{} is the new out-sync master", new_master));
                    }
                }
            }
        }

        if was_track_master {
            self.masters.elect_track_master(tracks, Some(track_id));
        }
        self.reset_unused_trackers(tracks, Some(track_id));
    }

    fn reset_unused_trackers<T: LoopTrack>(&mut self, tracks: &[T], exclude: Option<TrackId>) {
        for source in SyncSource::TRACKED {
            let Some(index) = source.tracker_index() else {
                continue;
            };
            if !self.trackers[index].is_locked() {
                continue;
            }
            let followed = tracks.iter().any(|t| {
                Some(t.id()) != exclude && !t.is_empty() && t.sync_source() == Some(source)
            });
            if !followed && !(source == SyncSource::Out && self.masters.out_sync_master.is_some()) {
                self.trackers[index].reset();
                self.forced[index] = false;
            }
        }
    }

    /// Length or cycle count changed (multiply, insert, undo, switch)
    pub fn loop_resize<T: LoopTrack>(&mut self, track_id: TrackId, tracks: &mut [T]) {
        if !self.masters.is_out_master(track_id) {
            return;
        }
        let Some(i) = find_track(tracks, track_id) else {
            return;
        };
        let track = &tracks[i];
        let (cycle_frames, cycles, frames, speed) =
            (track.cycle_frames(), track.cycles(), track.frames(), track.speed());
        if cycle_frames <= 0 || frames <= 0 {
            self.diagnostics.warn(format_args!(
                "{}: resize to zero length skipped",
                track_id
            ));
            return;
        }

        let (tempo, pulses) = self.out_geometry(cycle_frames, cycles, speed);
        if tempo != self.transport.get_tempo() {
            if let Err(e) = self.transport.set_tempo(tempo) {
                self.diagnostics.warn(format_args!("{}", e));
                return;
            }
        }
        self.trackers[0].resize(pulses, frames, speed);
        if !self.transport.is_sending() {
            self.trackers[0].commit_resize();
        }
    }

    pub fn loop_speed_change<T: LoopTrack>(&mut self, track_id: TrackId, tracks: &mut [T]) {
        self.loop_resize(track_id, tracks);
    }

    /// Out-sync master paused
    pub fn loop_pause(&mut self, track_id: TrackId) {
        self.loop_mute(track_id);
    }

    /// Out-sync master muted: stop transport or clocks per the mute policy
    pub fn loop_mute(&mut self, track_id: TrackId) {
        if !self.masters.is_out_master(track_id) {
            return;
        }
        match self.cfg().mute_sync_mode {
            MuteSyncMode::Transport => self.transport.stop(true, false),
            MuteSyncMode::Clocks => self.transport.stop(false, true),
            MuteSyncMode::Both => self.transport.stop(true, true),
            MuteSyncMode::None => {}
        }
    }

    pub fn loop_resume<T: LoopTrack>(&mut self, track_id: TrackId, tracks: &mut [T]) {
        self.loop_unmute(track_id, tracks);
    }

    /// Out-sync master audible again
    pub fn loop_unmute<T: LoopTrack>(&mut self, track_id: TrackId, tracks: &mut [T]) {
        if !self.masters.is_out_master(track_id) {
            return;
        }
        let Some(i) = find_track(tracks, track_id) else {
            return;
        };
        let frame = tracks[i].frame();
        let beat_frames = if tracks[i].cycle_frames() > 0 {
            tracks[i].cycle_frames() as f64 / self.cfg().beats_per_bar.max(1) as f64
        } else {
            0.0
        };

        let mode = self.cfg().mute_sync_mode;
        match mode {
            MuteSyncMode::Transport | MuteSyncMode::Both => {
                if frame == 0 || beat_frames <= 0.0 {
                    self.transport.start();
                } else {
                    // Song position counts sixteenths
                    let position = ((frame as f64 / beat_frames) * 4.0).floor() as u16;
                    self.transport.continue_(Some(position));
                }
            }
            MuteSyncMode::Clocks => self.transport.start_clocks(),
            MuteSyncMode::None => {}
        }
    }

    /// Start point moved on `track_id`
    pub fn loop_start_point_change<T: LoopTrack>(&mut self, track_id: TrackId, tracks: &mut [T]) {
        if !self.masters.is_out_master(track_id) {
            return;
        }
        if let Some(i) = find_track(tracks, track_id) {
            let frame = tracks[i].frame() as f64;
            self.trackers[0].set_position(frame);
        }
        if self.transport.is_sending() && self.cfg().out_realign_mode == OutRealignMode::RestartExternal
        {
            self.pending_external_start = Some(track_id);
        }
    }

    /// `track_id` crossed its own loop start `frame_offset` frames into the block
    pub fn loop_local_start_point(&mut self, track_id: TrackId, frame_offset: usize) {
        if !self.local_start_points.contains(&track_id)
            && self.local_start_points.len() < self.local_start_points.capacity()
        {
            self.local_start_points.push(track_id);
        }
        if self.pending_external_start == Some(track_id) {
            self.pending_external_start = None;
            self.restart_external(frame_offset);
        }
    }

    /// Send Start unless the external loop is already within the drift window of its start
    fn restart_external(&mut self, frame_offset: usize) {
        let tracker = &self.trackers[0];
        if self.transport.is_started() && tracker.is_locked() {
            let frame = tracker.frame_at_offset(frame_offset);
            let loop_frames = tracker.get_loop_frames() as f64;
            let distance = frame.min(loop_frames - frame);
            if distance <= self.cfg().max_sync_drift as f64 {
                self.transport.inc_starts();
                self.diagnostics.debug(format_args!(
                    "external start suppressed, {:.0} frames from start",
                    distance
                ));
                return;
            }
        }
        self.transport.start();
    }

    /// Loop content loaded into a track
    pub fn loop_load<T: LoopTrack>(&mut self, track_id: TrackId, tracks: &mut [T]) {
        let Some(i) = find_track(tracks, track_id) else {
            return;
        };
        if self.masters.out_sync_master.is_none() && is_out_master_eligible(&tracks[i]) {
            self.assign_loaded_out_master(i, tracks);
        }
        self.masters.elect_track_master(tracks, None);
    }

    /// A whole project was loaded, roles are recomputed from scratch
    pub fn project_load<T: LoopTrack>(&mut self, tracks: &mut [T]) {
        if self.transport.is_sending() {
            self.transport.stop(true, true);
        }
        for tracker in self.trackers.iter_mut() {
            tracker.reset();
        }
        self.records.clear();
        self.realigns.clear();
        self.pending_external_start = None;
        self.forced = [false; 3];
        self.masters.clear();

        self.masters.elect_out_master(tracks, None);
        if let Some(i) = self
            .masters
            .out_sync_master
            .and_then(|id| find_track(tracks, id))
        {
            self.masters.out_sync_master = None;
            self.assign_loaded_out_master(i, tracks);
        }
        self.masters.elect_track_master(tracks, None);
    }

    /// Tempo follows the loaded loop, transport is not started
    fn assign_loaded_out_master<T: LoopTrack>(&mut self, i: usize, tracks: &[T]) {
        let track = &tracks[i];
        let (id, cycle_frames, cycles, frames, speed, frame) = (
            track.id(),
            track.cycle_frames(),
            track.cycles(),
            track.frames(),
            track.speed(),
            track.frame(),
        );
        if self
            .lock_out_tracker(cycle_frames, cycles, frames, speed, frame as f64)
            .is_some()
        {
            self.masters.out_sync_master = Some(id);
        }
    }

    // --- Realign -------------------------------------------------------------

    /// Bring a track into phase with its master
    pub fn realign<T: LoopTrack>(
        &mut self,
        track_id: TrackId,
        tracks: &mut [T],
        frame_offset: usize,
    ) -> RealignSchedule {
        let Some(i) = find_track(tracks, track_id) else {
            return RealignSchedule::Ignored;
        };
        let Some(source) = tracks[i].sync_source() else {
            return RealignSchedule::Ignored;
        };
        if tracks[i].is_empty() {
            return RealignSchedule::Ignored;
        }

        if self.masters.is_out_master(track_id)
            && self.cfg().out_realign_mode == OutRealignMode::RestartExternal
        {
            self.pending_external_start = Some(track_id);
            return RealignSchedule::External;
        }
        if source == SyncSource::Track && self.masters.is_track_master(track_id) {
            return RealignSchedule::Ignored;
        }

        if self.cfg().realign_time != RealignTime::Now {
            let time = self.cfg().realign_time;
            self.realigns.retain(|r| r.track != track_id);
            self.realigns.push(PendingRealign {
                track: track_id,
                time,
            });
            return RealignSchedule::Pending;
        }

        let target = match source {
            SyncSource::Track => self
                .masters
                .track_sync_master
                .and_then(|id| find_track(tracks, id))
                .map(|m| tracks[m].frame()),
            _ => self.tracker(source).filter(|t| t.is_locked()).map(|t| {
                map_tracker_frame(
                    tracks[i].frame(),
                    tracks[i].frames(),
                    t.frame_at_offset(frame_offset),
                    t.get_loop_frames(),
                )
            }),
        };

        match target {
            Some(frame) => {
                tracks[i].set_frame(frame);
                RealignSchedule::Now {
                    frame: tracks[i].frame(),
                }
            }
            None => RealignSchedule::Ignored,
        }
    }

    fn realign_event<T: LoopTrack + ?Sized>(&mut self, pulse: &SyncPulse, track: &mut T) -> SyncOutcome {
        let id = track.id();
        let Some(position) = self.realigns.iter().position(|r| r.track == id) else {
            return SyncOutcome::None;
        };
        let time = self.realigns[position].time;
        let is_track = pulse.source == SyncSource::Track;

        let due = match time {
            RealignTime::Now => true,
            RealignTime::Beat if is_track => pulse.pulse_type >= PulseType::Subcycle,
            RealignTime::Bar if is_track => pulse.pulse_type >= PulseType::Cycle,
            RealignTime::Beat => pulse.is_beat_or_restart(),
            RealignTime::Bar => pulse.event_type.is_restart() || pulse.pulse_type.is_bar(),
            RealignTime::Start => {
                pulse.is_loop_start_point || pulse.event_type == SyncEventType::Start
            }
        };
        if !due {
            return SyncOutcome::None;
        }

        let target = if is_track {
            Some(pulse.pulse_number as i64)
        } else if pulse.event_type == SyncEventType::Start {
            Some(0)
        } else {
            self.tracker(pulse.source).filter(|t| t.is_locked()).map(|t| {
                map_tracker_frame(
                    track.frame(),
                    track.frames(),
                    t.frame_at_offset(pulse.frame_offset),
                    t.get_loop_frames(),
                )
            })
        };
        let Some(frame) = target else {
            return SyncOutcome::None;
        };

        self.realigns.swap_remove(position);
        track.set_frame(frame);
        self.diagnostics
            .debug(format_args!("{}: realigned to frame {}", id, track.frame()));
        SyncOutcome::Realigned {
            frame: track.frame(),
        }
    }

    pub fn has_pending_realign(&self, track_id: TrackId) -> bool {
        self.realigns.iter().any(|r| r.track == track_id)
    }

    // --- Functions -------------------------------------------------------------

    /// Run a sync-aware loop function for `track_id`
    pub fn invoke<T: LoopTrack>(
        &mut self,
        function: SyncFunction,
        track_id: TrackId,
        tracks: &mut [T],
        frame_offset: usize,
    ) -> FunctionOutcome {
        let Some(i) = find_track(tracks, track_id) else {
            return FunctionOutcome::Ignored;
        };
        let strategy = function.strategy();
        if strategy.needs_sync && tracks[i].sync_source().is_none() {
            return FunctionOutcome::Ignored;
        }
        self.diagnostics
            .trace(format_args!("{}: {}", track_id, strategy.name));

        match strategy.action {
            FunctionAction::RecordToggle => {
                let record = self.record_index(track_id).map(|r| self.records[r]);
                let recording = tracks[i].mode().is_recording();
                match record {
                    Some(r) if recording && r.stop_pending && function.auto_bars().is_some() => {
                        FunctionOutcome::RecordStop(self.extend_record_stop(&tracks[i]))
                    }
                    Some(r) if recording || r.waiting_start => FunctionOutcome::RecordStop(
                        self.schedule_record_stop(&tracks[i], SyncFunction::Record),
                    ),
                    _ if recording => FunctionOutcome::RecordStop(StopSchedule::Now),
                    _ => {
                        let start = self.schedule_record_start(&tracks[i], function);
                        if function.auto_bars().is_some() {
                            let stop = self.schedule_record_stop(&tracks[i], function);
                            FunctionOutcome::AutoRecord { start, stop }
                        } else {
                            FunctionOutcome::RecordStart(start)
                        }
                    }
                }
            }
            FunctionAction::UndoStop => match self.undo_record_stop(&tracks[i]) {
                Some(schedule) => FunctionOutcome::RecordStop(schedule),
                None => FunctionOutcome::Ignored,
            },
            FunctionAction::Realign { mute } => FunctionOutcome::Realign {
                schedule: self.realign(track_id, tracks, frame_offset),
                mute,
            },
            FunctionAction::ExternalStart => {
                if self.transport.get_tempo() <= 0.0 {
                    return FunctionOutcome::Ignored;
                }
                if tracks[i].is_empty() {
                    self.transport.start();
                    FunctionOutcome::TransportSent
                } else {
                    self.pending_external_start = Some(track_id);
                    FunctionOutcome::TransportScheduled
                }
            }
            FunctionAction::ExternalStop => {
                self.transport.stop(true, false);
                FunctionOutcome::TransportSent
            }
            FunctionAction::ForceCorrection => {
                let source = match tracks[i].sync_source() {
                    Some(SyncSource::Track) => self
                        .masters
                        .track_sync_master
                        .and_then(|id| find_track(tracks, id))
                        .and_then(|m| tracks[m].sync_source()),
                    other => other,
                };
                match source {
                    Some(source) if source.tracker_index().is_some() => {
                        self.force_drift_correction(source);
                        FunctionOutcome::CorrectionScheduled
                    }
                    _ => FunctionOutcome::Ignored,
                }
            }
        }
    }

    // --- Status ----------------------------------------------------------------

    fn publish_status(&self) {
        let smoothed = self.cfg().midi_tempo_mode == TempoEstimation::Smoothed;
        for tracker in &self.trackers {
            self.status.set_tracker(
                tracker.source(),
                TrackerSnapshot {
                    locked: tracker.is_locked(),
                    drift: tracker.get_drift(),
                    loop_frames: tracker.get_loop_frames(),
                    pulse: tracker.get_pulse(),
                    tempo: tracker.tempo(self.sample_rate, smoothed),
                },
            );
        }
        let bpb = self.cfg().beats_per_bar;
        self.status.set_out(
            self.transport.get_tempo(),
            self.transport.is_sending(),
            self.transport.is_started(),
            self.transport.get_beat(bpb),
            self.transport.get_bar(bpb),
            self.transport.starts(),
        );
        self.status.set_midi(
            self.midi.is_receiving_clocks(),
            self.midi.is_started(),
            self.source_tempo(SyncSource::Midi),
            self.midi.beat(bpb),
        );
        self.status.set_host(self.host.is_playing(), self.host.tempo());
        self.status
            .set_masters(self.masters.track_sync_master, self.masters.out_sync_master);
        self.status.finish_block();
    }

    pub fn status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    /// Handle for readers on other threads
    pub fn shared_status(&self) -> Arc<SharedSyncStatus> {
        self.status.clone()
    }

    pub fn masters(&self) -> MasterAssignment {
        self.masters
    }

    pub fn sync_tracker(&self, source: SyncSource) -> Option<&SyncTracker> {
        self.tracker(source)
    }

    pub fn sync_tracker_mut(&mut self, source: SyncSource) -> Option<&mut SyncTracker> {
        source.tracker_index().map(move |i| &mut self.trackers[i])
    }

    pub fn transport(&self) -> &ClockTransport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut ClockTransport {
        &mut self.transport
    }

    pub fn midi_queue(&self) -> &RealtimeEventQueue {
        &self.midi
    }

    pub fn config(&self) -> &SyncConfig {
        self.cfg()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Track currently iterating events, if any
    pub fn current_track(&self) -> Option<TrackId> {
        self.current
    }
}

/// Track frame matching a tracker position
///
/// A track shorter than the tracker loop wraps inside it; a longer one keeps
/// the tracker-loop iteration it is currently in.
fn map_tracker_frame(track_frame: i64, track_frames: i64, tracker_frame: f64, tracker_loop: i64) -> i64 {
    if track_frames <= 0 {
        return 0;
    }
    let tracker_frame = tracker_frame.round() as i64;
    if tracker_loop <= 0 || track_frames <= tracker_loop {
        return tracker_frame.rem_euclid(track_frames);
    }
    let base = (track_frame / tracker_loop) * tracker_loop;
    (base + tracker_frame).rem_euclid(track_frames)
}
