// Master election - which track drives track sync and outbound clock tempo

use crate::sync::pulse::SyncSource;
use crate::sync::track::{LoopTrack, TrackId, TrackMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MasterAssignment {
    /// Supplies Subcycle/Cycle/Loop pulses to track-synced tracks
    pub track_sync_master: Option<TrackId>,
    /// Loop geometry determines the outbound clock tempo
    pub out_sync_master: Option<TrackId>,
}

impl MasterAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_track_master(&self, id: TrackId) -> bool {
        self.track_sync_master == Some(id)
    }

    pub fn is_out_master(&self, id: TrackId) -> bool {
        self.out_sync_master == Some(id)
    }

    /// Drop every role held by `id`
    pub fn release(&mut self, id: TrackId) {
        if self.track_sync_master == Some(id) {
            self.track_sync_master = None;
        }
        if self.out_sync_master == Some(id) {
            self.out_sync_master = None;
        }
    }

    pub fn clear(&mut self) {
        self.track_sync_master = None;
        self.out_sync_master = None;
    }

    /// Re-elect the track sync master, preferring the current holder
    pub fn elect_track_master<T: LoopTrack>(&mut self, tracks: &[T], exclude: Option<TrackId>) {
        self.track_sync_master =
            elect(tracks, self.track_sync_master, exclude, is_track_master_eligible);
    }

    /// Re-elect the out sync master, preferring the current holder
    pub fn elect_out_master<T: LoopTrack>(&mut self, tracks: &[T], exclude: Option<TrackId>) {
        self.out_sync_master = elect(tracks, self.out_sync_master, exclude, is_out_master_eligible);
    }
}

/// Non-empty content that is not being reset
pub fn is_track_master_eligible<T: LoopTrack + ?Sized>(track: &T) -> bool {
    !track.is_empty() && !matches!(track.mode(), TrackMode::Reset | TrackMode::Record | TrackMode::Synchronize)
}

/// Non-empty Out-synced content
pub fn is_out_master_eligible<T: LoopTrack + ?Sized>(track: &T) -> bool {
    track.sync_source() == Some(SyncSource::Out) && is_track_master_eligible(track)
}

fn elect<T: LoopTrack>(
    tracks: &[T],
    previous: Option<TrackId>,
    exclude: Option<TrackId>,
    eligible: fn(&T) -> bool,
) -> Option<TrackId> {
    let candidates = || tracks.iter().filter(|t| Some(t.id()) != exclude && eligible(*t));

    if let Some(previous) = previous {
        if candidates().any(|t| t.id() == previous) {
            return Some(previous);
        }
    }
    candidates().next().map(|t| t.id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::track::VirtualTrack;

    fn tracks() -> Vec<VirtualTrack> {
        vec![
            VirtualTrack::new(0, Some(SyncSource::Midi)),
            VirtualTrack::new(1, Some(SyncSource::Out)).with_loop(88200, 1),
            VirtualTrack::new(2, Some(SyncSource::Out)).with_loop(44100, 1),
        ]
    }

    #[test]
    fn test_elects_first_eligible() {
        let mut masters = MasterAssignment::new();
        let tracks = tracks();
        masters.elect_track_master(&tracks, None);
        masters.elect_out_master(&tracks, None);
        assert_eq!(masters.track_sync_master, Some(TrackId(1)));
        assert_eq!(masters.out_sync_master, Some(TrackId(1)));
    }

    #[test]
    fn test_prefers_previous_holder() {
        let mut masters = MasterAssignment {
            track_sync_master: Some(TrackId(2)),
            out_sync_master: Some(TrackId(2)),
        };
        let tracks = tracks();
        masters.elect_track_master(&tracks, None);
        masters.elect_out_master(&tracks, None);
        assert_eq!(masters.out_sync_master, Some(TrackId(2)));
        assert_eq!(masters.track_sync_master, Some(TrackId(2)));
    }

    #[test]
    fn test_reset_track_never_holds_a_role() {
        let mut masters = MasterAssignment::new();
        let mut tracks = tracks();
        masters.elect_out_master(&tracks, None);
        assert!(masters.is_out_master(TrackId(1)));

        tracks[1].reset();
        masters.elect_out_master(&tracks, None);
        assert_eq!(masters.out_sync_master, Some(TrackId(2)));

        tracks[2].reset();
        masters.elect_out_master(&tracks, None);
        masters.elect_track_master(&tracks, None);
        assert_eq!(masters, MasterAssignment::new());
    }

    #[test]
    fn test_exclude_and_release() {
        let mut masters = MasterAssignment::new();
        let tracks = tracks();
        masters.elect_out_master(&tracks, Some(TrackId(1)));
        assert_eq!(masters.out_sync_master, Some(TrackId(2)));

        masters.release(TrackId(2));
        assert_eq!(masters.out_sync_master, None);
    }
}
