// Sync module
// Pulse sources, drift tracking, master election and the per-block Synchronizer

pub mod function;
pub mod host;
pub mod master;
pub mod pool;
pub mod pulse;
pub mod record;
pub mod status;
pub mod synchronizer;
pub mod track;
pub mod tracker;

pub use function::{FunctionOutcome, RealignSchedule, SyncFunction};
pub use host::{HostTimeInfo, HostTransportMonitor};
pub use master::MasterAssignment;
pub use pulse::{PulseType, SyncEventType, SyncPulse, SyncSource};
pub use record::{RecordStart, StopSchedule};
pub use status::{SharedSyncStatus, SyncStatus};
pub use synchronizer::{RecordStopResult, SyncOutcome, Synchronizer};
pub use track::{LoopTrack, TrackId, TrackMode, VirtualTrack};
pub use tracker::SyncTracker;
