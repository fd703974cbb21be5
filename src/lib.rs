// loopsync - Library exports for the demo, tests and benchmarks

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod messaging;
pub mod midi;
pub mod sync;
pub mod transport;

// Re-export commonly used types for convenience
pub use config::SyncConfig;
pub use diagnostics::{Counter, Diagnostics};
pub use error::SyncError;
pub use messaging::command::{ConfigPublisher, ConfigReceiver, config_channel};
pub use midi::output::{CaptureSink, MidiSink, NullSink, open_output};
pub use midi::queue::{RealtimeEventQueue, RealtimeProducer};
pub use sync::{
    HostTimeInfo, LoopTrack, PulseType, SyncEventType, SyncFunction, SyncOutcome, SyncPulse,
    SyncSource, SyncStatus, Synchronizer, TrackId, TrackMode, VirtualTrack,
};
pub use transport::{ClockThread, ClockTransport, clock_transport};
