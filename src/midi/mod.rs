// Module midi - realtime message parsing, clock queues and midir ports

pub mod event;
pub mod input;
pub mod output;
pub mod queue;
pub mod tempo;

pub use event::{RealtimeEvent, RealtimeMessage};
pub use queue::{RealtimeEventQueue, RealtimeProducer};
