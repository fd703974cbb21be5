// Module transport - outbound MIDI clock generation and control

pub mod clock;
pub mod generator;

pub use clock::{ClockTransport, clock_transport};
pub use generator::{ClockGenerator, ClockThread};
