// Module messaging - lock-free hand-off between threads

pub mod channels;
pub mod command;
