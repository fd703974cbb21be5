// Diagnostics - trace filtering and counters shared by the sync components
//
// Every component receives an Arc<Diagnostics> at construction instead of
// consulting a process-wide trace level. Counters are atomics so they can be
// bumped from the MIDI thread, the clock thread and the audio callback.

use log::{Level, LevelFilter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Counter identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Pulse dropped because a realtime queue was full
    QueueOverflow,
    /// Event dropped because the per-block event pool was exhausted
    PoolExhausted,
    /// Relevant event left unconsumed at the end of a block
    UnconsumedEvent,
    /// Drift correction deferred to the next checkpoint
    DeferredCorrection,
    /// Drift correction applied
    Correction,
}

const COUNTER_COUNT: usize = 5;

/// Per-engine diagnostics context
#[derive(Debug)]
pub struct Diagnostics {
    target: &'static str,
    level: AtomicU8,
    counters: [AtomicU64; COUNTER_COUNT],
}

impl Diagnostics {
    /// Create a diagnostics context logging under `target`
    pub fn new(target: &'static str, level: LevelFilter) -> Arc<Self> {
        Arc::new(Self {
            target,
            level: AtomicU8::new(level as u8),
            counters: Default::default(),
        })
    }

    /// Log target used by this context
    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn level(&self) -> LevelFilter {
        match self.level.load(Ordering::Relaxed) {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// Check the local filter before formatting anything
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level()
    }

    /// Forward a message to the `log` facade if the local filter allows it
    pub fn log(&self, level: Level, args: std::fmt::Arguments<'_>) {
        if self.enabled(level) {
            log::log!(target: self.target, level, "{}", args);
        }
    }

    pub fn warn(&self, args: std::fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: std::fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: std::fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    pub fn trace(&self, args: std::fmt::Arguments<'_>) {
        self.log(Level::Trace, args);
    }

    /// Increment a counter, returns the new value
    pub fn bump(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn count(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            target: "loopsync",
            level: AtomicU8::new(LevelFilter::Info as u8),
            counters: Default::default(),
        }
    }
}
