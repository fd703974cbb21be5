// Tempo monitor - estimates BPM from MIDI clock intervals

use crate::config::TempoEstimation;
use crate::midi::event::CLOCKS_PER_BEAT;

/// Number of clock intervals averaged (one beat)
const WINDOW: usize = CLOCKS_PER_BEAT as usize;

/// Intervals longer than this are treated as a gap, not a tempo
const MAX_INTERVAL_US: u64 = 250_000;

/// Smoothed tempo only follows changes larger than this (BPM)
const SMOOTHING_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct TempoMonitor {
    intervals: [u64; WINDOW],
    count: usize,
    next: usize,
    total: u64,
    last_timestamp: Option<u64>,
    smooth_tempo: f64,
}

impl TempoMonitor {
    pub fn new() -> Self {
        Self {
            intervals: [0; WINDOW],
            count: 0,
            next: 0,
            total: 0,
            last_timestamp: None,
            smooth_tempo: 0.0,
        }
    }

    /// Record a clock received at `timestamp_us`
    pub fn clock(&mut self, timestamp_us: u64) {
        if let Some(last) = self.last_timestamp {
            let interval = timestamp_us.saturating_sub(last);
            if interval > 0 && interval <= MAX_INTERVAL_US {
                self.push(interval);
            }
        }
        self.last_timestamp = Some(timestamp_us);
    }

    fn push(&mut self, interval: u64) {
        if self.count == WINDOW {
            self.total -= self.intervals[self.next];
        } else {
            self.count += 1;
        }
        self.intervals[self.next] = interval;
        self.total += interval;
        self.next = (self.next + 1) % WINDOW;

        let average = self.average_tempo();
        if self.smooth_tempo == 0.0 || (average - self.smooth_tempo).abs() > SMOOTHING_THRESHOLD {
            self.smooth_tempo = (average * 10.0).round() / 10.0;
        }
    }

    /// Forget the interval history, used after Start/Continue and long gaps
    pub fn restart(&mut self) {
        self.intervals = [0; WINDOW];
        self.count = 0;
        self.next = 0;
        self.total = 0;
        self.last_timestamp = None;
    }

    /// Full reset including the smoothed value
    pub fn reset(&mut self) {
        self.restart();
        self.smooth_tempo = 0.0;
    }

    /// Average microseconds per clock, 0 when unknown
    pub fn average_interval_us(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total as f64 / self.count as f64
        }
    }

    pub fn average_tempo(&self) -> f64 {
        let interval = self.average_interval_us();
        if interval <= 0.0 {
            0.0
        } else {
            60_000_000.0 / (interval * CLOCKS_PER_BEAT as f64)
        }
    }

    pub fn smooth_tempo(&self) -> f64 {
        self.smooth_tempo
    }

    pub fn tempo(&self, mode: TempoEstimation) -> f64 {
        match mode {
            TempoEstimation::Average => self.average_tempo(),
            TempoEstimation::Smoothed => self.smooth_tempo(),
        }
    }

    pub fn samples(&self) -> usize {
        self.count
    }
}

impl Default for TempoMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(monitor: &mut TempoMonitor, bpm: f64, clocks: u64, start_us: u64) -> u64 {
        let interval = 60_000_000.0 / (bpm * 24.0);
        let mut last = start_us;
        for i in 0..clocks {
            last = start_us + (i as f64 * interval).round() as u64;
            monitor.clock(last);
        }
        last
    }

    #[test]
    fn test_steady_tempo() {
        let mut monitor = TempoMonitor::new();
        feed(&mut monitor, 120.0, 25, 0);

        assert_eq!(monitor.samples(), 24);
        assert!((monitor.average_tempo() - 120.0).abs() < 0.01);
        assert_eq!(monitor.smooth_tempo(), 120.0);
    }

    #[test]
    fn test_smoothing_ignores_small_jitter() {
        let mut monitor = TempoMonitor::new();
        let last = feed(&mut monitor, 120.0, 25, 0);

        // A single late clock moves the average only slightly
        monitor.clock(last + 20_900);
        assert!(monitor.average_tempo() < 120.0);
        assert_eq!(monitor.smooth_tempo(), 120.0);
    }

    #[test]
    fn test_smoothing_follows_real_change() {
        let mut monitor = TempoMonitor::new();
        let last = feed(&mut monitor, 120.0, 25, 0);
        feed(&mut monitor, 100.0, 30, last + 25_000);

        assert!((monitor.smooth_tempo() - 100.0).abs() < 0.15);
        assert_eq!(monitor.tempo(TempoEstimation::Smoothed), monitor.smooth_tempo());
    }

    #[test]
    fn test_gap_is_not_a_tempo() {
        let mut monitor = TempoMonitor::new();
        monitor.clock(0);
        monitor.clock(2_000_000);
        assert_eq!(monitor.samples(), 0);
        assert_eq!(monitor.average_tempo(), 0.0);
    }

    #[test]
    fn test_restart_keeps_smooth_tempo() {
        let mut monitor = TempoMonitor::new();
        feed(&mut monitor, 90.0, 25, 0);
        monitor.restart();
        assert_eq!(monitor.samples(), 0);
        assert_eq!(monitor.smooth_tempo(), 90.0);

        monitor.reset();
        assert_eq!(monitor.smooth_tempo(), 0.0);
    }
}
