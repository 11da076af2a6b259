//! Smoothed transfer-rate estimation
//!
//! Fed by the controller's supervisor loop with cumulative byte counts;
//! produces an exponentially smoothed bytes-per-second figure.

use std::time::Instant;

const SMOOTHING_FACTOR: f64 = 0.05;

/// Exponentially smoothed byte-rate tracker
pub struct SpeedTracker {
    rate: f64,
    last_bytes: u64,
    last_time: Instant,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self {
            rate: 0.0,
            last_bytes: 0,
            last_time: Instant::now(),
        }
    }

    /// Fold a new cumulative sample into the smoothed rate.
    ///
    /// Returns the updated rate in bytes per second.
    pub fn update(&mut self, bytes_now: u64) -> u64 {
        self.update_at(Instant::now(), bytes_now)
    }

    fn update_at(&mut self, now: Instant, bytes_now: u64) -> u64 {
        let elapsed = now.duration_since(self.last_time).as_secs_f64();
        if elapsed <= 0.0 {
            return self.rate as u64;
        }
        let new_bytes = bytes_now.saturating_sub(self.last_bytes);
        let new_rate = new_bytes as f64 / elapsed;
        self.rate = SMOOTHING_FACTOR * new_rate + (1.0 - SMOOTHING_FACTOR) * self.rate;
        self.last_bytes = bytes_now;
        self.last_time = now;
        self.rate as u64
    }

    /// Current smoothed rate in bytes per second
    pub fn speed(&self) -> u64 {
        self.rate as u64
    }

    /// Zero the rate, for terminal transfer states
    pub fn reset(&mut self) {
        self.rate = 0.0;
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}
