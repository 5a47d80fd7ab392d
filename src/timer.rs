//! Wall-clock interval accumulator for phase timing.
//!
//! Backed by [`Instant`], which is monotonic, so a long phase is not skewed by
//! clock adjustments made while it runs.

use std::time::{Duration, Instant};

/// Accumulates the elapsed time of `start()`/`end()` intervals.
#[derive(Debug, Default, Clone)]
pub struct Timer {
    started: Option<Instant>,
    total: Duration,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the reference instant for the next `end()`.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Add the time elapsed since the matching `start()`.
    ///
    /// Without a pending `start()` this adds nothing.
    pub fn end(&mut self) {
        if let Some(started) = self.started.take() {
            self.total += started.elapsed();
        }
    }

    /// Return the accumulated time in seconds and reset to zero.
    pub fn get(&mut self) -> f64 {
        let secs = self.total.as_secs_f64();
        self.clear();
        secs
    }

    /// Reset to zero without reading.
    pub fn clear(&mut self) {
        self.total = Duration::ZERO;
        self.started = None;
    }

    /// Accumulated time without resetting.
    pub fn peek(&self) -> Duration {
        self.total
    }
}
