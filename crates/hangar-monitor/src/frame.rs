//! Frame-rate measurement for monitored applications.
//!
//! A [`FrameTimer`] is fed one timestamp per presented frame (from the
//! compositor's frame-swapped signal) and aggregates average, minimum,
//! maximum and jitter figures over a reporting period.

use std::time::{Duration, Instant};

/// Ignore implausible frame gaps above this (app was suspended, window
/// hidden).
const MAX_FRAME_GAP: Duration = Duration::from_secs(1);

/// Aggregated frame-rate figures for one reporting period.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameRate {
    /// Mean frames per second.
    pub average_fps: f64,
    /// Slowest observed instantaneous rate.
    pub minimum_fps: f64,
    /// Fastest observed instantaneous rate.
    pub maximum_fps: f64,
    /// Standard deviation of the instantaneous rates.
    pub jitter_fps: f64,
}

/// Accumulates frame timestamps and reports per-period statistics.
#[derive(Debug)]
pub struct FrameTimer {
    last_frame: Option<Instant>,
    intervals: Vec<Duration>,
}

impl FrameTimer {
    /// Create an idle timer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_frame: None,
            intervals: Vec::new(),
        }
    }

    /// Record one presented frame at "now".
    pub fn new_frame(&mut self) {
        self.new_frame_at(Instant::now());
    }

    /// Record one presented frame at an explicit timestamp (test mode).
    pub fn new_frame_at(&mut self, timestamp: Instant) {
        if let Some(last) = self.last_frame {
            let gap = timestamp.saturating_duration_since(last);
            if !gap.is_zero() && gap <= MAX_FRAME_GAP {
                self.intervals.push(gap);
            }
        }
        self.last_frame = Some(timestamp);
    }

    /// Number of measured frame intervals in the current period.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.intervals.len()
    }

    /// Compute the statistics for the current period and start a new one.
    #[must_use]
    pub fn report_and_reset(&mut self) -> FrameRate {
        let rate = self.report();
        self.intervals.clear();
        rate
    }

    /// Compute the statistics for the current period.
    #[must_use]
    pub fn report(&self) -> FrameRate {
        if self.intervals.is_empty() {
            return FrameRate::default();
        }
        let rates: Vec<f64> = self
            .intervals
            .iter()
            .map(|gap| 1.0 / gap.as_secs_f64())
            .collect();
        let count = rates.len() as f64;
        let average = rates.iter().sum::<f64>() / count;
        let minimum = rates.iter().copied().fold(f64::INFINITY, f64::min);
        let maximum = rates.iter().copied().fold(0.0f64, f64::max);
        let variance = rates
            .iter()
            .map(|r| (r - average) * (r - average))
            .sum::<f64>()
            / count;

        FrameRate {
            average_fps: average,
            minimum_fps: minimum,
            maximum_fps: maximum,
            jitter_fps: variance.sqrt(),
        }
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}
