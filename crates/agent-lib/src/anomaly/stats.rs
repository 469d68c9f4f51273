//! Rolling sample statistics for z-score evaluation

use std::collections::VecDeque;

/// Default number of samples kept per rule (one hour at a 30s tick)
pub const DEFAULT_CAPACITY: usize = 120;

/// Bounded history of raw samples with mean and standard deviation
///
/// Statistics are recomputed with a two-pass algorithm after every push;
/// the history is small enough that this stays cheap.
#[derive(Debug, Clone)]
pub struct RollingStats {
    /// Current mean value
    pub mean: f64,
    /// Sample standard deviation (Bessel's correction)
    pub std_dev: f64,
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            mean: 0.0,
            std_dev: 0.0,
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.recalculate();
    }

    /// Z-score of `value` against the samples seen so far.
    ///
    /// `None` until `min_samples` (at least two) samples exist, or while
    /// the history has no spread.
    pub fn z_score(&self, value: f64, min_samples: usize) -> Option<f64> {
        if self.samples.len() < min_samples.max(2) {
            return None;
        }
        if self.std_dev < f64::EPSILON {
            return None;
        }
        Some((value - self.mean) / self.std_dev)
    }

    fn recalculate(&mut self) {
        let count = self.samples.len();
        if count == 0 {
            self.mean = 0.0;
            self.std_dev = 0.0;
            return;
        }

        self.mean = self.samples.iter().sum::<f64>() / count as f64;

        if count > 1 {
            let variance = self
                .samples
                .iter()
                .map(|v| (v - self.mean).powi(2))
                .sum::<f64>()
                / (count - 1) as f64;
            self.std_dev = variance.sqrt();
        } else {
            self.std_dev = 0.0;
        }
    }
}

impl Default for RollingStats {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
