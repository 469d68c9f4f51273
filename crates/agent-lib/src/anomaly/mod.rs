//! Anomaly detection over policy-declared metric queries
//!
//! Each rule keeps a rolling history of raw samples; the agent scores new
//! samples against it and escalates breaches that persist across ticks.

mod evaluator;
mod stats;

pub use evaluator::{AnomalyEvaluator, BreachTracker, Firing, ANOMALY_REASON};
pub use stats::{RollingStats, DEFAULT_CAPACITY};
