//! Pod and node failure remediation
//!
//! This module provides:
//! - Classification of pod container states and node pressure conditions
//! - The per-incident remediation state machine with mode downgrades
//! - Action rate limiting and cooldowns
//! - Memory limit recommendations for OOM kills
//! - Watch loops that feed updates into the remediators

mod classifier;
mod handler;
mod limiter;
mod memory;
mod node;
mod watch;

pub use classifier::{classify_pod, is_critical, is_unschedulable, node_pressure, Classification};
pub use handler::{Outcome, PodRemediator, RemediationSettings};
pub use limiter::{ActionLimiter, Denial};
pub use memory::{parse_memory, MemoryRecommendation};
pub use node::{NodeOutcome, NodeRemediator, EVICTION_GRACE_SECONDS, NODE_SCOPE};
pub use watch::{NodeWatch, PodWatch, DEFAULT_MAX_IN_FLIGHT};
