//! Action rate limiting and per-workload cooldown
//!
//! Process-local: each replica enforces its own budget. Pod remediation runs
//! on every replica, so the budgets bound the blast radius of one agent
//! rather than of the fleet.

use crate::policy::Policy;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

const GLOBAL_WINDOW: Duration = Duration::from_secs(10 * 60);
const WORKLOAD_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Why an action was held back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    Cooldown { remaining: Duration },
    WorkloadRate { limit: u32 },
    GlobalRate { limit: u32 },
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::Cooldown { remaining } => {
                write!(f, "cooldown active ({}s remaining)", remaining.as_secs())
            }
            Denial::WorkloadRate { limit } => {
                write!(f, "workload reached its limit of {limit} actions per hour")
            }
            Denial::GlobalRate { limit } => {
                write!(f, "agent reached its limit of {limit} actions per 10m")
            }
        }
    }
}

#[derive(Debug, Default)]
struct WorkloadHistory {
    recent: VecDeque<Instant>,
    last: Option<Instant>,
}

fn prune(times: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(t) = times.front() {
        if now.saturating_duration_since(*t) >= window {
            times.pop_front();
        } else {
            break;
        }
    }
}

/// Budgets for mutating remediation actions
#[derive(Debug)]
pub struct ActionLimiter {
    /// Zero disables the global budget
    global_limit: u32,
    global: Mutex<VecDeque<Instant>>,
    workloads: DashMap<String, WorkloadHistory>,
}

impl ActionLimiter {
    pub fn new(max_actions_per_10m: u32) -> Self {
        Self {
            global_limit: max_actions_per_10m,
            global: Mutex::new(VecDeque::new()),
            workloads: DashMap::new(),
        }
    }

    /// Check every budget for an action on `workload` and, if all allow it,
    /// record the action against them.
    pub fn try_acquire(&self, workload: &str, policy: Option<&Policy>) -> Result<(), Denial> {
        self.try_acquire_at(workload, policy, Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, workload: &str, policy: Option<&Policy>, now: Instant) -> Result<(), Denial> {
        let mut global = self.global.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut global, now, GLOBAL_WINDOW);

        let mut history = self.workloads.entry(workload.to_string()).or_default();
        prune(&mut history.recent, now, WORKLOAD_WINDOW);

        if let (Some(cooldown), Some(last)) = (policy.and_then(Policy::cooldown), history.last) {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < cooldown {
                return Err(Denial::Cooldown {
                    remaining: cooldown - elapsed,
                });
            }
        }

        let hourly = policy.map_or(0, |p| p.spec.safety.max_actions_per_hour);
        if hourly > 0 && history.recent.len() >= hourly as usize {
            return Err(Denial::WorkloadRate { limit: hourly });
        }

        if self.global_limit > 0 && global.len() >= self.global_limit as usize {
            return Err(Denial::GlobalRate {
                limit: self.global_limit,
            });
        }

        global.push_back(now);
        history.recent.push_back(now);
        history.last = Some(now);
        Ok(())
    }
}
