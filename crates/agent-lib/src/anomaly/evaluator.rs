//! Periodic evaluation of policy anomaly rules
//!
//! Each rule's query is sampled once per tick. The sample is scored against
//! the rule's own history and then added to it. A rule fires once when it
//! has breached for `min_samples` consecutive ticks, and re-arms after the
//! first tick that does not breach.

use super::stats::{RollingStats, DEFAULT_CAPACITY};
use crate::health::{components, HealthRegistry};
use crate::integrations::Notifier;
use crate::leader::LeaderGate;
use crate::metrics::{MetricsError, MetricsProvider};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::policy::{AnomalyRule, Policy, PolicyStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Incident reason used for fired anomaly rules
pub const ANOMALY_REASON: &str = "Anomaly";

/// (namespace, policy, rule)
type RuleKey = (String, String, String);

#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    pub namespace: String,
    pub policy: String,
    pub rule: String,
    pub value: f64,
    pub z_score: f64,
}

#[derive(Debug, Default)]
struct RuleState {
    stats: RollingStats,
    streak: u32,
    fired: bool,
}

/// Breach streaks and sample history per rule
#[derive(Debug, Default)]
pub struct BreachTracker {
    rules: HashMap<RuleKey, RuleState>,
    capacity: usize,
}

impl BreachTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            rules: HashMap::new(),
            capacity,
        }
    }

    /// Record one sample; returns the z-score when this tick makes the rule fire
    pub fn observe(&mut self, key: RuleKey, rule: &AnomalyRule, value: f64) -> Option<f64> {
        let capacity = if self.capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            self.capacity
        };
        let state = self.rules.entry(key).or_insert_with(|| RuleState {
            stats: RollingStats::new(capacity),
            ..Default::default()
        });

        let z = state.stats.z_score(value, rule.min_samples as usize);
        state.stats.push(value);

        match z {
            Some(z) if z > rule.zscore_threshold => {
                state.streak += 1;
                if !state.fired && state.streak >= rule.min_samples.max(1) {
                    state.fired = true;
                    return Some(z);
                }
                None
            }
            _ => {
                state.streak = 0;
                state.fired = false;
                None
            }
        }
    }

    /// Drop history for rules not in `live`
    pub fn retain(&mut self, live: &HashSet<RuleKey>) {
        self.rules.retain(|key, _| live.contains(key));
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

pub struct AnomalyEvaluator {
    metrics: Arc<dyn MetricsProvider>,
    policies: Arc<PolicyStore>,
    notifier: Arc<dyn Notifier>,
    gate: Arc<LeaderGate>,
    counters: AgentMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
    interval: Duration,
    tracker: BreachTracker,
}

impl AnomalyEvaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metrics: Arc<dyn MetricsProvider>,
        policies: Arc<PolicyStore>,
        notifier: Arc<dyn Notifier>,
        gate: Arc<LeaderGate>,
        counters: AgentMetrics,
        logger: StructuredLogger,
        health: HealthRegistry,
        interval: Duration,
    ) -> Self {
        Self {
            metrics,
            policies,
            notifier,
            gate,
            counters,
            logger,
            health,
            interval,
            tracker: BreachTracker::new(DEFAULT_CAPACITY),
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Starting anomaly evaluator");
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.gate.is_leader() {
                        self.evaluate().await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down anomaly evaluator");
                    break;
                }
            }
        }
    }

    /// Sample every rule once and escalate rules that fire
    pub async fn evaluate(&mut self) -> Vec<Firing> {
        let mut live = HashSet::new();
        let mut firings = Vec::new();
        let mut backend_error = None;

        for namespace in self.policies.namespaces() {
            for policy in self.policies.list(&namespace) {
                for rule in &policy.spec.anomalies {
                    if rule.name.is_empty() || rule.promql.is_empty() {
                        continue;
                    }
                    let key = (namespace.clone(), policy.name.clone(), rule.name.clone());
                    live.insert(key.clone());

                    let value = match self.metrics.query_instant(&rule.promql).await {
                        Ok(v) => v,
                        Err(e) => {
                            debug!(policy = %policy.name, rule = %rule.name, error = %e, "Anomaly query failed");
                            if matches!(e, MetricsError::Http(_) | MetricsError::InvalidResponse(_)) {
                                backend_error = Some(e.to_string());
                            }
                            continue;
                        }
                    };

                    if let Some(z_score) = self.tracker.observe(key, rule, value) {
                        let firing = Firing {
                            namespace: namespace.clone(),
                            policy: policy.name.clone(),
                            rule: rule.name.clone(),
                            value,
                            z_score,
                        };
                        self.escalate(&policy, &firing).await;
                        firings.push(firing);
                    }
                }
            }
        }

        self.tracker.retain(&live);

        match backend_error {
            Some(message) => self.health.set_degraded(components::ANOMALY, message).await,
            None => self.health.set_healthy(components::ANOMALY).await,
        }
        firings
    }

    async fn escalate(&self, policy: &Policy, firing: &Firing) {
        self.logger.log_anomaly(
            &firing.namespace,
            &firing.policy,
            &firing.rule,
            firing.value,
            firing.z_score,
        );
        self.counters
            .increment_incident(ANOMALY_REASON, &firing.namespace, &firing.policy);

        let text = format!(
            "*Anomaly* `{}` in `{}` (policy `{}`): value {:.3}, z-score {:.2}",
            firing.rule, firing.namespace, firing.policy, firing.value, firing.z_score
        );
        let channel = Some(policy.spec.escalation.slack_channel.as_str()).filter(|c| !c.is_empty());
        if let Err(e) = self.notifier.post(&text, channel).await {
            warn!(error = %e, "Failed to post anomaly notification");
        }
    }
}
