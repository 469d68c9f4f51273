//! Observability infrastructure for the remediation agent
//!
//! Provides:
//! - Prometheus audit counters (actions taken, incidents detected)
//! - Structured JSON logging of agent decisions with tracing

use prometheus::{IntCounterVec, Opts, Registry};
use tracing::{info, warn};

/// Mutating actions recorded in `auto_agent_actions_total`
pub mod actions {
    pub const DELETE_POD: &str = "delete_pod";
    pub const EVICT_POD: &str = "evict_pod";
    pub const CORDON_NODE: &str = "cordon_node";
    pub const SCALE_UP: &str = "scale_up";
    pub const SCALE_DOWN: &str = "scale_down";
}

/// Audit counters for Prometheus exposition
///
/// Owns a private registry so independent instances never collide; clones
/// share the same underlying counters.
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    actions_total: IntCounterVec,
    incidents_total: IntCounterVec,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let actions_total = IntCounterVec::new(
            Opts::new(
                "auto_agent_actions_total",
                "Remediation and scaling actions executed by the agent",
            ),
            &["type", "namespace", "workload"],
        )
        .expect("static metric definition for actions_total");

        let incidents_total = IntCounterVec::new(
            Opts::new(
                "auto_agent_incidents_total",
                "Incidents classified by the agent, whether or not an action fired",
            ),
            &["reason", "namespace", "workload"],
        )
        .expect("static metric definition for incidents_total");

        registry
            .register(Box::new(actions_total.clone()))
            .expect("actions_total registered once per registry");
        registry
            .register(Box::new(incidents_total.clone()))
            .expect("incidents_total registered once per registry");

        Self {
            registry,
            actions_total,
            incidents_total,
        }
    }

    /// Registry to expose on the metrics endpoint
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count one executed action
    pub fn increment_action(&self, kind: &str, namespace: &str, workload: &str) {
        self.actions_total
            .with_label_values(&[kind, namespace, workload])
            .inc();
    }

    /// Count one classified incident
    pub fn increment_incident(&self, reason: &str, namespace: &str, workload: &str) {
        self.incidents_total
            .with_label_values(&[reason, namespace, workload])
            .inc();
    }

    pub fn action_count(&self, kind: &str, namespace: &str, workload: &str) -> u64 {
        self.actions_total
            .with_label_values(&[kind, namespace, workload])
            .get()
    }

    pub fn incident_count(&self, reason: &str, namespace: &str, workload: &str) -> u64 {
        self.incidents_total
            .with_label_values(&[reason, namespace, workload])
            .get()
    }

    /// Sum of all action counters, across every label set
    pub fn total_actions(&self) -> u64 {
        sum_counter(&self.registry, "auto_agent_actions_total")
    }

    /// Sum of all incident counters, across every label set
    pub fn total_incidents(&self) -> u64 {
        sum_counter(&self.registry, "auto_agent_incidents_total")
    }
}

fn sum_counter(registry: &Registry, name: &str) -> u64 {
    registry
        .gather()
        .iter()
        .filter(|family| family.get_name() == name)
        .flat_map(|family| family.get_metric().iter())
        .map(|m| m.get_counter().get_value() as u64)
        .sum()
}

/// Structured logger for agent decisions
///
/// Keeps field names consistent across the remediation, scaling and anomaly
/// paths so log queries can join on them.
#[derive(Clone)]
pub struct StructuredLogger {
    identity: String,
}

impl StructuredLogger {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    pub fn log_incident(
        &self,
        namespace: &str,
        workload: &str,
        pod: &str,
        container: &str,
        reason: &str,
        location: &str,
    ) {
        warn!(
            event = "incident_detected",
            agent = %self.identity,
            namespace = %namespace,
            workload = %workload,
            pod = %pod,
            container = %container,
            reason = %reason,
            location = %location,
            "Incident detected"
        );
    }

    pub fn log_action(&self, action: &str, namespace: &str, workload: &str, target: &str) {
        info!(
            event = "action_taken",
            agent = %self.identity,
            action = %action,
            namespace = %namespace,
            workload = %workload,
            target = %target,
            "Remediation action executed"
        );
    }

    /// An action that fix mode would have taken but a safety rail held back
    pub fn log_suppressed(&self, action: &str, namespace: &str, workload: &str, why: &str) {
        info!(
            event = "action_suppressed",
            agent = %self.identity,
            action = %action,
            namespace = %namespace,
            workload = %workload,
            suppressed_by = %why,
            "Remediation action suppressed"
        );
    }

    pub fn log_scale_decision(
        &self,
        namespace: &str,
        deployment: &str,
        from: i32,
        to: i32,
        cpu: f64,
        gate_ok: bool,
    ) {
        info!(
            event = "scale_decision",
            agent = %self.identity,
            namespace = %namespace,
            deployment = %deployment,
            from_replicas = from,
            to_replicas = to,
            cpu = cpu,
            gate_ok = gate_ok,
            "Scaling decision applied"
        );
    }

    pub fn log_anomaly(&self, namespace: &str, policy: &str, rule: &str, value: f64, z_score: f64) {
        warn!(
            event = "anomaly_detected",
            agent = %self.identity,
            namespace = %namespace,
            policy = %policy,
            rule = %rule,
            value = value,
            z_score = z_score,
            "Sustained anomaly detected"
        );
    }

    pub fn log_leadership(&self, leader: bool) {
        info!(
            event = "leadership_changed",
            agent = %self.identity,
            leader = leader,
            "Leadership changed"
        );
    }

    pub fn log_startup(&self, version: &str, mode: &str) {
        info!(
            event = "agent_started",
            agent = %self.identity,
            agent_version = %version,
            mode = %mode,
            "Remediation agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            agent = %self.identity,
            reason = %reason,
            "Remediation agent shutting down"
        );
    }
}
