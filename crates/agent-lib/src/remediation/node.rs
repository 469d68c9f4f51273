//! Node pressure handling: cordon, then drain non-critical pods
//!
//! Every replica observes node updates, so each step must be safe to repeat:
//! cordoning a cordoned node is skipped, and evicting a pod that is already
//! gone succeeds.

use super::classifier::{is_critical, is_unschedulable, node_pressure};
use crate::cluster::ClusterOps;
use crate::escalation::{EscalationPipeline, Notice};
use crate::models::{IncidentReason, IncidentRecord, Mode, Workload};
use crate::observability::{actions, AgentMetrics, StructuredLogger};
use chrono::Utc;
use dashmap::DashSet;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Grace period given to pods evicted from a node under pressure
pub const EVICTION_GRACE_SECONDS: u32 = 30;

/// Namespace label used for node-scoped incidents and actions
pub const NODE_SCOPE: &str = "cluster";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutcome {
    pub pressure: Vec<&'static str>,
    pub cordoned: bool,
    pub evicted: Vec<String>,
    pub skipped_critical: Vec<String>,
    pub failed: Vec<String>,
}

pub struct NodeRemediator {
    cluster: Arc<dyn ClusterOps>,
    pipeline: Arc<EscalationPipeline>,
    counters: AgentMetrics,
    logger: StructuredLogger,
    mode: Mode,
    /// Nodes already reported in observe or suggest mode, until pressure clears
    reported: DashSet<String>,
}

impl NodeRemediator {
    pub fn new(
        cluster: Arc<dyn ClusterOps>,
        pipeline: Arc<EscalationPipeline>,
        counters: AgentMetrics,
        logger: StructuredLogger,
        mode: Mode,
    ) -> Self {
        Self {
            cluster,
            pipeline,
            counters,
            logger,
            mode,
            reported: DashSet::new(),
        }
    }

    pub async fn handle(&self, node: &Node) -> Option<NodeOutcome> {
        let name = node.name_any();
        let pressure = node_pressure(node);
        if pressure.is_empty() {
            self.reported.remove(&name);
            return None;
        }

        let mut outcome = NodeOutcome {
            pressure,
            ..Default::default()
        };

        if self.mode != Mode::Fix {
            if !self.reported.insert(name.clone()) {
                return None;
            }
            let text = format!(
                "*NodePressure* on node `{name}` ({}).\n_Suggest_: cordon the node and evict non-critical pods.\n",
                outcome.pressure.join(", ")
            );
            self.record(&name, &outcome, text).await;
            return Some(outcome);
        }

        let workload = Workload::new("node", &name).slug();
        if !is_unschedulable(node) {
            match self.cluster.cordon_node(&name).await {
                Ok(()) => {
                    outcome.cordoned = true;
                    self.counters
                        .increment_action(actions::CORDON_NODE, NODE_SCOPE, &workload);
                    self.logger
                        .log_action(actions::CORDON_NODE, NODE_SCOPE, &workload, &name);
                }
                Err(e) => warn!(node = %name, error = %e, "Failed to cordon node"),
            }
        }

        let pods = match self.cluster.pods_on_node(&name).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(node = %name, error = %e, "Failed to list pods on node");
                Vec::new()
            }
        };

        for pod in &pods {
            let namespace = pod.namespace().unwrap_or_default();
            let pod_name = pod.name_any();
            if is_critical(pod) {
                outcome.skipped_critical.push(format!("{namespace}/{pod_name}"));
                continue;
            }
            if pod.metadata.deletion_timestamp.is_some() {
                debug!(pod = %pod_name, "Pod already terminating, not evicting again");
                continue;
            }

            let owner = Workload::of_pod(pod).slug();
            match self
                .cluster
                .evict_pod(&namespace, &pod_name, EVICTION_GRACE_SECONDS)
                .await
            {
                Ok(()) => {
                    self.counters
                        .increment_action(actions::EVICT_POD, &namespace, &owner);
                    self.logger
                        .log_action(actions::EVICT_POD, &namespace, &owner, &pod_name);
                    outcome.evicted.push(format!("{namespace}/{pod_name}"));
                }
                Err(e) => {
                    warn!(pod = %pod_name, namespace = %namespace, error = %e, "Eviction refused");
                    outcome.failed.push(format!("{namespace}/{pod_name}"));
                }
            }
        }

        if outcome.cordoned {
            let mut text = format!(
                "*NodePressure*: cordoned node `{name}` ({}).\n_Action_: evicted {} pod(s), kept {} critical pod(s).\n",
                outcome.pressure.join(", "),
                outcome.evicted.len(),
                outcome.skipped_critical.len()
            );
            if !outcome.failed.is_empty() {
                text.push_str(&format!("_Eviction refused_: {}\n", outcome.failed.join(", ")));
            }
            self.record(&name, &outcome, text).await;
        }

        Some(outcome)
    }

    async fn record(&self, name: &str, outcome: &NodeOutcome, text: String) {
        let workload = Workload::new("node", name).slug();
        let mut extras = BTreeMap::new();
        extras.insert("conditions".to_string(), outcome.pressure.join(","));
        if outcome.cordoned {
            extras.insert("evicted".to_string(), outcome.evicted.len().to_string());
        }
        let record = IncidentRecord {
            timestamp: Utc::now(),
            namespace: NODE_SCOPE.to_string(),
            workload: workload.clone(),
            pod: name.to_string(),
            container: String::new(),
            node: name.to_string(),
            reason: IncidentReason::NodePressure,
            message: format!("Node under {}", outcome.pressure.join(" and ")),
            last_logs: String::new(),
            events: Vec::new(),
            extras,
        };

        let location = self.pipeline.persist(&record).await;
        self.pipeline
            .publish(Notice {
                record: &record,
                workload: &workload,
                text: format!("{text}Saved: `{location}`\n"),
                advisory: None,
                policy: None,
            })
            .await;
    }
}
