//! Leader-gated scaling control loop
//!
//! Every tick, each Deployment in the allow-listed namespaces is evaluated
//! against a primary CPU signal and optional secondary demand signals.
//! Cooldowns live in annotations on the Deployment itself, and updates
//! carry the listed `resourceVersion`, so replicas racing on one workload
//! cannot both act: the loser sees a conflict and waits for the next tick.

use crate::cluster::ClusterOps;
use crate::health::{components, HealthRegistry};
use crate::integrations::Notifier;
use crate::leader::LeaderGate;
use crate::metrics::{render_query, MetricsProvider};
use crate::models::Workload;
use crate::observability::{actions, AgentMetrics, StructuredLogger};
use crate::policy::{Policy, PolicyStore};
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Annotation recording the last scale-up, RFC3339 UTC
pub const LAST_SCALE_UP_ANNOTATION: &str = "auto-agent.io/last-scale-ts";
/// Annotation recording the last scale-down, RFC3339 UTC
pub const LAST_SCALE_DOWN_ANNOTATION: &str = "auto-agent.io/last-scale-down-ts";

#[derive(Debug, Clone)]
pub struct ScalingSettings {
    pub namespaces: Vec<String>,
    pub cpu_threshold: f64,
    pub scale_down_threshold: f64,
    /// Range window of the CPU query, e.g. `5m`
    pub window: String,
    pub max_step: i32,
    pub cooldown_up: Duration,
    pub cooldown_down: Duration,
    /// Secondary demand queries; `$namespace` and `$workload` are substituted
    pub gate_queries: Vec<String>,
    /// Leave HorizontalPodAutoscaler targets alone unless a policy overrides
    pub respect_hpa: bool,
    pub interval: Duration,
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            cpu_threshold: 0.8,
            scale_down_threshold: 0.3,
            window: "5m".to_string(),
            max_step: 2,
            cooldown_up: Duration::from_secs(2 * 60),
            cooldown_down: Duration::from_secs(10 * 60),
            gate_queries: Vec::new(),
            respect_hpa: true,
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    HpaManaged,
    UpCooldown,
    DownCooldown,
    NoMetrics,
    NotLeader,
    LostRace,
    Failed,
}

/// Result of evaluating one Deployment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Skip(SkipReason),
    Hold,
    ScaleUp { from: i32, to: i32 },
    ScaleDown { from: i32, to: i32 },
}

fn within_cooldown(annotations: &BTreeMap<String, String>, key: &str, cooldown: Duration, now: DateTime<Utc>) -> bool {
    let Some(last) = annotations
        .get(key)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
    else {
        return false;
    };
    let elapsed = now.signed_duration_since(last.with_timezone(&Utc));
    chrono::Duration::from_std(cooldown).map_or(true, |c| elapsed < c)
}

/// Signals measured for one Deployment during a tick
#[derive(Debug, Clone, Copy)]
struct Signals {
    cpu: f64,
    gate_ok: bool,
}

pub struct Scaler {
    cluster: Arc<dyn ClusterOps>,
    metrics: Arc<dyn MetricsProvider>,
    policies: Arc<PolicyStore>,
    notifier: Arc<dyn Notifier>,
    gate: Arc<LeaderGate>,
    counters: AgentMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
    settings: ScalingSettings,
}

impl Scaler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: Arc<dyn ClusterOps>,
        metrics: Arc<dyn MetricsProvider>,
        policies: Arc<PolicyStore>,
        notifier: Arc<dyn Notifier>,
        gate: Arc<LeaderGate>,
        counters: AgentMetrics,
        logger: StructuredLogger,
        health: HealthRegistry,
        settings: ScalingSettings,
    ) -> Self {
        Self {
            cluster,
            metrics,
            policies,
            notifier,
            gate,
            counters,
            logger,
            health,
            settings,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            namespaces = self.settings.namespaces.len(),
            "Starting scaling loop"
        );
        let mut ticker = tokio::time::interval(self.settings.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.gate.is_leader() {
                        self.tick().await;
                    } else {
                        debug!("Not leader, skipping scaling tick");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down scaling loop");
                    break;
                }
            }
        }
    }

    /// Evaluate every Deployment once; returns `namespace/name` and its decision
    pub async fn tick(&self) -> Vec<(String, Decision)> {
        let mut decisions = Vec::new();
        let mut failures = Vec::new();

        for namespace in &self.settings.namespaces {
            let deployments = match self.cluster.list_deployments(namespace).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "Failed to list deployments");
                    failures.push(format!("{namespace}: {e}"));
                    continue;
                }
            };
            let hpa_targets = if self.settings.respect_hpa {
                match self.cluster.hpa_targets(namespace).await {
                    Ok(targets) => targets,
                    Err(e) => {
                        // Unknown HPA ownership: acting could fight another autoscaler
                        warn!(namespace = %namespace, error = %e, "Failed to list autoscalers, skipping namespace");
                        failures.push(format!("{namespace}: {e}"));
                        continue;
                    }
                }
            } else {
                HashSet::new()
            };

            for deployment in deployments {
                let name = deployment.name_any();
                let policy = self
                    .policies
                    .first_match(namespace, &template_labels(&deployment));
                let (decision, signals) = self
                    .decide(namespace, &deployment, policy.as_ref(), &hpa_targets, Utc::now())
                    .await;
                let decision = match (decision, signals) {
                    (Decision::ScaleUp { .. } | Decision::ScaleDown { .. }, Some(signals)) => {
                        self.apply(namespace, &deployment, policy.as_ref(), decision, signals)
                            .await
                    }
                    (other, _) => other,
                };
                decisions.push((format!("{namespace}/{name}"), decision));
            }
        }

        if failures.is_empty() {
            self.health.set_healthy(components::SCALER).await;
        } else {
            self.health
                .set_degraded(components::SCALER, failures.join("; "))
                .await;
        }
        decisions
    }

    /// True when any secondary signal shows demand, or none is configured
    async fn gate_ok(&self, namespace: &str, deployment: &str) -> bool {
        if self.settings.gate_queries.is_empty() {
            return true;
        }
        for template in &self.settings.gate_queries {
            let query = render_query(template, namespace, deployment);
            match self.metrics.query_instant(&query).await {
                Ok(v) if v > 0.0 => return true,
                Ok(_) => {}
                Err(e) => debug!(query = %query, error = %e, "Secondary signal unavailable"),
            }
        }
        false
    }

    async fn decide(
        &self,
        namespace: &str,
        deployment: &Deployment,
        policy: Option<&Policy>,
        hpa_targets: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> (Decision, Option<Signals>) {
        let name = deployment.name_any();
        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let scale = policy.map(|p| &p.spec.actions.scale);

        if scale.is_some_and(|s| s.enabled == Some(false)) {
            return (Decision::Skip(SkipReason::Disabled), None);
        }
        if hpa_targets.contains(&name) && !scale.is_some_and(|s| s.enabled == Some(true) && s.allow_hpa_override) {
            debug!(deployment = %name, "Managed by a HorizontalPodAutoscaler");
            return (Decision::Skip(SkipReason::HpaManaged), None);
        }

        let annotations = deployment.annotations();
        if within_cooldown(annotations, LAST_SCALE_UP_ANNOTATION, self.settings.cooldown_up, now) {
            return (Decision::Skip(SkipReason::UpCooldown), None);
        }

        let cpu = match self
            .metrics
            .avg_cpu(namespace, &name, &self.settings.window)
            .await
        {
            Ok(cpu) => cpu,
            Err(e) => {
                debug!(deployment = %name, error = %e, "No CPU signal, skipping");
                return (Decision::Skip(SkipReason::NoMetrics), None);
            }
        };
        let gate_ok = self.gate_ok(namespace, &name).await;
        let signals = Some(Signals { cpu, gate_ok });

        if cpu > self.settings.cpu_threshold && gate_ok {
            let base = scale.map(|s| s.step).filter(|s| *s > 0).unwrap_or(1);
            let step = base.min(self.settings.max_step).max(1);
            let mut to = replicas + step;
            if let Some(max) = scale.map(|s| s.max_replicas).filter(|m| *m > 0) {
                to = to.min(max);
            }
            let decision = if to > replicas {
                Decision::ScaleUp { from: replicas, to }
            } else {
                Decision::Hold
            };
            return (decision, signals);
        }

        if within_cooldown(annotations, LAST_SCALE_DOWN_ANNOTATION, self.settings.cooldown_down, now) {
            return (Decision::Skip(SkipReason::DownCooldown), signals);
        }
        if replicas > 1 && cpu < self.settings.scale_down_threshold && !gate_ok {
            let floor = scale.map(|s| s.min_replicas).filter(|m| *m > 0).unwrap_or(1);
            let to = replicas - 1;
            let decision = if to >= floor {
                Decision::ScaleDown { from: replicas, to }
            } else {
                Decision::Hold
            };
            return (decision, signals);
        }
        (Decision::Hold, signals)
    }

    async fn apply(
        &self,
        namespace: &str,
        deployment: &Deployment,
        policy: Option<&Policy>,
        decision: Decision,
        signals: Signals,
    ) -> Decision {
        let (from, to, annotation, action, label) = match decision {
            Decision::ScaleUp { from, to } => (from, to, LAST_SCALE_UP_ANNOTATION, actions::SCALE_UP, "ScaleUp"),
            Decision::ScaleDown { from, to } => (from, to, LAST_SCALE_DOWN_ANNOTATION, actions::SCALE_DOWN, "ScaleDown"),
            other => return other,
        };

        // Leadership may have moved while metrics were queried
        if !self.gate.is_leader() {
            return Decision::Skip(SkipReason::NotLeader);
        }

        let name = deployment.name_any();
        let mut updated = deployment.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.replicas = Some(to);
        }
        updated.annotations_mut().insert(
            annotation.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );

        match self.cluster.replace_deployment(&updated).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                info!(namespace = %namespace, deployment = %name, "Lost scaling race to another writer");
                return Decision::Skip(SkipReason::LostRace);
            }
            Err(e) => {
                warn!(namespace = %namespace, deployment = %name, error = %e, "Failed to update replicas");
                return Decision::Skip(SkipReason::Failed);
            }
        }

        let workload = Workload::new("deployment", &name).slug();
        self.counters.increment_action(action, namespace, &workload);
        self.logger
            .log_scale_decision(namespace, &name, from, to, signals.cpu, signals.gate_ok);

        let channel = policy
            .map(|p| p.spec.escalation.slack_channel.as_str())
            .filter(|c| !c.is_empty());
        let text = format!("*{label}*: `{namespace}/{name}` {from} → {to} (cpu={:.2})", signals.cpu);
        if let Err(e) = self.notifier.post(&text, channel).await {
            warn!(error = %e, "Failed to post scaling notification");
        }
        decision
    }
}

fn template_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default()
}
