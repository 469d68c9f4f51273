//! In-memory collaborators and object builders shared by unit tests

use crate::cluster::{ClusterError, ClusterOps};
use crate::integrations::{Advisor, ChannelError, GitOps, GitOpsChange, Notifier, Ticket, Ticketer};
use crate::metrics::{MetricsError, MetricsProvider};
use crate::models::IncidentRecord;
use crate::policy::{policy_api_resource, Policy};
use crate::storage::{StorageError, StorageSink};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, Node,
    NodeCondition, NodeSpec, NodeStatus, Pod, PodSpec, PodStatus, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::DynamicObject;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub(crate) fn dynamic_policy(namespace: &str, name: &str, data: serde_json::Value) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &policy_api_resource()).within(namespace);
    obj.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    };
    obj.data = data;
    obj
}

pub(crate) fn policy(namespace: &str, name: &str, spec: serde_json::Value) -> Policy {
    Policy::from_dynamic(&dynamic_policy(namespace, name, serde_json::json!({ "spec": spec })))
        .expect("test policy must parse")
}

pub(crate) fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// Pods

pub(crate) fn waiting(container: &str, reason: &str) -> ContainerStatus {
    ContainerStatus {
        name: container.to_string(),
        image: format!("registry.example.com/{container}:1.0"),
        state: Some(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.to_string()),
                message: Some(format!("{reason} for {container}")),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn running(container: &str) -> ContainerStatus {
    ContainerStatus {
        name: container.to_string(),
        image: format!("registry.example.com/{container}:1.0"),
        ready: true,
        state: Some(ContainerState::default()),
        ..Default::default()
    }
}

pub(crate) fn oom_killed(container: &str) -> ContainerStatus {
    ContainerStatus {
        name: container.to_string(),
        image: format!("registry.example.com/{container}:1.0"),
        restart_count: 3,
        last_state: Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                reason: Some("OOMKilled".to_string()),
                exit_code: 137,
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A pod owned by deployment `deployment` through a ReplicaSet, labelled `app=<deployment>`
pub(crate) fn deployment_pod(namespace: &str, name: &str, deployment: &str, statuses: Vec<ContainerStatus>) -> Pod {
    let hash = "7c9d5f";
    let containers = statuses
        .iter()
        .map(|s| Container {
            name: s.name.clone(),
            image: Some(s.image.clone()),
            resources: Some(ResourceRequirements {
                limits: Some(BTreeMap::from([(
                    "memory".to_string(),
                    Quantity("512Mi".to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(&[("app", deployment), ("pod-template-hash", hash)])),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "ReplicaSet".to_string(),
                name: format!("{deployment}-{hash}"),
                uid: "rs-uid".to_string(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-a".to_string()),
            containers,
            ..Default::default()
        }),
        status: Some(PodStatus {
            container_statuses: Some(statuses),
            ..Default::default()
        }),
    }
}

pub(crate) fn priority_pod(namespace: &str, name: &str, priority_class: Option<&str>) -> Pod {
    let mut pod = deployment_pod(namespace, name, "app", vec![running("main")]);
    if let Some(spec) = pod.spec.as_mut() {
        spec.priority_class_name = priority_class.map(str::to_string);
    }
    pod
}

// Nodes and deployments

pub(crate) fn node(name: &str, unschedulable: bool, conditions: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            unschedulable: Some(unschedulable),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            conditions: Some(
                conditions
                    .iter()
                    .map(|(t, s)| NodeCondition {
                        type_: t.to_string(),
                        status: s.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
    }
}

pub(crate) fn deployment(namespace: &str, name: &str, replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels(&[("app", name)])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(&[("app", name)])),
                    ..Default::default()
                }),
                spec: None,
            },
            ..Default::default()
        }),
        status: None,
    }
}

// Cluster

/// Records every mutating call as a short string, e.g. `delete_pod ns1/p1`
#[derive(Default)]
pub(crate) struct FakeCluster {
    pub logs: String,
    pub events: Vec<String>,
    pub node_pods: Mutex<Vec<Pod>>,
    pub deployments: Mutex<Vec<Deployment>>,
    pub hpa_targets: Mutex<HashSet<String>>,
    pub failing_evictions: Mutex<HashSet<String>>,
    pub conflict_on_replace: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            logs: "panic: boom\n".to_string(),
            events: vec!["Warning BackOff: Back-off restarting failed container".to_string()],
            ..Default::default()
        }
    }

    pub fn with_deployments(self, deployments: Vec<Deployment>) -> Self {
        *self.deployments.lock().unwrap() = deployments;
        self
    }

    pub fn with_node_pods(self, pods: Vec<Pod>) -> Self {
        *self.node_pods.lock().unwrap() = pods;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn stored_deployment(&self, name: &str) -> Option<Deployment> {
        self.deployments
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.metadata.name.as_deref() == Some(name))
            .cloned()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ClusterOps for FakeCluster {
    async fn pod_logs(&self, namespace: &str, pod: &str, container: &str, tail_lines: i64) -> Result<String, ClusterError> {
        self.record(format!("pod_logs {namespace}/{pod}/{container} {tail_lines}"));
        Ok(self.logs.clone())
    }

    async fn pod_events(&self, _namespace: &str, _pod: &str) -> Result<Vec<String>, ClusterError> {
        Ok(self.events.clone())
    }

    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<(), ClusterError> {
        self.record(format!("delete_pod {namespace}/{pod}"));
        Ok(())
    }

    async fn cordon_node(&self, node: &str) -> Result<(), ClusterError> {
        self.record(format!("cordon_node {node}"));
        Ok(())
    }

    async fn pods_on_node(&self, _node: &str) -> Result<Vec<Pod>, ClusterError> {
        Ok(self.node_pods.lock().unwrap().clone())
    }

    async fn evict_pod(&self, namespace: &str, pod: &str, grace_seconds: u32) -> Result<(), ClusterError> {
        if self.failing_evictions.lock().unwrap().contains(pod) {
            return Err(ClusterError::InvalidObject("disruption budget"));
        }
        self.record(format!("evict_pod {namespace}/{pod} {grace_seconds}"));
        Ok(())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, ClusterError> {
        Ok(self
            .deployments
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClusterError> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
        if self.conflict_on_replace.load(Ordering::SeqCst) {
            return Err(ClusterError::Conflict {
                kind: "Deployment",
                namespace,
                name,
            });
        }
        let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        self.record(format!("replace_deployment {namespace}/{name} {replicas}"));

        let mut stored = self.deployments.lock().unwrap();
        let mut updated = deployment.clone();
        if let Some(slot) = stored.iter_mut().find(|d| d.metadata.name.as_deref() == Some(&name)) {
            let version: u64 = slot
                .metadata
                .resource_version
                .as_deref()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            updated.metadata.resource_version = Some((version + 1).to_string());
            *slot = updated.clone();
        }
        Ok(updated)
    }

    async fn hpa_targets(&self, _namespace: &str) -> Result<HashSet<String>, ClusterError> {
        Ok(self.hpa_targets.lock().unwrap().clone())
    }
}

// Metrics

/// CPU keyed by `namespace/deployment`; instant queries replay a queue of
/// values and keep returning the last one
#[derive(Default)]
pub(crate) struct FakeMetrics {
    cpu: Mutex<HashMap<String, f64>>,
    series: Mutex<HashMap<String, VecDeque<f64>>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeMetrics {
    pub fn with_cpu(self, namespace: &str, deployment: &str, value: f64) -> Self {
        self.cpu
            .lock()
            .unwrap()
            .insert(format!("{namespace}/{deployment}"), value);
        self
    }

    pub fn with_value(self, query: &str, value: f64) -> Self {
        self.push(query, value);
        self
    }

    pub fn push(&self, query: &str, value: f64) {
        self.series
            .lock()
            .unwrap()
            .entry(query.to_string())
            .or_default()
            .push_back(value);
    }

    pub fn fail(&self, query: &str) {
        self.failing.lock().unwrap().insert(query.to_string());
    }

    pub fn recover(&self, query: &str) {
        self.failing.lock().unwrap().remove(query);
    }
}

#[async_trait]
impl MetricsProvider for FakeMetrics {
    async fn avg_cpu(&self, namespace: &str, deployment: &str, _window: &str) -> Result<f64, MetricsError> {
        self.cpu
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{deployment}"))
            .copied()
            .ok_or_else(|| MetricsError::NoData(deployment.to_string()))
    }

    async fn query_instant(&self, query: &str) -> Result<f64, MetricsError> {
        if self.failing.lock().unwrap().contains(query) {
            return Err(MetricsError::InvalidResponse("backend down".to_string()));
        }
        let mut series = self.series.lock().unwrap();
        let values = series
            .get_mut(query)
            .ok_or_else(|| MetricsError::NoData(query.to_string()))?;
        let value = if values.len() > 1 {
            values.pop_front()
        } else {
            values.front().copied()
        };
        value.ok_or_else(|| MetricsError::NoData(query.to_string()))
    }
}

// Integrations

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    messages: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn channels(&self) -> Vec<Option<String>> {
        self.messages.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn post(&self, text: &str, channel: Option<&str>) -> Result<(), ChannelError> {
        self.messages
            .lock()
            .unwrap()
            .push((text.to_string(), channel.map(str::to_string)));
        Ok(())
    }
}

/// Advisor returning a fixed answer
pub(crate) struct StaticAdvisor(pub &'static str);

#[async_trait]
impl Advisor for StaticAdvisor {
    fn enabled(&self) -> bool {
        true
    }

    async fn diagnose(&self, _title: &str, _context: &str) -> Result<String, ChannelError> {
        Ok(self.0.to_string())
    }
}

#[derive(Default)]
pub(crate) struct RecordingTicketer {
    pub tickets: Mutex<Vec<(String, Ticket)>>,
}

#[async_trait]
impl Ticketer for RecordingTicketer {
    async fn create_or_update(&self, key: &str, ticket: &Ticket) -> Result<String, ChannelError> {
        let mut tickets = self.tickets.lock().unwrap();
        tickets.push((key.to_string(), ticket.clone()));
        Ok(format!("https://tracker.example.com/{}", tickets.len()))
    }
}

#[derive(Default)]
pub(crate) struct RecordingGitOps {
    pub changes: Mutex<Vec<GitOpsChange>>,
}

#[async_trait]
impl GitOps for RecordingGitOps {
    async fn open_pr(&self, change: &GitOpsChange) -> Result<String, ChannelError> {
        self.changes.lock().unwrap().push(change.clone());
        Ok("https://git.example.com/pulls/1".to_string())
    }
}

// Storage

#[derive(Default)]
pub(crate) struct MemorySink {
    pub records: Mutex<Vec<(String, IncidentRecord)>>,
}

#[async_trait]
impl StorageSink for MemorySink {
    async fn save(&self, key: &str, record: &IncidentRecord) -> Result<String, StorageError> {
        self.records
            .lock()
            .unwrap()
            .push((key.to_string(), record.clone()));
        Ok(format!("mem://{key}"))
    }
}

pub(crate) struct FailingSink;

#[async_trait]
impl StorageSink for FailingSink {
    async fn save(&self, key: &str, _record: &IncidentRecord) -> Result<String, StorageError> {
        Err(StorageError::Io {
            path: format!("/var/log/auto-agent/{key}.json").into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only file system"),
        })
    }
}
