//! Pod and node watch loops feeding the remediators
//!
//! Each classified update is handled on its own task. A shared semaphore
//! bounds how many run at once; when it is exhausted the watch loop waits,
//! which backs pressure up into the watch stream.

use super::classifier::{classify_pod, node_pressure};
use super::handler::PodRemediator;
use super::node::NodeRemediator;
use crate::health::{components, HealthRegistry};
use dashmap::DashSet;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

/// Default bound on concurrently running remediation tasks
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Keys currently being handled; a second update for the same key is
/// dropped until the first finishes
#[derive(Clone, Default)]
pub(crate) struct InFlight {
    keys: Arc<DashSet<String>>,
}

pub(crate) struct InFlightGuard {
    keys: Arc<DashSet<String>>,
    key: String,
}

impl InFlight {
    pub(crate) fn try_claim(&self, key: String) -> Option<InFlightGuard> {
        self.keys.insert(key.clone()).then(|| InFlightGuard {
            keys: self.keys.clone(),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}

/// Tracks the stream's health without writing the registry on every event
struct StreamHealth {
    registry: HealthRegistry,
    component: &'static str,
    degraded: bool,
}

impl StreamHealth {
    fn new(registry: HealthRegistry, component: &'static str) -> Self {
        Self {
            registry,
            component,
            degraded: true,
        }
    }

    async fn ok(&mut self) {
        if self.degraded {
            self.registry.set_healthy(self.component).await;
            self.degraded = false;
        }
    }

    async fn error(&mut self, message: String) {
        self.registry.set_degraded(self.component, message).await;
        self.degraded = true;
    }

    async fn ended(&mut self) {
        self.registry
            .set_unhealthy(self.component, "watch stream ended")
            .await;
    }
}

pub struct PodWatch {
    client: Client,
    remediator: Arc<PodRemediator>,
    health: HealthRegistry,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
}

impl PodWatch {
    pub fn new(
        client: Client,
        remediator: Arc<PodRemediator>,
        health: HealthRegistry,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            client,
            remediator,
            health,
            permits,
            in_flight: InFlight::default(),
        }
    }

    /// One merged stream over every allow-listed namespace
    fn pod_stream(&self) -> BoxStream<'static, Result<Pod, watcher::Error>> {
        let mut namespaces: Vec<&String> = self.remediator.settings().namespaces.iter().collect();
        namespaces.sort();
        let streams = namespaces.into_iter().map(|ns| {
            let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
            watcher(api, watcher::Config::default())
                .applied_objects()
                .boxed()
        });
        stream::select_all(streams).boxed()
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut health = StreamHealth::new(self.health.clone(), components::POD_WATCH);
        if self.remediator.settings().namespaces.is_empty() {
            warn!("Namespace allow-list is empty, no pods will be remediated");
            health.ok().await;
            let _ = shutdown.recv().await;
            return;
        }

        info!(
            namespaces = self.remediator.settings().namespaces.len(),
            mode = %self.remediator.settings().mode,
            "Starting pod watch"
        );
        let mut pods = self.pod_stream();

        loop {
            tokio::select! {
                item = pods.next() => {
                    match item {
                        Some(Ok(pod)) => {
                            health.ok().await;
                            self.dispatch(pod).await;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Pod watch error, retrying");
                            health.error(e.to_string()).await;
                            tokio::time::sleep(RETRY_DELAY).await;
                        }
                        None => {
                            warn!("Pod watch stream ended");
                            health.ended().await;
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down pod watch");
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, pod: Pod) {
        if !self.remediator.settings().admits(&pod) {
            return;
        }
        let Some(found) = classify_pod(&pod) else {
            return;
        };

        let key = format!(
            "{}/{}/{}",
            pod.namespace().unwrap_or_default(),
            pod.name_any(),
            found.reason
        );
        let Some(guard) = self.in_flight.try_claim(key) else {
            debug!(pod = %pod.name_any(), "Incident already being handled");
            return;
        };
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };

        let remediator = self.remediator.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            remediator.remediate(&pod, found).await;
        });
    }
}

pub struct NodeWatch {
    client: Client,
    remediator: Arc<NodeRemediator>,
    health: HealthRegistry,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
}

impl NodeWatch {
    pub fn new(
        client: Client,
        remediator: Arc<NodeRemediator>,
        health: HealthRegistry,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            client,
            remediator,
            health,
            permits,
            in_flight: InFlight::default(),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut health = StreamHealth::new(self.health.clone(), components::NODE_WATCH);
        let api: Api<Node> = Api::all(self.client.clone());
        let mut nodes = watcher(api, watcher::Config::default())
            .applied_objects()
            .boxed();

        info!("Starting node watch");

        loop {
            tokio::select! {
                item = nodes.next() => {
                    match item {
                        Some(Ok(node)) => {
                            health.ok().await;
                            self.dispatch(node).await;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Node watch error, retrying");
                            health.error(e.to_string()).await;
                            tokio::time::sleep(RETRY_DELAY).await;
                        }
                        None => {
                            warn!("Node watch stream ended");
                            health.ended().await;
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down node watch");
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, node: Node) {
        // Calm nodes still go through the remediator so it can reset its
        // per-node reporting state; only pressured nodes need a task
        if node_pressure(&node).is_empty() {
            self.remediator.handle(&node).await;
            return;
        }
        let Some(guard) = self.in_flight.try_claim(node.name_any()) else {
            return;
        };
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };

        let remediator = self.remediator.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            remediator.handle(&node).await;
        });
    }
}
