//! Cluster reads and writes used by remediation and scaling
//!
//! Handlers talk to the API server only through [`ClusterOps`], so they can be
//! exercised against an in-memory cluster in tests.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Errors from cluster operations
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The object changed since it was read; another writer won
    #[error("conflicting update on {kind} {namespace}/{name}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("object is missing {0}")]
    InvalidObject(&'static str),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl ClusterError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

/// Cluster capabilities the agent relies on
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Last `tail_lines` lines of a container's log
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: i64,
    ) -> Result<String, ClusterError>;

    /// Events whose involved object is the named pod, as `"{type} {reason}: {message}"`
    async fn pod_events(&self, namespace: &str, pod: &str) -> Result<Vec<String>, ClusterError>;

    /// Delete a pod; an already-deleted pod is not an error
    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<(), ClusterError>;

    /// Mark a node unschedulable; cordoning a cordoned node is a no-op
    async fn cordon_node(&self, node: &str) -> Result<(), ClusterError>;

    /// Pods bound to a node, across all namespaces
    async fn pods_on_node(&self, node: &str) -> Result<Vec<Pod>, ClusterError>;

    /// Evict a pod through the eviction API, honoring disruption budgets
    async fn evict_pod(&self, namespace: &str, pod: &str, grace_seconds: u32) -> Result<(), ClusterError>;

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, ClusterError>;

    /// Replace a deployment, failing with [`ClusterError::Conflict`] if its
    /// `resourceVersion` is stale
    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClusterError>;

    /// Names of deployments targeted by a HorizontalPodAutoscaler
    async fn hpa_targets(&self, namespace: &str) -> Result<HashSet<String>, ClusterError>;
}

/// [`ClusterOps`] over the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterOps for KubeCluster {
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: i64,
    ) -> Result<String, ClusterError> {
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines: Some(tail_lines),
            ..Default::default()
        };
        Ok(self.pods(namespace).logs(pod, &params).await?)
    }

    async fn pod_events(&self, namespace: &str, pod: &str) -> Result<Vec<String>, ClusterError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().fields(&format!("involvedObject.name={pod}"));
        let events = api.list(&params).await?;

        Ok(events
            .items
            .into_iter()
            .map(|e| {
                format!(
                    "{} {}: {}",
                    e.type_.unwrap_or_default(),
                    e.reason.unwrap_or_default(),
                    e.message.unwrap_or_default()
                )
            })
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<(), ClusterError> {
        match self.pods(namespace).delete(pod, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => {
                debug!(namespace = %namespace, pod = %pod, "Pod already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cordon_node(&self, node: &str) -> Result<(), ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "unschedulable": true } });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn pods_on_node(&self, node: &str) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        Ok(api.list(&params).await?.items)
    }

    async fn evict_pod(&self, namespace: &str, pod: &str, grace_seconds: u32) -> Result<(), ClusterError> {
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(grace_seconds),
                ..Default::default()
            }),
            post_options: PostParams::default(),
        };
        match self.pods(namespace).evict(pod, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClusterError> {
        let namespace = deployment
            .namespace()
            .ok_or(ClusterError::InvalidObject("metadata.namespace"))?;
        let name = deployment
            .metadata
            .name
            .clone()
            .ok_or(ClusterError::InvalidObject("metadata.name"))?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);

        match api.replace(&name, &PostParams::default(), deployment).await {
            Ok(updated) => Ok(updated),
            Err(e) if is_status(&e, 409) => Err(ClusterError::Conflict {
                kind: "Deployment",
                namespace,
                name,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn hpa_targets(&self, namespace: &str) -> Result<HashSet<String>, ClusterError> {
        let api: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), namespace);
        let hpas = api.list(&ListParams::default()).await?;

        Ok(hpas
            .items
            .into_iter()
            .filter_map(|hpa| hpa.spec)
            .filter(|spec| spec.scale_target_ref.kind == "Deployment")
            .map(|spec| spec.scale_target_ref.name)
            .collect())
    }
}
