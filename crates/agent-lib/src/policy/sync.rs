//! Policy sync from the custom-resource watch cache

use super::{Policy, PolicyStore, POLICY_GROUP, POLICY_KIND, POLICY_PLURAL, POLICY_VERSION};
use crate::health::{components, HealthRegistry};
use futures::StreamExt;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use kube::runtime::reflector::{self, store::Writer};
use kube::runtime::watcher;
use kube::Client;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// API resource descriptor for `AutoRemediationPolicy`
pub fn policy_api_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(POLICY_GROUP, POLICY_VERSION, POLICY_KIND);
    ApiResource::from_gvk_with_plural(&gvk, POLICY_PLURAL)
}

/// Re-derive the whole store from a snapshot of custom-resource objects.
///
/// Every namespace present in the snapshot is replaced; namespaces that held
/// policies before but have none in the snapshot are cleared. Objects that
/// fail to parse are logged and skipped. Returns the namespaces written.
pub fn reindex<'a, I>(store: &PolicyStore, previous: &HashSet<String>, objects: I) -> HashSet<String>
where
    I: IntoIterator<Item = &'a DynamicObject>,
{
    let mut by_namespace: BTreeMap<String, Vec<Policy>> = BTreeMap::new();

    for obj in objects {
        match Policy::from_dynamic(obj) {
            Ok(policy) => by_namespace
                .entry(policy.namespace.clone())
                .or_default()
                .push(policy),
            Err(e) => warn!(error = %e, "Skipping malformed remediation policy"),
        }
    }

    let mut written = HashSet::with_capacity(by_namespace.len());
    for (namespace, mut policies) in by_namespace {
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(namespace = %namespace, count = policies.len(), "Indexed policies");
        store.update(&namespace, policies);
        written.insert(namespace);
    }

    for stale in previous.difference(&written) {
        info!(namespace = %stale, "Clearing policies for namespace with no remaining objects");
        store.update(stale, Vec::new());
    }

    written
}

/// Keeps the [`PolicyStore`] in step with `AutoRemediationPolicy` objects
pub struct PolicySync {
    client: Client,
    store: Arc<PolicyStore>,
    health: HealthRegistry,
    indexed: Mutex<HashSet<String>>,
}

impl PolicySync {
    pub fn new(client: Client, store: Arc<PolicyStore>, health: HealthRegistry) -> Self {
        Self {
            client,
            store,
            health,
            indexed: Mutex::new(HashSet::new()),
        }
    }

    fn apply_snapshot(&self, objects: &[Arc<DynamicObject>]) {
        let mut indexed = self.indexed.lock().unwrap_or_else(PoisonError::into_inner);
        let written = reindex(&self.store, &indexed, objects.iter().map(Arc::as_ref));
        *indexed = written;
    }

    /// Watch policies cluster-wide until shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let resource = policy_api_resource();
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);

        let writer = Writer::new(resource);
        let reader = writer.as_reader();
        let mut events =
            reflector::reflector(writer, watcher(api, watcher::Config::default())).boxed();

        info!(
            group = POLICY_GROUP,
            version = POLICY_VERSION,
            plural = POLICY_PLURAL,
            "Starting policy sync"
        );

        loop {
            tokio::select! {
                event = events.next() => {
                    match event {
                        Some(Ok(_)) => {
                            self.apply_snapshot(&reader.state());
                            self.health.set_healthy(components::POLICY_SYNC).await;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Policy watch error, retrying");
                            self.health
                                .set_degraded(components::POLICY_SYNC, e.to_string())
                                .await;
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                        None => {
                            warn!("Policy watch stream ended");
                            self.health
                                .set_unhealthy(components::POLICY_SYNC, "watch stream ended")
                                .await;
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down policy sync");
                    break;
                }
            }
        }
    }
}
