//! Single-writer leader gate backed by a `coordination.k8s.io/v1` Lease
//!
//! One replica at a time holds the lease and runs the cluster-wide loops
//! (scaling, anomaly evaluation). Pod and node remediation never waits on it.
//! Readers call [`LeaderGate::is_leader`], a plain atomic load; only the
//! elector task writes it.

use crate::health::{components, HealthRegistry};
use crate::observability::StructuredLogger;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("lease was updated concurrently by another replica")]
    Conflict,
}

/// Latest known leadership state
#[derive(Debug)]
pub struct LeaderGate {
    leader: AtomicBool,
    edges: watch::Sender<bool>,
}

impl Default for LeaderGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderGate {
    pub fn new() -> Self {
        let (edges, _) = watch::channel(false);
        Self {
            leader: AtomicBool::new(false),
            edges,
        }
    }

    /// Non-blocking read of the latest known state.
    ///
    /// Nothing guarantees the state still holds when a subsequent action
    /// runs; actions gated on it must tolerate a brief double-leader window.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Edge notifications for consumers that care about transitions
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.edges.subscribe()
    }

    /// Returns true when the state changed
    pub(crate) fn set(&self, leader: bool) -> bool {
        let previous = self.leader.swap(leader, Ordering::AcqRel);
        if previous != leader {
            self.edges.send_replace(leader);
            true
        } else {
            false
        }
    }
}

/// Lease timing and identity
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaseConfig {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// What to do with the lease on this attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseStep {
    Create,
    Renew,
    TakeOver,
    Wait,
}

fn holder(lease: &Lease) -> Option<&str> {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty())
}

/// A lease without a holder, renew time or duration counts as expired
fn lease_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = &lease.spec else {
        return true;
    };
    let (Some(renew), Some(secs)) = (&spec.renew_time, spec.lease_duration_seconds) else {
        return true;
    };
    holder(lease).is_none() || renew.0 + chrono::Duration::seconds(i64::from(secs)) < now
}

fn next_step(existing: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseStep {
    match existing {
        None => LeaseStep::Create,
        Some(lease) if holder(lease) == Some(identity) => LeaseStep::Renew,
        Some(lease) if lease_expired(lease, now) => LeaseStep::TakeOver,
        Some(_) => LeaseStep::Wait,
    }
}

/// Runs the lease election and publishes the result on a [`LeaderGate`]
pub struct LeaseElector {
    api: Api<Lease>,
    config: LeaseConfig,
    gate: Arc<LeaderGate>,
    health: HealthRegistry,
    logger: StructuredLogger,
}

impl LeaseElector {
    pub fn new(
        client: Client,
        config: LeaseConfig,
        gate: Arc<LeaderGate>,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        let api = Api::namespaced(client, &config.namespace);
        Self {
            api,
            config,
            gate,
            health,
            logger,
        }
    }

    fn spec(&self, now: DateTime<Utc>, acquired: Option<MicroTime>, transitions: Option<i32>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
            acquire_time: Some(acquired.unwrap_or(MicroTime(now))),
            renew_time: Some(MicroTime(now)),
            lease_transitions: transitions,
        }
    }

    /// One acquire-or-renew attempt. Ok(true) means the lease is held now.
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaseError> {
        let now = Utc::now();
        let existing = self.api.get_opt(&self.config.name).await?;

        match next_step(existing.as_ref(), &self.config.identity, now) {
            LeaseStep::Wait => Ok(false),
            LeaseStep::Create => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.config.name.clone()),
                        namespace: Some(self.config.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(self.spec(now, None, Some(0))),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            LeaseStep::Renew | LeaseStep::TakeOver => {
                // Matched arms above guarantee the lease exists
                let Some(mut lease) = existing else {
                    return Ok(false);
                };
                let current = lease.spec.take().unwrap_or_default();
                let renewing = holder_is(&current, &self.config.identity);
                lease.spec = Some(if renewing {
                    self.spec(now, current.acquire_time, current.lease_transitions)
                } else {
                    self.spec(now, None, Some(current.lease_transitions.unwrap_or(0) + 1))
                });
                // Carries the fetched resourceVersion, so a concurrent writer
                // makes this fail with 409
                match self
                    .api
                    .replace(&self.config.name, &PostParams::default(), &lease)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(e)) if e.code == 409 => Err(LeaseError::Conflict),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Clear the holder so a peer can take over without waiting for expiry
    async fn release(&self) -> Result<(), LeaseError> {
        let Some(mut lease) = self.api.get_opt(&self.config.name).await? else {
            return Ok(());
        };
        if holder(&lease) != Some(self.config.identity.as_str()) {
            return Ok(());
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = None;
        }
        self.api
            .replace(&self.config.name, &PostParams::default(), &lease)
            .await?;
        Ok(())
    }

    async fn publish(&self, leader: bool) {
        if self.gate.set(leader) {
            self.logger.log_leadership(leader);
            self.health.set_healthy(components::LEADER).await;
        }
    }

    /// Campaign for and hold the lease until shutdown, then release it
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            lease = %self.config.name,
            namespace = %self.config.namespace,
            identity = %self.config.identity,
            "Starting leader election"
        );

        let mut ticker = tokio::time::interval(self.config.retry_period);
        let mut last_renewal: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.try_acquire_or_renew().await {
                        Ok(true) => {
                            last_renewal = Some(Instant::now());
                            self.publish(true).await;
                        }
                        Ok(false) => {
                            last_renewal = None;
                            self.publish(false).await;
                        }
                        Err(e) => {
                            debug!(error = %e, "Lease attempt failed");
                            let overdue = last_renewal
                                .map_or(true, |t| t.elapsed() >= self.config.renew_deadline);
                            if overdue && self.gate.is_leader() {
                                warn!(error = %e, "Lease not renewed within deadline, stepping down");
                                self.health
                                    .set_degraded(components::LEADER, e.to_string())
                                    .await;
                                self.publish(false).await;
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    if self.gate.is_leader() {
                        self.gate.set(false);
                        match self.release().await {
                            Ok(()) => info!("Released leader lease"),
                            Err(e) => warn!(error = %e, "Failed to release leader lease"),
                        }
                    }
                    info!("Shutting down leader election");
                    break;
                }
            }
        }
    }
}

fn holder_is(spec: &LeaseSpec, identity: &str) -> bool {
    spec.holder_identity.as_deref() == Some(identity)
}
