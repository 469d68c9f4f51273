//! Remediation policies declared as `AutoRemediationPolicy` custom resources
//!
//! This module provides:
//! - The policy data model and its label-selector matching
//! - A namespace-indexed store shared by the remediation and scaling paths
//! - Sync from the custom-resource watch cache into the store

mod store;
mod sync;

pub use store::PolicyStore;
pub use sync::{policy_api_resource, reindex, PolicySync};

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// API group of the policy custom resource
pub const POLICY_GROUP: &str = "autoagent.io";
/// API version of the policy custom resource
pub const POLICY_VERSION: &str = "v1alpha1";
/// Kind of the policy custom resource
pub const POLICY_KIND: &str = "AutoRemediationPolicy";
/// Plural resource name as registered by the deployed CRD
pub const POLICY_PLURAL: &str = "autoremidiationpolicies";

/// Default memory bump recommended after an OOM kill
pub const DEFAULT_BUMP_MEMORY_PERCENT: u32 = 20;

/// Errors turning a custom resource into a [`Policy`]
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy {namespace}/{name} has no spec block")]
    MissingSpec { namespace: String, name: String },

    #[error("policy {namespace}/{name} has an invalid spec: {source}")]
    InvalidSpec {
        namespace: String,
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Label selector over pod or workload labels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl TargetSelector {
    /// An empty selector matches everything
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleConfig {
    /// Unset leaves scaling on; only an explicit `false` opts the workload out
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub min_replicas: i32,
    #[serde(default)]
    pub max_replicas: i32,
    #[serde(default)]
    pub step: i32,
    #[serde(default, rename = "allowHPAOverride")]
    pub allow_hpa_override: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actions {
    #[serde(default)]
    pub restart_stuck_pods: bool,
    #[serde(default = "default_bump_memory_percent")]
    pub bump_memory_percent: u32,
    #[serde(default)]
    pub scale: ScaleConfig,
}

impl Default for Actions {
    fn default() -> Self {
        Self {
            restart_stuck_pods: false,
            bump_memory_percent: DEFAULT_BUMP_MEMORY_PERCENT,
            scale: ScaleConfig::default(),
        }
    }
}

fn default_bump_memory_percent() -> u32 {
    DEFAULT_BUMP_MEMORY_PERCENT
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticketing {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub project_or_repo: String,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    #[serde(default)]
    pub slack_channel: String,
    #[serde(default)]
    pub ticketing: Ticketing,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Safety {
    /// Minimum time between two agent actions on the same workload, e.g. `5m`
    #[serde(default)]
    pub cooldown: String,
    #[serde(default)]
    pub max_actions_per_hour: u32,
    #[serde(default)]
    pub require_approval: bool,
}

/// A threshold rule evaluated periodically by the anomaly evaluator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRule {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub promql: String,
    #[serde(default, rename = "zscoreThreshold")]
    pub zscore_threshold: f64,
    #[serde(default)]
    pub min_samples: u32,
}

/// The `spec` block of an `AutoRemediationPolicy`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub target_selector: TargetSelector,
    #[serde(default)]
    pub actions: Actions,
    #[serde(default)]
    pub escalation: Escalation,
    #[serde(default, rename = "runbookURL", alias = "runbookUrl")]
    pub runbook_url: String,
    #[serde(default)]
    pub safety: Safety,
    #[serde(default)]
    pub anomalies: Vec<AnomalyRule>,
}

/// A parsed remediation policy, keyed by namespace and name
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub namespace: String,
    pub name: String,
    pub spec: PolicySpec,
}

impl Policy {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: PolicySpec) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            spec,
        }
    }

    /// Parse a dynamic custom-resource object
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self, PolicyError> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();

        let spec = match obj.data.get("spec") {
            Some(value) if value.is_object() => value.clone(),
            _ => return Err(PolicyError::MissingSpec { namespace, name }),
        };

        let spec: PolicySpec =
            serde_json::from_value(spec).map_err(|source| PolicyError::InvalidSpec {
                namespace: namespace.clone(),
                name: name.clone(),
                source,
            })?;

        Ok(Self {
            namespace,
            name,
            spec,
        })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.spec.target_selector.matches(labels)
    }

    /// Parsed `safety.cooldown`, if set and valid
    pub fn cooldown(&self) -> Option<Duration> {
        parse_duration(&self.spec.safety.cooldown).filter(|d| !d.is_zero())
    }
}

/// Parse a short duration string: `90s`, `5m`, `1h`, or bare seconds
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, multiplier) = if let Some(v) = s.strip_suffix("ms") {
        return v.trim().parse::<u64>().ok().map(Duration::from_millis);
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3600)
    } else {
        (s, 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .map(Duration::from_secs)
}
