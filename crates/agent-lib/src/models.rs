//! Core data models for the remediation agent

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Label carried by pods created through a ReplicaSet
const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// Operating mode for mutating remediation actions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Record and notify only
    Observe,
    /// Notify with the action that would be taken, awaiting approval
    Suggest,
    /// Execute the action
    #[default]
    Fix,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Observe => write!(f, "observe"),
            Mode::Suggest => write!(f, "suggest"),
            Mode::Fix => write!(f, "fix"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "observe" => Ok(Mode::Observe),
            "suggest" => Ok(Mode::Suggest),
            "fix" => Ok(Mode::Fix),
            other => Err(format!("unknown mode '{other}' (expected observe, suggest or fix)")),
        }
    }
}

/// Failure classification of an incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentReason {
    CrashLoopBackOff,
    ImagePullBackOff,
    #[serde(rename = "OOMKilled")]
    OomKilled,
    NodePressure,
}

impl IncidentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentReason::CrashLoopBackOff => "CrashLoopBackOff",
            IncidentReason::ImagePullBackOff => "ImagePullBackOff",
            IncidentReason::OomKilled => "OOMKilled",
            IncidentReason::NodePressure => "NodePressure",
        }
    }
}

impl fmt::Display for IncidentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed set of replicated pods, identified by its controlling owner
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Workload {
    /// Lowercased owner kind, e.g. `deployment`
    pub kind: String,
    pub name: String,
}

impl Workload {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into().to_ascii_lowercase(),
            name: name.into(),
        }
    }

    /// Resolve the workload owning a pod.
    ///
    /// Pods created by a Deployment are owned by a ReplicaSet whose name is the
    /// Deployment name plus the `pod-template-hash` label; those resolve to the
    /// Deployment. Pods without a controller resolve to themselves.
    pub fn of_pod(pod: &Pod) -> Self {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let controller = pod
            .metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)));

        let Some(owner) = controller else {
            return Workload::new("pod", pod_name);
        };

        if owner.kind == "ReplicaSet" {
            let hash = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(POD_TEMPLATE_HASH_LABEL));
            if let Some(hash) = hash {
                if let Some(deployment) = owner.name.strip_suffix(&format!("-{hash}")) {
                    return Workload::new("deployment", deployment);
                }
            }
        }

        Workload::new(&owner.kind, &owner.name)
    }

    /// Path- and label-safe form, `kind-name`
    pub fn slug(&self) -> String {
        format!("{}-{}", self.kind, self.name)
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Structured record of a detected incident, persisted once to the storage sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRecord {
    pub timestamp: DateTime<Utc>,
    pub namespace: String,
    pub workload: String,
    pub pod: String,
    pub container: String,
    pub node: String,
    pub reason: IncidentReason,
    pub message: String,
    pub last_logs: String,
    pub events: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, String>,
}

impl IncidentRecord {
    /// Deterministic storage key: `{namespace}/{workload}/{reason}/{YYYY-MM-DD}/{pod}`
    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.namespace,
            self.workload,
            self.reason,
            self.timestamp.format("%Y-%m-%d"),
            self.pod
        )
    }
}
