//! Memory limit recommendations after an OOM kill

use crate::integrations::GitOpsChange;
use crate::models::Workload;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

const MI: f64 = 1024.0 * 1024.0;

/// Parse a Kubernetes memory quantity into bytes
pub fn parse_memory(quantity: &str) -> Option<f64> {
    let q = quantity.trim();
    let split = q
        .find(|c: char| c.is_ascii_alphabetic() && c != 'e' && c != 'E')
        .unwrap_or(q.len());
    let (number, suffix) = q.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => MI,
        "Gi" => MI * 1024.0,
        "Ti" => MI * 1024.0 * 1024.0,
        "Pi" => MI * 1024.0 * 1024.0 * 1024.0,
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "m" => 1e-3,
        _ => return None,
    };
    (value >= 0.0).then_some(value * multiplier)
}

/// Bump recommendation for one container's memory limit
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecommendation {
    pub container: String,
    pub percent: u32,
    pub current: Option<String>,
    /// New limit in `Mi`, rounded up
    pub recommended: Option<String>,
}

impl MemoryRecommendation {
    pub fn for_container(pod: &Pod, container: &str, percent: u32) -> Self {
        let current = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.iter().find(|c| c.name == container))
            .and_then(|c| c.resources.as_ref())
            .and_then(|r| r.limits.as_ref())
            .and_then(|l| l.get("memory"))
            .map(|q| q.0.clone());

        let recommended = current.as_deref().and_then(parse_memory).map(|bytes| {
            let bumped = bytes * (100.0 + f64::from(percent)) / 100.0;
            format!("{}Mi", (bumped / MI).ceil() as u64)
        });

        Self {
            container: container.to_string(),
            percent,
            current,
            recommended,
        }
    }

    pub fn summary(&self) -> String {
        match (&self.current, &self.recommended) {
            (Some(current), Some(recommended)) => format!(
                "Recommend raising the memory limit of `{}` from {current} to {recommended} (+{}%); investigate usage spikes.",
                self.container, self.percent
            ),
            _ => format!(
                "Recommend +{}% memory for `{}` (no parseable limit set); investigate usage spikes.",
                self.percent, self.container
            ),
        }
    }

    /// Manifest patch raising the limit, for workloads a GitOps repo can own
    pub fn gitops_change(&self, namespace: &str, workload: &Workload, now: DateTime<Utc>) -> Option<GitOpsChange> {
        let recommended = self.recommended.as_deref()?;
        let kind = match workload.kind.as_str() {
            "deployment" => "Deployment",
            "statefulset" => "StatefulSet",
            "daemonset" => "DaemonSet",
            _ => return None,
        };

        let content = format!(
            "apiVersion: apps/v1\n\
             kind: {kind}\n\
             metadata:\n  name: {name}\n  namespace: {namespace}\n\
             spec:\n  template:\n    spec:\n      containers:\n\
             \x20       - name: {container}\n\
             \x20         resources:\n\
             \x20           limits:\n\
             \x20             memory: {recommended}\n",
            name = workload.name,
            container = self.container,
        );

        Some(GitOpsChange {
            file_path: format!(
                "remediations/{namespace}/{}/{}-memory.yaml",
                workload.slug(),
                self.container
            ),
            content,
            title: format!(
                "Raise memory limit of {namespace}/{workload} container {} to {recommended}",
                self.container
            ),
            body: format!(
                "The container was OOMKilled.\n\n{}\n\nOpened by the remediation agent.",
                self.summary()
            ),
            branch: format!(
                "auto-agent/oom-{namespace}-{}-{}-{}",
                workload.slug(),
                self.container,
                now.format("%Y%m%d%H%M%S")
            ),
        })
    }
}
