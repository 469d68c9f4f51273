//! Pod and node failure classification

use crate::models::IncidentReason;
use k8s_openapi::api::core::v1::{Node, Pod};

const NODE_PRESSURE_CONDITIONS: [&str; 2] = ["MemoryPressure", "DiskPressure"];

/// A failure found on one container of a pod
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub reason: IncidentReason,
    pub container: String,
    pub image: String,
    pub message: String,
}

/// Classify a pod by its container statuses.
///
/// Containers are checked in status order and the first failing one wins, so
/// one pod update yields at most one incident.
pub fn classify_pod(pod: &Pod) -> Option<Classification> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;

    for status in statuses {
        let waiting = status
            .state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .filter(|w| w.reason.is_some());
        if let Some(waiting) = waiting {
            let reason = match waiting.reason.as_deref() {
                Some("CrashLoopBackOff") => Some(IncidentReason::CrashLoopBackOff),
                Some("ImagePullBackOff") | Some("ErrImagePull") => Some(IncidentReason::ImagePullBackOff),
                _ => None,
            };
            if let Some(reason) = reason {
                return Some(Classification {
                    reason,
                    container: status.name.clone(),
                    image: status.image.clone(),
                    message: waiting.message.clone().unwrap_or_else(|| reason.to_string()),
                });
            }
        }

        let terminated = status
            .last_state
            .as_ref()
            .and_then(|s| s.terminated.as_ref());
        if let Some(terminated) = terminated {
            if terminated.reason.as_deref() == Some("OOMKilled") {
                return Some(Classification {
                    reason: IncidentReason::OomKilled,
                    container: status.name.clone(),
                    image: status.image.clone(),
                    message: format!(
                        "Container OOMKilled (exit code {}, restarts {})",
                        terminated.exit_code, status.restart_count
                    ),
                });
            }
        }
    }

    None
}

/// System and critical pods are never evicted for node pressure
pub fn is_critical(pod: &Pod) -> bool {
    let class = pod
        .spec
        .as_ref()
        .and_then(|s| s.priority_class_name.as_deref())
        .unwrap_or_default();
    class.starts_with("system-") || class.to_ascii_lowercase().contains("critical")
}

/// Pressure conditions currently `True` on the node
pub fn node_pressure(node: &Node) -> Vec<&'static str> {
    let Some(conditions) = node.status.as_ref().and_then(|s| s.conditions.as_ref()) else {
        return Vec::new();
    };
    NODE_PRESSURE_CONDITIONS
        .into_iter()
        .filter(|kind| {
            conditions
                .iter()
                .any(|c| c.type_ == *kind && c.status == "True")
        })
        .collect()
}

pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}
