//! Agent library for Kubernetes failure remediation and autoscaling
//!
//! This crate provides the core functionality for:
//! - Pod and node incident classification and remediation
//! - Incident persistence, notification and escalation
//! - Policy sync from `AutoRemediationPolicy` custom resources
//! - Leader-gated replica scaling and anomaly evaluation
//! - Health checks and observability

pub mod anomaly;
pub mod cluster;
pub mod escalation;
pub mod health;
pub mod integrations;
pub mod leader;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod policy;
pub mod remediation;
pub mod scaling;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
