//! Metrics backends for scaling signals and anomaly rules

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from a metrics backend
#[derive(Debug, Error)]
pub enum MetricsError {
    /// No backend is configured; callers must never read this as a zero
    #[error("metrics provider not configured")]
    NotConfigured,

    #[error("metrics query failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("query returned no data: {0}")]
    NoData(String),

    #[error("unexpected query response: {0}")]
    InvalidResponse(String),
}

/// Source of scalar signals
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Average CPU usage (cores) of a deployment's pods over `window`
    async fn avg_cpu(&self, namespace: &str, deployment: &str, window: &str) -> Result<f64, MetricsError>;

    /// Evaluate an instant query and return the first sample's value
    async fn query_instant(&self, query: &str) -> Result<f64, MetricsError>;
}

/// Substitute `$namespace` and `$workload` in a query template
pub fn render_query(template: &str, namespace: &str, workload: &str) -> String {
    template
        .replace("$namespace", namespace)
        .replace("$workload", workload)
}

/// Provider used when no backend is selected
#[derive(Debug, Default, Clone)]
pub struct UnconfiguredProvider;

#[async_trait]
impl MetricsProvider for UnconfiguredProvider {
    async fn avg_cpu(&self, _namespace: &str, _deployment: &str, _window: &str) -> Result<f64, MetricsError> {
        Err(MetricsError::NotConfigured)
    }

    async fn query_instant(&self, _query: &str) -> Result<f64, MetricsError> {
        Err(MetricsError::NotConfigured)
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    /// `[unix_timestamp, "value"]`
    value: (f64, String),
}

/// Prometheus HTTP API backend
#[derive(Debug, Clone)]
pub struct PrometheusProvider {
    base_url: String,
    http: reqwest::Client,
}

impl PrometheusProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self, MetricsError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn cpu_query(namespace: &str, deployment: &str, window: &str) -> String {
        format!(
            r#"avg(rate(container_cpu_usage_seconds_total{{namespace="{namespace}",pod=~"{deployment}-.*",container!="",image!=""}}[{window}]))"#
        )
    }
}

#[async_trait]
impl MetricsProvider for PrometheusProvider {
    async fn avg_cpu(&self, namespace: &str, deployment: &str, window: &str) -> Result<f64, MetricsError> {
        self.query_instant(&Self::cpu_query(namespace, deployment, window))
            .await
    }

    async fn query_instant(&self, query: &str) -> Result<f64, MetricsError> {
        debug!(query = %query, "Running instant query");
        let response: QueryResponse = self
            .http
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", query)])
            .send()
            .await?
            .json()
            .await?;

        if response.status != "success" {
            return Err(MetricsError::InvalidResponse(
                response.error.unwrap_or(response.status),
            ));
        }

        let sample = response
            .data
            .and_then(|d| d.result.into_iter().next())
            .ok_or_else(|| MetricsError::NoData(query.to_string()))?;

        sample
            .value
            .1
            .parse::<f64>()
            .map_err(|e| MetricsError::InvalidResponse(format!("sample value: {e}")))
    }
}
