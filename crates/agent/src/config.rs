//! Agent configuration

use agent_lib::models::Mode;
use agent_lib::policy::parse_duration;
use agent_lib::remediation::RemediationSettings;
use agent_lib::scaling::ScalingSettings;
use agent_lib::storage::StorageSettings;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// Agent configuration, read from the process environment
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// `observe`, `suggest` or `fix`
    #[serde(default = "default_auto_mode")]
    pub auto_mode: String,

    /// Namespaces the agent acts in; empty means none
    #[serde(default)]
    pub namespace_allowlist: Vec<String>,

    #[serde(default = "default_scale_cpu_threshold")]
    pub scale_cpu_threshold: f64,

    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,

    #[serde(default = "default_scale_window")]
    pub scale_window: String,

    #[serde(default = "default_max_scale_step")]
    pub max_scale_step: i32,

    /// Cluster-wide action budget; 0 disables it
    #[serde(default = "default_max_actions_per_10m")]
    pub max_actions_per_10m: u32,

    #[serde(default = "default_cooldown_up")]
    pub cooldown_up: String,

    #[serde(default = "default_cooldown_down")]
    pub cooldown_down: String,

    #[serde(default)]
    pub prom_queue_depth: String,

    #[serde(default)]
    pub prom_error_rate: String,

    #[serde(default)]
    pub prom_p95_latency: String,

    /// Leave HPA-managed deployments to their autoscaler
    #[serde(default = "default_true")]
    pub hpa_coexistence: bool,

    #[serde(default)]
    pub excluded_annotation: String,

    #[serde(default)]
    pub image_mirror_enabled: bool,

    #[serde(default)]
    pub image_mirror_prefix: String,

    #[serde(default = "default_true")]
    pub llm_enabled: bool,

    #[serde(default)]
    pub llm_api_url: String,

    #[serde(default)]
    pub llm_api_key: String,

    #[serde(default)]
    pub llm_model: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `prometheus` or `metrics-server`
    #[serde(default = "default_metrics_provider")]
    pub metrics_provider: String,

    #[serde(default)]
    pub prometheus_url: String,

    #[serde(default)]
    pub log_store: String,

    #[serde(default)]
    pub log_efs_path: String,

    #[serde(default)]
    pub log_s3_bucket: String,

    #[serde(default)]
    pub log_s3_prefix: String,

    #[serde(default)]
    pub log_s3_endpoint: String,

    #[serde(default)]
    pub slack_webhook_url: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Lease holder identity, from the downward API
    #[serde(default = "default_pod_name")]
    pub pod_name: String,

    #[serde(default = "default_lease_name")]
    pub lease_name: String,

    #[serde(default = "default_lease_namespace")]
    pub lease_namespace: String,

    /// `github` or `gitlab`; empty disables GitOps changes
    #[serde(default)]
    pub gitops_provider: String,

    #[serde(default = "default_gitops_base_branch")]
    pub gitops_base_branch: String,

    #[serde(default)]
    pub github_token: String,

    #[serde(default)]
    pub github_repo: String,

    #[serde(default)]
    pub gitlab_token: String,

    #[serde(default)]
    pub gitlab_repo: String,

    #[serde(default)]
    pub jira_url: String,

    #[serde(default)]
    pub jira_email: String,

    #[serde(default)]
    pub jira_token: String,

    #[serde(default)]
    pub jira_project: String,
}

fn default_auto_mode() -> String {
    "fix".to_string()
}

fn default_scale_cpu_threshold() -> f64 {
    0.8
}

fn default_scale_down_threshold() -> f64 {
    0.3
}

fn default_scale_window() -> String {
    "5m".to_string()
}

fn default_max_scale_step() -> i32 {
    2
}

fn default_max_actions_per_10m() -> u32 {
    10
}

fn default_cooldown_up() -> String {
    "2m".to_string()
}

fn default_cooldown_down() -> String {
    "10m".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_provider() -> String {
    "metrics-server".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_pod_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "remediation-agent".to_string())
}

fn default_lease_name() -> String {
    "auto-agent-leader".to_string()
}

fn default_lease_namespace() -> String {
    "kube-system".to_string()
}

fn default_gitops_base_branch() -> String {
    "main".to_string()
}

impl AgentConfig {
    /// Load configuration from the environment and validate it
    pub fn load() -> Result<Self> {
        let source = config::Environment::default()
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("namespace_allowlist");
        Self::from_builder(config::Config::builder().add_source(source))
    }

    fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let mut config: AgentConfig = builder
            .build()?
            .try_deserialize()
            .context("invalid agent configuration")?;
        config.namespace_allowlist = config
            .namespace_allowlist
            .iter()
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty())
            .collect();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.mode()?;
        for (name, value) in [
            ("SCALE_CPU_THRESHOLD", self.scale_cpu_threshold),
            ("SCALE_DOWN_THRESHOLD", self.scale_down_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                bail!("{name} must be in (0, 1], got {value}");
            }
        }
        if self.scale_down_threshold >= self.scale_cpu_threshold {
            bail!(
                "SCALE_DOWN_THRESHOLD ({}) must be below SCALE_CPU_THRESHOLD ({})",
                self.scale_down_threshold,
                self.scale_cpu_threshold
            );
        }
        if self.max_scale_step <= 0 {
            bail!("MAX_SCALE_STEP must be positive, got {}", self.max_scale_step);
        }
        if self.metrics_provider == "prometheus" && self.prometheus_url.is_empty() {
            bail!("PROMETHEUS_URL is required when METRICS_PROVIDER=prometheus");
        }
        self.duration("COOLDOWN_UP", &self.cooldown_up)?;
        self.duration("COOLDOWN_DOWN", &self.cooldown_down)?;
        Ok(())
    }

    pub fn mode(&self) -> Result<Mode> {
        self.auto_mode.parse::<Mode>().map_err(anyhow::Error::msg)
    }

    fn duration(&self, name: &str, value: &str) -> Result<Duration> {
        parse_duration(value).with_context(|| format!("{name} is not a duration: '{value}'"))
    }

    pub fn remediation_settings(&self) -> Result<RemediationSettings> {
        let image_mirror_prefix = (self.image_mirror_enabled && !self.image_mirror_prefix.is_empty())
            .then(|| self.image_mirror_prefix.clone());
        Ok(RemediationSettings {
            mode: self.mode()?,
            namespaces: self.namespace_allowlist.iter().cloned().collect::<HashSet<_>>(),
            excluded_annotation: self.excluded_annotation.clone(),
            image_mirror_prefix,
        })
    }

    pub fn scaling_settings(&self) -> Result<ScalingSettings> {
        let gate_queries = [&self.prom_queue_depth, &self.prom_error_rate, &self.prom_p95_latency]
            .into_iter()
            .filter(|q| !q.is_empty())
            .cloned()
            .collect();
        Ok(ScalingSettings {
            namespaces: self.namespace_allowlist.clone(),
            cpu_threshold: self.scale_cpu_threshold,
            scale_down_threshold: self.scale_down_threshold,
            window: self.scale_window.clone(),
            max_step: self.max_scale_step,
            cooldown_up: self.duration("COOLDOWN_UP", &self.cooldown_up)?,
            cooldown_down: self.duration("COOLDOWN_DOWN", &self.cooldown_down)?,
            gate_queries,
            respect_hpa: self.hpa_coexistence,
            ..Default::default()
        })
    }

    pub fn storage_settings(&self) -> StorageSettings {
        StorageSettings {
            store: self.log_store.clone(),
            fs_path: self.log_efs_path.clone(),
            bucket: self.log_s3_bucket.clone(),
            prefix: self.log_s3_prefix.clone(),
            endpoint: self.log_s3_endpoint.clone(),
        }
    }
}
