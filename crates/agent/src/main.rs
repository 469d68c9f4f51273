//! Remediation Agent - Kubernetes failure remediation and autoscaling agent
//!
//! This binary runs as a Deployment with one or more replicas. Every replica
//! watches pods and nodes and remediates incidents locally; the lease holder
//! additionally runs the scaling loop and the anomaly evaluator.

use agent_lib::{
    anomaly::AnomalyEvaluator,
    cluster::{ClusterOps, KubeCluster},
    escalation::EscalationPipeline,
    health::{components, HealthRegistry},
    integrations::{
        GitHubIssues, GitHubPulls, GitLabMerges, GitOps, Jira, LlmAdvisor, Notifier, SlackNotifier,
    },
    leader::{LeaderGate, LeaseConfig, LeaseElector},
    metrics::{MetricsProvider, PrometheusProvider, UnconfiguredProvider},
    observability::{AgentMetrics, StructuredLogger},
    policy::{PolicyStore, PolicySync},
    remediation::{
        ActionLimiter, NodeRemediator, NodeWatch, PodRemediator, PodWatch, DEFAULT_MAX_IN_FLIGHT,
    },
    scaling::Scaler,
    storage::{sink_from_settings, StorageSink},
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Time given to tasks to finish, including releasing the lease
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::AgentConfig::load()?;

    // RUST_LOG wins over LOG_LEVEL
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(fmt::layer().json())
        .init();

    let mode = config.mode()?;
    info!(
        identity = %config.pod_name,
        mode = %mode,
        namespaces = ?config.namespace_allowlist,
        "Starting remediation-agent"
    );
    if config.namespace_allowlist.is_empty() {
        warn!("NAMESPACE_ALLOWLIST is empty, the agent will not act on any workload");
    }

    let client = kube::Client::try_default().await?;

    let health_registry = HealthRegistry::new();
    health_registry.register_all(components::ALL).await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.pod_name);
    logger.log_startup(AGENT_VERSION, &mode.to_string());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Policies
    let policies = Arc::new(PolicyStore::new());
    let sync = PolicySync::new(client.clone(), policies.clone(), health_registry.clone());
    tasks.push(tokio::spawn(sync.run(shutdown_tx.subscribe())));

    // Leadership
    let gate = Arc::new(LeaderGate::new());
    let elector = LeaseElector::new(
        client.clone(),
        LeaseConfig::new(&config.lease_name, &config.lease_namespace, &config.pod_name),
        gate.clone(),
        health_registry.clone(),
        logger.clone(),
    );
    tasks.push(tokio::spawn(elector.run(shutdown_tx.subscribe())));

    // Collaborators
    let cluster: Arc<dyn ClusterOps> = Arc::new(KubeCluster::new(client.clone()));
    let metrics_provider: Arc<dyn MetricsProvider> = if config.metrics_provider == "prometheus" {
        Arc::new(PrometheusProvider::new(&config.prometheus_url)?)
    } else {
        info!(provider = %config.metrics_provider, "No metrics backend, scaling and anomaly rules stay idle");
        Arc::new(UnconfiguredProvider)
    };
    let notifier: Arc<dyn Notifier> = Arc::new(SlackNotifier::new(&config.slack_webhook_url));
    let sink: Arc<dyn StorageSink> = Arc::from(sink_from_settings(&config.storage_settings())?);

    let mut pipeline = EscalationPipeline::new(sink, notifier.clone(), metrics.clone(), logger.clone())
        .with_advisor(Arc::new(LlmAdvisor::new(
            &config.llm_api_url,
            &config.llm_api_key,
            &config.llm_model,
            config.llm_enabled,
        )));
    if !config.github_token.is_empty() && !config.github_repo.is_empty() {
        pipeline = pipeline.with_ticketer(
            "github",
            Arc::new(GitHubIssues::new(&config.github_token, &config.github_repo)),
        );
    }
    if !config.jira_url.is_empty() && !config.jira_token.is_empty() && !config.jira_project.is_empty() {
        pipeline = pipeline.with_ticketer(
            "jira",
            Arc::new(Jira::new(
                &config.jira_url,
                &config.jira_email,
                &config.jira_token,
                &config.jira_project,
            )),
        );
    }
    let pipeline = Arc::new(pipeline);

    let gitops: Option<Arc<dyn GitOps>> = match config.gitops_provider.as_str() {
        "github" if !config.github_token.is_empty() && !config.github_repo.is_empty() => Some(Arc::new(
            GitHubPulls::new(&config.github_token, &config.github_repo, &config.gitops_base_branch),
        )),
        "gitlab" if !config.gitlab_token.is_empty() && !config.gitlab_repo.is_empty() => Some(Arc::new(
            GitLabMerges::new(&config.gitlab_token, &config.gitlab_repo, &config.gitops_base_branch),
        )),
        "" => None,
        other => {
            warn!(provider = %other, "GitOps provider selected without credentials, memory changes stay suggestions");
            None
        }
    };

    // Remediation, on every replica
    let permits = Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT));
    let limiter = Arc::new(ActionLimiter::new(config.max_actions_per_10m));
    let mut pod_remediator = PodRemediator::new(
        cluster.clone(),
        policies.clone(),
        pipeline.clone(),
        limiter,
        metrics.clone(),
        logger.clone(),
        config.remediation_settings()?,
    );
    if let Some(gitops) = gitops {
        pod_remediator = pod_remediator.with_gitops(gitops);
    }
    let pod_watch = PodWatch::new(
        client.clone(),
        Arc::new(pod_remediator),
        health_registry.clone(),
        permits.clone(),
    );
    tasks.push(tokio::spawn(pod_watch.run(shutdown_tx.subscribe())));

    let node_remediator = NodeRemediator::new(
        cluster.clone(),
        pipeline.clone(),
        metrics.clone(),
        logger.clone(),
        mode,
    );
    let node_watch = NodeWatch::new(
        client.clone(),
        Arc::new(node_remediator),
        health_registry.clone(),
        permits,
    );
    tasks.push(tokio::spawn(node_watch.run(shutdown_tx.subscribe())));

    // Cluster-wide loops, leader only
    let scaling = config.scaling_settings()?;
    let interval = scaling.interval;
    let scaler = Scaler::new(
        cluster,
        metrics_provider.clone(),
        policies.clone(),
        notifier.clone(),
        gate.clone(),
        metrics.clone(),
        logger.clone(),
        health_registry.clone(),
        scaling,
    );
    tasks.push(tokio::spawn(scaler.run(shutdown_tx.subscribe())));

    let evaluator = AnomalyEvaluator::new(
        metrics_provider,
        policies,
        notifier,
        gate,
        metrics.clone(),
        logger.clone(),
        health_registry.clone(),
        interval,
    );
    tasks.push(tokio::spawn(evaluator.run(shutdown_tx.subscribe())));

    // Health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_shutdown = shutdown_tx.subscribe();
    let api_port = config.api_port;
    tasks.push(tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state, api_shutdown).await {
            warn!(error = %e, "API server stopped");
        }
    }));

    health_registry.set_ready(true).await;

    let reason = wait_for_signal().await?;
    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for task in tasks {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Tasks still running at shutdown deadline");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT received")
        }
        _ = terminate.recv() => Ok("SIGTERM received"),
    }
}
