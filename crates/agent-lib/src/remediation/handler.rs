//! Pod remediation state machine
//!
//! Takes one classified pod failure through evidence collection,
//! persistence, the mode-gated action and escalation.

use super::classifier::{classify_pod, Classification};
use super::limiter::ActionLimiter;
use super::memory::MemoryRecommendation;
use crate::cluster::ClusterOps;
use crate::escalation::{AdvisoryRequest, EscalationPipeline, Notice};
use crate::integrations::GitOps;
use crate::models::{IncidentReason, IncidentRecord, Mode, Workload};
use crate::observability::{actions, AgentMetrics, StructuredLogger};
use crate::policy::{Policy, PolicyStore, DEFAULT_BUMP_MEMORY_PERCENT};
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

const CRASH_LOOP_LOG_LINES: i64 = 50;
const OOM_LOG_LINES: i64 = 20;

/// Which pods are handled and how
#[derive(Debug, Clone)]
pub struct RemediationSettings {
    pub mode: Mode,
    pub namespaces: HashSet<String>,
    /// Pods carrying this annotation key are ignored; empty disables the check
    pub excluded_annotation: String,
    /// Registry prefix suggested for failed image pulls, when mirroring is on
    pub image_mirror_prefix: Option<String>,
}

impl RemediationSettings {
    pub fn admits(&self, pod: &Pod) -> bool {
        let namespace = pod.namespace().unwrap_or_default();
        if !self.namespaces.contains(&namespace) {
            return false;
        }
        self.excluded_annotation.is_empty() || !pod.annotations().contains_key(&self.excluded_annotation)
    }
}

/// What happened to one incident
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub reason: IncidentReason,
    pub workload: Workload,
    /// Mode after policy and safety downgrades
    pub mode: Mode,
    pub action: Option<&'static str>,
    pub suppressed: Option<String>,
    pub location: String,
    pub text: String,
}

pub struct PodRemediator {
    cluster: Arc<dyn ClusterOps>,
    policies: Arc<PolicyStore>,
    pipeline: Arc<EscalationPipeline>,
    limiter: Arc<ActionLimiter>,
    gitops: Option<Arc<dyn GitOps>>,
    counters: AgentMetrics,
    logger: StructuredLogger,
    settings: RemediationSettings,
}

impl PodRemediator {
    pub fn new(
        cluster: Arc<dyn ClusterOps>,
        policies: Arc<PolicyStore>,
        pipeline: Arc<EscalationPipeline>,
        limiter: Arc<ActionLimiter>,
        counters: AgentMetrics,
        logger: StructuredLogger,
        settings: RemediationSettings,
    ) -> Self {
        Self {
            cluster,
            policies,
            pipeline,
            limiter,
            gitops: None,
            counters,
            logger,
            settings,
        }
    }

    pub fn with_gitops(mut self, gitops: Arc<dyn GitOps>) -> Self {
        self.gitops = Some(gitops);
        self
    }

    pub fn settings(&self) -> &RemediationSettings {
        &self.settings
    }

    /// Gate, classify and remediate a pod update
    pub async fn handle(&self, pod: &Pod) -> Option<Outcome> {
        if !self.settings.admits(pod) {
            return None;
        }
        let found = classify_pod(pod)?;
        Some(self.remediate(pod, found).await)
    }

    /// Downgrade the configured mode for this incident.
    ///
    /// Restarts also consume the rate-limit budget when they stay in `fix`.
    fn effective_mode(&self, reason: IncidentReason, policy: Option<&Policy>, budget_key: &str) -> (Mode, Option<String>) {
        let restarts = matches!(
            reason,
            IncidentReason::CrashLoopBackOff | IncidentReason::ImagePullBackOff
        );
        if self.settings.mode != Mode::Fix {
            return (self.settings.mode, None);
        }

        if let Some(policy) = policy {
            if policy.spec.safety.require_approval {
                return (
                    Mode::Suggest,
                    Some(format!("policy {} requires approval", policy.name)),
                );
            }
            if restarts && !policy.spec.actions.restart_stuck_pods {
                return (
                    Mode::Suggest,
                    Some(format!("policy {} does not allow pod restarts", policy.name)),
                );
            }
        }

        if restarts {
            if let Err(denial) = self.limiter.try_acquire(budget_key, policy) {
                return (Mode::Suggest, Some(denial.to_string()));
            }
        }

        (Mode::Fix, None)
    }

    async fn collect_logs(&self, namespace: &str, pod: &str, container: &str, reason: IncidentReason) -> String {
        let lines = match reason {
            IncidentReason::CrashLoopBackOff => CRASH_LOOP_LOG_LINES,
            IncidentReason::OomKilled => OOM_LOG_LINES,
            _ => return String::new(),
        };
        match self.cluster.pod_logs(namespace, pod, container, lines).await {
            Ok(logs) => logs,
            Err(e) => format!("log fetch error: {e}"),
        }
    }

    pub async fn remediate(&self, pod: &Pod, found: Classification) -> Outcome {
        let namespace = pod.namespace().unwrap_or_default();
        let pod_name = pod.name_any();
        let workload = Workload::of_pod(pod);
        let slug = workload.slug();
        let policy = self.policies.first_match(&namespace, pod.labels());
        let reason = found.reason;

        let logs = self.collect_logs(&namespace, &pod_name, &found.container, reason).await;
        let events = match self.cluster.pod_events(&namespace, &pod_name).await {
            Ok(events) => events,
            Err(e) => {
                warn!(pod = %pod_name, namespace = %namespace, error = %e, "Failed to list pod events");
                Vec::new()
            }
        };

        let percent = policy
            .as_ref()
            .map_or(DEFAULT_BUMP_MEMORY_PERCENT, |p| p.spec.actions.bump_memory_percent);
        let memory = (reason == IncidentReason::OomKilled)
            .then(|| MemoryRecommendation::for_container(pod, &found.container, percent));

        let mut extras = BTreeMap::new();
        if reason == IncidentReason::ImagePullBackOff && !found.image.is_empty() {
            extras.insert("image".to_string(), found.image.clone());
        }
        if let Some(rec) = &memory {
            extras.insert("memoryBumpPercent".to_string(), rec.percent.to_string());
            if let Some(recommended) = &rec.recommended {
                extras.insert("recommendedMemoryLimit".to_string(), recommended.clone());
            }
        }
        if let Some(p) = &policy {
            extras.insert("policy".to_string(), p.name.clone());
            if !p.spec.runbook_url.is_empty() {
                extras.insert("runbookURL".to_string(), p.spec.runbook_url.clone());
            }
        }

        let record = IncidentRecord {
            timestamp: Utc::now(),
            namespace: namespace.clone(),
            workload: slug.clone(),
            pod: pod_name.clone(),
            container: found.container.clone(),
            node: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            reason,
            message: found.message.clone(),
            last_logs: logs.clone(),
            events: events.clone(),
            extras,
        };
        let location = self.pipeline.persist(&record).await;

        let budget_key = format!("{namespace}/{slug}");
        let (mode, suppressed) = self.effective_mode(reason, policy.as_ref(), &budget_key);

        let mut text = format!(
            "*{reason}* on `{namespace}/{pod_name}` (container: `{}`, workload: `{workload}`)\nSaved: `{location}`\n",
            found.container
        );
        let mut action = None;

        match reason {
            IncidentReason::CrashLoopBackOff | IncidentReason::ImagePullBackOff => {
                if reason == IncidentReason::ImagePullBackOff {
                    if let Some(prefix) = &self.settings.image_mirror_prefix {
                        if !found.image.is_empty() {
                            text.push_str(&format!(
                                "_Suggest_: mirror `{}` via `{prefix}` and update the image reference through GitOps.\n",
                                found.image
                            ));
                        }
                    }
                }
                let purpose = if reason == IncidentReason::CrashLoopBackOff {
                    "clear the backoff"
                } else {
                    "retry the image pull"
                };
                match mode {
                    Mode::Fix => match self.cluster.delete_pod(&namespace, &pod_name).await {
                        Ok(()) => {
                            action = Some(actions::DELETE_POD);
                            self.counters
                                .increment_action(actions::DELETE_POD, &namespace, &slug);
                            self.logger
                                .log_action(actions::DELETE_POD, &namespace, &slug, &pod_name);
                            text.push_str(&format!(
                                "_Action_: deleted pod to {purpose}; its controller recreates it.\n"
                            ));
                        }
                        Err(e) => {
                            warn!(pod = %pod_name, namespace = %namespace, error = %e, "Failed to delete pod");
                            text.push_str(&format!("_Action failed_: could not delete pod: {e}\n"));
                        }
                    },
                    Mode::Suggest => {
                        text.push_str(&format!(
                            "_Suggest_: delete pod to {purpose}. Approve to proceed.\n"
                        ));
                    }
                    Mode::Observe => {}
                }
            }
            IncidentReason::OomKilled => {
                if let Some(rec) = &memory {
                    text.push_str(&rec.summary());
                    text.push('\n');
                    if mode == Mode::Fix {
                        text.push_str(&self.propose_memory_change(&namespace, &workload, rec).await);
                    }
                }
            }
            IncidentReason::NodePressure => {}
        }

        if let Some(why) = &suppressed {
            let held = if reason == IncidentReason::OomKilled {
                "memory_change"
            } else {
                actions::DELETE_POD
            };
            self.logger.log_suppressed(held, &namespace, &slug, why);
            text.push_str(&format!("_Held back_: {why}\n"));
        }
        if let Some(runbook) = policy.as_ref().map(|p| p.spec.runbook_url.as_str()) {
            if !runbook.is_empty() {
                text.push_str(&format!("Runbook: {runbook}\n"));
            }
        }

        let advisory_context = if logs.is_empty() {
            events.join("\n")
        } else {
            format!("{logs}\n{}", events.join("\n"))
        };
        let delivery = self
            .pipeline
            .publish(Notice {
                record: &record,
                workload: &slug,
                text,
                advisory: Some(AdvisoryRequest {
                    title: advisory_title(reason).to_string(),
                    context: advisory_context,
                }),
                policy: policy.as_ref(),
            })
            .await;

        Outcome {
            reason,
            workload,
            mode,
            action,
            suppressed,
            location,
            text: delivery.text,
        }
    }

    async fn propose_memory_change(&self, namespace: &str, workload: &Workload, rec: &MemoryRecommendation) -> String {
        let Some(gitops) = &self.gitops else {
            return String::new();
        };
        let Some(change) = rec.gitops_change(namespace, workload, Utc::now()) else {
            debug!(workload = %workload, "No GitOps change for this workload kind or limit");
            return String::new();
        };
        match gitops.open_pr(&change).await {
            Ok(url) => format!("_GitOps_: opened {url}\n"),
            Err(e) => {
                warn!(workload = %workload, error = %e, "Failed to open memory change request");
                format!("_GitOps_: change request failed: {e}\n")
            }
        }
    }
}

fn advisory_title(reason: IncidentReason) -> &'static str {
    match reason {
        IncidentReason::CrashLoopBackOff => "Pod CrashLoopBackOff",
        IncidentReason::ImagePullBackOff => "ImagePullBackOff",
        IncidentReason::OomKilled => "Container OOMKilled",
        IncidentReason::NodePressure => "Node pressure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        deployment_pod, oom_killed, policy, waiting, FakeCluster, MemorySink, RecordingGitOps,
        RecordingNotifier,
    };
    use serde_json::json;

    struct Harness {
        cluster: Arc<FakeCluster>,
        policies: Arc<PolicyStore>,
        notifier: Arc<RecordingNotifier>,
        sink: Arc<MemorySink>,
        counters: AgentMetrics,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                cluster: Arc::new(FakeCluster::new()),
                policies: Arc::new(PolicyStore::new()),
                notifier: Arc::new(RecordingNotifier::default()),
                sink: Arc::new(MemorySink::default()),
                counters: AgentMetrics::new(),
            }
        }

        fn remediator(&self, mode: Mode) -> PodRemediator {
            self.remediator_with(mode, ActionLimiter::new(10))
        }

        fn remediator_with(&self, mode: Mode, limiter: ActionLimiter) -> PodRemediator {
            let pipeline = EscalationPipeline::new(
                self.sink.clone(),
                self.notifier.clone(),
                self.counters.clone(),
                StructuredLogger::new("test"),
            );
            PodRemediator::new(
                self.cluster.clone(),
                self.policies.clone(),
                Arc::new(pipeline),
                Arc::new(limiter),
                self.counters.clone(),
                StructuredLogger::new("test"),
                RemediationSettings {
                    mode,
                    namespaces: HashSet::from(["ns1".to_string()]),
                    excluded_annotation: "auto-agent.io/exclude".to_string(),
                    image_mirror_prefix: None,
                },
            )
        }
    }

    fn crash_pod() -> Pod {
        deployment_pod("ns1", "p1", "web", vec![waiting("app", "CrashLoopBackOff")])
    }

    #[tokio::test]
    async fn test_crash_loop_fix_deletes_once_and_counts_once() {
        let h = Harness::new();
        let outcome = h.remediator(Mode::Fix).handle(&crash_pod()).await.unwrap();

        assert_eq!(outcome.action, Some(actions::DELETE_POD));
        assert_eq!(h.cluster.count("delete_pod"), 1);
        assert_eq!(h.cluster.calls()[0], "pod_logs ns1/p1/app 50");
        assert_eq!(h.counters.action_count("delete_pod", "ns1", "deployment-web"), 1);
        assert_eq!(
            h.counters
                .incident_count("CrashLoopBackOff", "ns1", "deployment-web"),
            1
        );
        assert_eq!(h.counters.total_incidents(), 1);
        assert!(h.notifier.messages()[0].contains("_Action_: deleted pod"));
    }

    #[tokio::test]
    async fn test_observe_mode_takes_no_action_but_counts() {
        let h = Harness::new();
        let outcome = h.remediator(Mode::Observe).handle(&crash_pod()).await.unwrap();

        assert_eq!(outcome.action, None);
        assert_eq!(h.cluster.count("delete_pod"), 0);
        assert_eq!(h.counters.total_actions(), 0);
        assert_eq!(
            h.counters
                .incident_count("CrashLoopBackOff", "ns1", "deployment-web"),
            1
        );
        assert_eq!(h.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_suggest_mode_describes_action() {
        let h = Harness::new();
        let outcome = h.remediator(Mode::Suggest).handle(&crash_pod()).await.unwrap();

        assert_eq!(outcome.action, None);
        assert_eq!(h.cluster.count("delete_pod"), 0);
        assert!(outcome
            .text
            .contains("_Suggest_: delete pod to clear the backoff. Approve to proceed."));
    }

    #[tokio::test]
    async fn test_oom_end_to_end() {
        let h = Harness::new();
        let gitops = Arc::new(RecordingGitOps::default());
        let remediator = h.remediator(Mode::Fix).with_gitops(gitops.clone());
        let pod = deployment_pod("ns1", "p1", "x", vec![oom_killed("c1")]);

        let outcome = remediator.handle(&pod).await.unwrap();

        let records = h.sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let date = records[0].1.timestamp.format("%Y-%m-%d").to_string();
        assert_eq!(records[0].0, format!("ns1/deployment-x/OOMKilled/{date}/p1"));
        assert_eq!(records[0].1.last_logs, "panic: boom\n");
        assert_eq!(outcome.location, format!("mem://{}", records[0].0));

        assert_eq!(h.counters.incident_count("OOMKilled", "ns1", "deployment-x"), 1);
        assert_eq!(h.cluster.count("delete_pod"), 0);
        assert_eq!(h.cluster.calls(), vec!["pod_logs ns1/p1/c1 20"]);

        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("from 512Mi to 615Mi (+20%)"));
        assert!(messages[0].contains("_GitOps_: opened https://git.example.com/pulls/1"));
        assert_eq!(gitops.changes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_image_pull_collects_no_logs_and_suggests_mirror() {
        let h = Harness::new();
        let mut remediator = h.remediator(Mode::Fix);
        remediator.settings.image_mirror_prefix = Some("mirror.example.com/".to_string());
        let pod = deployment_pod("ns1", "p1", "web", vec![waiting("app", "ImagePullBackOff")]);

        let outcome = remediator.handle(&pod).await.unwrap();

        assert_eq!(h.cluster.count("pod_logs"), 0);
        assert_eq!(outcome.action, Some(actions::DELETE_POD));
        assert!(outcome
            .text
            .contains("mirror `registry.example.com/app:1.0` via `mirror.example.com/`"));
    }

    #[tokio::test]
    async fn test_namespace_and_annotation_gates() {
        let h = Harness::new();
        let remediator = h.remediator(Mode::Fix);

        let elsewhere = deployment_pod("other", "p1", "web", vec![waiting("app", "CrashLoopBackOff")]);
        assert!(remediator.handle(&elsewhere).await.is_none());

        let mut excluded = crash_pod();
        excluded.metadata.annotations = Some(BTreeMap::from([(
            "auto-agent.io/exclude".to_string(),
            "true".to_string(),
        )]));
        assert!(remediator.handle(&excluded).await.is_none());

        assert!(h.cluster.calls().is_empty());
        assert_eq!(h.counters.total_incidents(), 0);
    }

    #[tokio::test]
    async fn test_require_approval_downgrades_to_suggest() {
        let h = Harness::new();
        h.policies.update(
            "ns1",
            vec![policy(
                "ns1",
                "web",
                json!({
                    "targetSelector": {"matchLabels": {"app": "web"}},
                    "actions": {"restartStuckPods": true},
                    "safety": {"requireApproval": true}
                }),
            )],
        );

        let outcome = h.remediator(Mode::Fix).handle(&crash_pod()).await.unwrap();

        assert_eq!(outcome.mode, Mode::Suggest);
        assert_eq!(h.cluster.count("delete_pod"), 0);
        assert!(outcome.text.contains("_Held back_: policy web requires approval"));
    }

    #[tokio::test]
    async fn test_restart_stuck_pods_disabled_suppresses_delete() {
        let h = Harness::new();
        h.policies.update(
            "ns1",
            vec![policy(
                "ns1",
                "web",
                json!({"targetSelector": {"matchLabels": {"app": "web"}}}),
            )],
        );

        let outcome = h.remediator(Mode::Fix).handle(&crash_pod()).await.unwrap();

        assert_eq!(outcome.mode, Mode::Suggest);
        assert_eq!(h.cluster.count("delete_pod"), 0);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat_delete() {
        let h = Harness::new();
        h.policies.update(
            "ns1",
            vec![policy(
                "ns1",
                "web",
                json!({
                    "targetSelector": {"matchLabels": {"app": "web"}},
                    "actions": {"restartStuckPods": true},
                    "safety": {"cooldown": "5m"}
                }),
            )],
        );
        let remediator = h.remediator(Mode::Fix);

        remediator.handle(&crash_pod()).await.unwrap();
        let second = remediator.handle(&crash_pod()).await.unwrap();

        assert_eq!(h.cluster.count("delete_pod"), 1);
        assert_eq!(second.mode, Mode::Suggest);
        assert!(second.suppressed.unwrap().starts_with("cooldown active"));
        assert_eq!(
            h.counters
                .incident_count("CrashLoopBackOff", "ns1", "deployment-web"),
            2
        );
    }

    #[tokio::test]
    async fn test_global_rate_limit_suppresses_delete() {
        let h = Harness::new();
        let remediator = h.remediator_with(Mode::Fix, ActionLimiter::new(1));

        remediator.handle(&crash_pod()).await.unwrap();
        let other = deployment_pod("ns1", "p2", "api", vec![waiting("app", "CrashLoopBackOff")]);
        let outcome = remediator.handle(&other).await.unwrap();

        assert_eq!(h.cluster.count("delete_pod"), 1);
        assert_eq!(outcome.suppressed.as_deref(), Some("agent reached its limit of 1 actions per 10m"));
    }
}
