//! Incident persistence and escalation
//!
//! Every classified incident goes through the same two steps: the record is
//! persisted once, then a notification carrying its location is published,
//! optionally enriched with advice and mirrored into a ticket tracker.
//! A failing step is logged and never blocks the ones after it.

use crate::integrations::{Advisor, Notifier, Ticket, Ticketer};
use crate::models::IncidentRecord;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::policy::Policy;
use crate::storage::StorageSink;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// What to ask the advisor about an incident
#[derive(Debug, Clone)]
pub struct AdvisoryRequest {
    pub title: String,
    pub context: String,
}

/// A notification about a persisted incident
#[derive(Debug, Clone)]
pub struct Notice<'a> {
    pub record: &'a IncidentRecord,
    /// Workload label for counters, e.g. `deployment-web`
    pub workload: &'a str,
    pub text: String,
    pub advisory: Option<AdvisoryRequest>,
    /// First policy matching the incident's workload
    pub policy: Option<&'a Policy>,
}

/// Result of publishing a notice
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub text: String,
    pub notified: bool,
    pub ticket_url: Option<String>,
}

pub struct EscalationPipeline {
    sink: Arc<dyn StorageSink>,
    notifier: Arc<dyn Notifier>,
    advisor: Option<Arc<dyn Advisor>>,
    ticketers: HashMap<String, Arc<dyn Ticketer>>,
    counters: AgentMetrics,
    logger: StructuredLogger,
}

impl EscalationPipeline {
    pub fn new(
        sink: Arc<dyn StorageSink>,
        notifier: Arc<dyn Notifier>,
        counters: AgentMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            sink,
            notifier,
            advisor: None,
            ticketers: HashMap::new(),
            counters,
            logger,
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn Advisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    /// Register a tracker under the provider name policies use, e.g. `github`
    pub fn with_ticketer(mut self, provider: &str, ticketer: Arc<dyn Ticketer>) -> Self {
        self.ticketers.insert(provider.to_ascii_lowercase(), ticketer);
        self
    }

    /// Post a plain message outside of any incident
    pub async fn announce(&self, text: &str, channel: Option<&str>) -> bool {
        match self.notifier.post(text, channel).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to post notification");
                false
            }
        }
    }

    /// Persist the record under its storage key.
    ///
    /// Returns where it was written, or `unavailable (<error>)` when the sink
    /// failed, so the caller can still notify.
    pub async fn persist(&self, record: &IncidentRecord) -> String {
        let key = record.storage_key();
        let location = match self.sink.save(&key, record).await {
            Ok(location) => location,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to persist incident record");
                format!("unavailable ({e})")
            }
        };
        self.logger.log_incident(
            &record.namespace,
            &record.workload,
            &record.pod,
            &record.container,
            record.reason.as_str(),
            &location,
        );
        location
    }

    /// Notify about an incident, count it and file a ticket when its policy asks for one
    pub async fn publish(&self, notice: Notice<'_>) -> Delivery {
        let record = notice.record;
        let mut text = notice.text;

        if let (Some(advisor), Some(request)) = (&self.advisor, &notice.advisory) {
            if advisor.enabled() {
                match advisor.diagnose(&request.title, &request.context).await {
                    Ok(advice) if !advice.trim().is_empty() => {
                        text.push_str(&format!("\n_Advice_: {}\n", advice.trim()));
                    }
                    Ok(_) => debug!("Advisor returned no advice"),
                    Err(e) => warn!(error = %e, "Advisor request failed"),
                }
            }
        }

        let channel = notice
            .policy
            .map(|p| p.spec.escalation.slack_channel.as_str())
            .filter(|c| !c.is_empty());
        let notified = self.announce(&text, channel).await;

        self.counters
            .increment_incident(record.reason.as_str(), &record.namespace, notice.workload);

        let ticket_url = match notice.policy {
            Some(policy) => self.file_ticket(record, policy, &text).await,
            None => None,
        };

        Delivery {
            text,
            notified,
            ticket_url,
        }
    }

    async fn file_ticket(&self, record: &IncidentRecord, policy: &Policy, body: &str) -> Option<String> {
        let ticketing = &policy.spec.escalation.ticketing;
        let provider = ticketing.provider.trim().to_ascii_lowercase();
        if provider.is_empty() {
            return None;
        }
        let Some(ticketer) = self.ticketers.get(&provider) else {
            debug!(provider = %provider, policy = %policy.name, "No ticketing client configured for provider");
            return None;
        };

        let mut labels = ticketing.labels.clone();
        labels.push("auto-agent".to_string());
        labels.push(record.reason.as_str().to_string());
        let ticket = Ticket {
            project: ticketing.project_or_repo.clone(),
            title: format!("{} on {}/{}", record.reason, record.namespace, record.pod),
            body: body.to_string(),
            labels,
            assignees: ticketing.assignees.clone(),
        };

        match ticketer.create_or_update(&record.storage_key(), &ticket).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(provider = %provider, error = %e, "Failed to file incident ticket");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IncidentReason;
    use crate::testing::{policy, FailingSink, MemorySink, RecordingNotifier, RecordingTicketer, StaticAdvisor};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn record() -> IncidentRecord {
        IncidentRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            namespace: "ns1".to_string(),
            workload: "deployment-x".to_string(),
            pod: "p1".to_string(),
            container: "c1".to_string(),
            node: "node-a".to_string(),
            reason: IncidentReason::OomKilled,
            message: "Container OOMKilled".to_string(),
            last_logs: String::new(),
            events: vec![],
            extras: BTreeMap::new(),
        }
    }

    fn notice<'a>(record: &'a IncidentRecord, text: &str, policy: Option<&'a Policy>) -> Notice<'a> {
        Notice {
            record,
            workload: "deployment-x",
            text: text.to_string(),
            advisory: Some(AdvisoryRequest {
                title: "Container OOMKilled".to_string(),
                context: String::new(),
            }),
            policy,
        }
    }

    #[tokio::test]
    async fn test_persist_uses_storage_key() {
        let sink = Arc::new(MemorySink::default());
        let pipeline = EscalationPipeline::new(
            sink.clone(),
            Arc::new(RecordingNotifier::default()),
            AgentMetrics::new(),
            StructuredLogger::new("test"),
        );

        let location = pipeline.persist(&record()).await;

        assert_eq!(location, "mem://ns1/deployment-x/OOMKilled/2024-05-01/p1");
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_failure_still_notifies() {
        let notifier = Arc::new(RecordingNotifier::default());
        let counters = AgentMetrics::new();
        let pipeline = EscalationPipeline::new(
            Arc::new(FailingSink),
            notifier.clone(),
            counters.clone(),
            StructuredLogger::new("test"),
        );
        let record = record();

        let location = pipeline.persist(&record).await;
        assert!(location.starts_with("unavailable ("));
        assert!(location.contains("read-only file system"));

        let delivery = pipeline
            .publish(notice(&record, &format!("Saved: `{location}`"), None))
            .await;

        assert!(delivery.notified);
        assert_eq!(notifier.messages().len(), 1);
        assert!(notifier.messages()[0].contains("unavailable ("));
        assert_eq!(counters.incident_count("OOMKilled", "ns1", "deployment-x"), 1);
    }

    #[tokio::test]
    async fn test_advice_appended_only_when_present() {
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = EscalationPipeline::new(
            Arc::new(MemorySink::default()),
            notifier.clone(),
            AgentMetrics::new(),
            StructuredLogger::new("test"),
        )
        .with_advisor(Arc::new(StaticAdvisor("Raise the memory limit.")));
        let record = record();

        let delivery = pipeline.publish(notice(&record, "body", None)).await;
        assert!(delivery.text.ends_with("_Advice_: Raise the memory limit.\n"));

        let silent = EscalationPipeline::new(
            Arc::new(MemorySink::default()),
            notifier.clone(),
            AgentMetrics::new(),
            StructuredLogger::new("test"),
        )
        .with_advisor(Arc::new(StaticAdvisor("   ")));
        let delivery = silent.publish(notice(&record, "body", None)).await;
        assert_eq!(delivery.text, "body");
    }

    #[tokio::test]
    async fn test_policy_channel_and_ticket() {
        let notifier = Arc::new(RecordingNotifier::default());
        let tickets = Arc::new(RecordingTicketer::default());
        let pipeline = EscalationPipeline::new(
            Arc::new(MemorySink::default()),
            notifier.clone(),
            AgentMetrics::new(),
            StructuredLogger::new("test"),
        )
        .with_ticketer("github", tickets.clone());
        let policy = policy(
            "ns1",
            "web",
            json!({
                "escalation": {
                    "slackChannel": "#web-oncall",
                    "ticketing": {"provider": "GitHub", "projectOrRepo": "acme/web", "labels": ["sev2"]}
                }
            }),
        );
        let record = record();

        let delivery = pipeline.publish(notice(&record, "body", Some(&policy))).await;

        assert_eq!(notifier.channels(), vec![Some("#web-oncall".to_string())]);
        assert_eq!(delivery.ticket_url.as_deref(), Some("https://tracker.example.com/1"));
        let filed = tickets.tickets.lock().unwrap();
        assert_eq!(filed[0].0, "ns1/deployment-x/OOMKilled/2024-05-01/p1");
        assert_eq!(filed[0].1.project, "acme/web");
        assert_eq!(filed[0].1.labels, vec!["sev2", "auto-agent", "OOMKilled"]);
    }

    #[tokio::test]
    async fn test_unknown_provider_files_nothing() {
        let tickets = Arc::new(RecordingTicketer::default());
        let pipeline = EscalationPipeline::new(
            Arc::new(MemorySink::default()),
            Arc::new(RecordingNotifier::default()),
            AgentMetrics::new(),
            StructuredLogger::new("test"),
        )
        .with_ticketer("github", tickets.clone());
        let policy = policy("ns1", "web", json!({"escalation": {"ticketing": {"provider": "jira"}}}));
        let record = record();

        let delivery = pipeline.publish(notice(&record, "body", Some(&policy))).await;

        assert!(delivery.ticket_url.is_none());
        assert!(tickets.tickets.lock().unwrap().is_empty());
    }
}
