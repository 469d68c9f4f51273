//! Outbound integrations: chat, advisory, ticketing and GitOps
//!
//! Every integration sits behind a small trait so the escalation pipeline can
//! be wired with whichever backends are configured at startup.

mod gitops;
mod llm;
mod slack;
mod tickets;

pub use gitops::{GitHubPulls, GitLabMerges};
pub use llm::LlmAdvisor;
pub use slack::SlackNotifier;
pub use tickets::{GitHubIssues, Jira};

use async_trait::async_trait;
use thiserror::Error;

/// Errors from outbound integrations
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("integration not configured: {0}")]
    NotConfigured(&'static str),

    #[error("{service} returned {status}: {body}")]
    Rejected {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("unexpected {service} response: {detail}")]
    InvalidResponse {
        service: &'static str,
        detail: String,
    },
}

impl ChannelError {
    pub(crate) async fn from_response(service: &'static str, response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ChannelError::Rejected {
            service,
            status,
            body,
        }
    }
}

/// Chat notification target
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post to the default channel, or to `channel` when given.
    /// An unconfigured notifier succeeds without sending.
    async fn post(&self, text: &str, channel: Option<&str>) -> Result<(), ChannelError>;
}

/// Incident diagnosis assistant
#[async_trait]
pub trait Advisor: Send + Sync {
    fn enabled(&self) -> bool;

    /// Short advice for an incident; empty when the model has nothing to say
    async fn diagnose(&self, title: &str, context: &str) -> Result<String, ChannelError>;
}

/// Ticket to open or update for an incident
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ticket {
    /// Repository or project to file in; empty selects the client's default
    pub project: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
}

/// Issue tracker
#[async_trait]
pub trait Ticketer: Send + Sync {
    /// Open a ticket for `key`, or comment on the open one already carrying it.
    /// Returns the ticket URL.
    async fn create_or_update(&self, key: &str, ticket: &Ticket) -> Result<String, ChannelError>;
}

/// A single-file change proposed through a pull or merge request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GitOpsChange {
    pub file_path: String,
    pub content: String,
    pub title: String,
    pub body: String,
    pub branch: String,
}

/// Source-control host accepting change requests
#[async_trait]
pub trait GitOps: Send + Sync {
    /// Commit the change on a new branch and open a request. Returns its URL.
    async fn open_pr(&self, change: &GitOpsChange) -> Result<String, ChannelError>;
}
