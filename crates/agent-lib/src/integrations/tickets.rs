//! Ticketing backends: GitHub Issues and Jira

use super::{ChannelError, Ticket, Ticketer};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("remediation-agent/", env!("CARGO_PKG_VERSION"));

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct IssueSearch {
    #[serde(default)]
    items: Vec<Issue>,
}

#[derive(Debug, Deserialize)]
struct Issue {
    number: u64,
    html_url: String,
}

/// Files incidents as GitHub issues, keyed by the record key in the title
pub struct GitHubIssues {
    api_base: String,
    token: String,
    repo: String,
    client: reqwest::Client,
}

impl GitHubIssues {
    pub fn new(token: impl Into<String>, repo: impl Into<String>) -> Self {
        Self::with_api_base(GITHUB_API, token, repo)
    }

    /// Point at a different API root, e.g. GitHub Enterprise
    pub fn with_api_base(api_base: impl Into<String>, token: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            repo: repo.into(),
            client: http_client(),
        }
    }

    async fn find_open(&self, repo: &str, key: &str) -> Result<Option<Issue>, ChannelError> {
        let query = format!("repo:{repo} is:issue is:open in:title \"{key}\"");
        let response = self
            .client
            .get(format!("{}/search/issues", self.api_base))
            .bearer_auth(&self.token)
            .query(&[("q", query.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChannelError::from_response("github", response).await);
        }
        let found: IssueSearch = response.json().await?;
        Ok(found.items.into_iter().next())
    }
}

#[async_trait]
impl Ticketer for GitHubIssues {
    async fn create_or_update(&self, key: &str, ticket: &Ticket) -> Result<String, ChannelError> {
        let repo = if ticket.project.is_empty() {
            self.repo.as_str()
        } else {
            ticket.project.as_str()
        };
        if self.token.is_empty() || repo.is_empty() {
            return Err(ChannelError::NotConfigured("GITHUB_TOKEN/GITHUB_REPO"));
        }

        if let Some(existing) = self.find_open(repo, key).await? {
            let response = self
                .client
                .post(format!(
                    "{}/repos/{repo}/issues/{}/comments",
                    self.api_base, existing.number
                ))
                .bearer_auth(&self.token)
                .json(&json!({ "body": ticket.body }))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(ChannelError::from_response("github", response).await);
            }
            debug!(issue = existing.number, "Commented on existing incident issue");
            return Ok(existing.html_url);
        }

        let response = self
            .client
            .post(format!("{}/repos/{repo}/issues", self.api_base))
            .bearer_auth(&self.token)
            .json(&json!({
                "title": format!("{} [{key}]", ticket.title),
                "body": ticket.body,
                "labels": ticket.labels,
                "assignees": ticket.assignees,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChannelError::from_response("github", response).await);
        }
        let created: Issue = response.json().await?;
        info!(issue = created.number, repo = %repo, "Opened incident issue");
        Ok(created.html_url)
    }
}

#[derive(Debug, Deserialize)]
struct JiraSearch {
    #[serde(default)]
    issues: Vec<JiraIssue>,
}

#[derive(Debug, Deserialize)]
struct JiraIssue {
    key: String,
}

/// Files incidents as Jira tasks, keyed by a label derived from the record key
pub struct Jira {
    base_url: String,
    email: String,
    token: String,
    project: String,
    client: reqwest::Client,
}

impl Jira {
    pub fn new(
        base_url: impl Into<String>,
        email: impl Into<String>,
        token: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            email: email.into(),
            token: token.into(),
            project: project.into(),
            client: http_client(),
        }
    }

    /// Jira labels cannot contain spaces; slashes are kept readable as dashes
    fn key_label(key: &str) -> String {
        format!("auto-agent-{}", key.replace(['/', ' '], "-"))
    }

    fn browse_url(&self, issue_key: &str) -> String {
        format!("{}/browse/{issue_key}", self.base_url)
    }
}

#[async_trait]
impl Ticketer for Jira {
    async fn create_or_update(&self, key: &str, ticket: &Ticket) -> Result<String, ChannelError> {
        let project = if ticket.project.is_empty() {
            self.project.as_str()
        } else {
            ticket.project.as_str()
        };
        if self.base_url.is_empty() || self.token.is_empty() || project.is_empty() {
            return Err(ChannelError::NotConfigured("JIRA_URL/JIRA_TOKEN/JIRA_PROJECT"));
        }
        let label = Self::key_label(key);

        let jql = format!("project = \"{project}\" AND labels = \"{label}\" AND statusCategory != Done");
        let response = self
            .client
            .get(format!("{}/rest/api/2/search", self.base_url))
            .basic_auth(&self.email, Some(&self.token))
            .query(&[("jql", jql.as_str()), ("maxResults", "1")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChannelError::from_response("jira", response).await);
        }
        let found: JiraSearch = response.json().await?;

        if let Some(existing) = found.issues.into_iter().next() {
            let response = self
                .client
                .post(format!(
                    "{}/rest/api/2/issue/{}/comment",
                    self.base_url, existing.key
                ))
                .basic_auth(&self.email, Some(&self.token))
                .json(&json!({ "body": ticket.body }))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(ChannelError::from_response("jira", response).await);
            }
            return Ok(self.browse_url(&existing.key));
        }

        let mut labels = ticket.labels.clone();
        labels.push(label);
        let mut fields = json!({
            "project": { "key": project },
            "summary": ticket.title,
            "description": ticket.body,
            "issuetype": { "name": "Task" },
            "labels": labels,
        });
        if let Some(assignee) = ticket.assignees.first() {
            fields["assignee"] = json!({ "name": assignee });
        }

        let response = self
            .client
            .post(format!("{}/rest/api/2/issue", self.base_url))
            .basic_auth(&self.email, Some(&self.token))
            .json(&json!({ "fields": fields }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChannelError::from_response("jira", response).await);
        }
        let created: JiraIssue = response.json().await?;
        info!(issue = %created.key, "Opened incident ticket");
        Ok(self.browse_url(&created.key))
    }
}
