//! GitOps change requests: GitHub pull requests and GitLab merge requests

use super::{ChannelError, GitOps, GitOpsChange};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::info;

const GITHUB_API: &str = "https://api.github.com";
const GITLAB_API: &str = "https://gitlab.com/api/v4";

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(20))
        .user_agent(concat!("remediation-agent/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

async fn ensure_success(service: &'static str, response: reqwest::Response) -> Result<reqwest::Response, ChannelError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ChannelError::from_response(service, response).await)
    }
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    html_url: String,
}

/// Opens pull requests on a GitHub repository
pub struct GitHubPulls {
    api_base: String,
    token: String,
    repo: String,
    base_branch: String,
    client: reqwest::Client,
}

impl GitHubPulls {
    pub fn new(token: impl Into<String>, repo: impl Into<String>, base_branch: impl Into<String>) -> Self {
        Self::with_api_base(GITHUB_API, token, repo, base_branch)
    }

    pub fn with_api_base(
        api_base: impl Into<String>,
        token: impl Into<String>,
        repo: impl Into<String>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            repo: repo.into(),
            base_branch: base_branch.into(),
            client: http_client(),
        }
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{path}", self.api_base, self.repo)
    }
}

#[async_trait]
impl GitOps for GitHubPulls {
    async fn open_pr(&self, change: &GitOpsChange) -> Result<String, ChannelError> {
        if self.token.is_empty() || self.repo.is_empty() {
            return Err(ChannelError::NotConfigured("GITHUB_TOKEN/GITHUB_REPO"));
        }

        let base: GitRef = ensure_success(
            "github",
            self.client
                .get(self.repo_url(&format!("git/ref/heads/{}", self.base_branch)))
                .bearer_auth(&self.token)
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;

        ensure_success(
            "github",
            self.client
                .post(self.repo_url("git/refs"))
                .bearer_auth(&self.token)
                .json(&json!({
                    "ref": format!("refs/heads/{}", change.branch),
                    "sha": base.object.sha,
                }))
                .send()
                .await?,
        )
        .await?;

        ensure_success(
            "github",
            self.client
                .put(self.repo_url(&format!("contents/{}", change.file_path)))
                .bearer_auth(&self.token)
                .json(&json!({
                    "message": change.title,
                    "content": STANDARD.encode(change.content.as_bytes()),
                    "branch": change.branch,
                }))
                .send()
                .await?,
        )
        .await?;

        let pr: PullRequest = ensure_success(
            "github",
            self.client
                .post(self.repo_url("pulls"))
                .bearer_auth(&self.token)
                .json(&json!({
                    "title": change.title,
                    "body": change.body,
                    "head": change.branch,
                    "base": self.base_branch,
                }))
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;

        info!(url = %pr.html_url, "Opened pull request");
        Ok(pr.html_url)
    }
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    web_url: String,
}

/// Opens merge requests on a GitLab project
pub struct GitLabMerges {
    api_base: String,
    token: String,
    project: String,
    base_branch: String,
    client: reqwest::Client,
}

impl GitLabMerges {
    pub fn new(token: impl Into<String>, project: impl Into<String>, base_branch: impl Into<String>) -> Self {
        Self::with_api_base(GITLAB_API, token, project, base_branch)
    }

    pub fn with_api_base(
        api_base: impl Into<String>,
        token: impl Into<String>,
        project: impl Into<String>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            project: project.into(),
            base_branch: base_branch.into(),
            client: http_client(),
        }
    }

    /// `group/project` must be URL-encoded as a single path segment
    fn project_url(&self, path: &str) -> String {
        let id: String = url::form_urlencoded::byte_serialize(self.project.as_bytes()).collect();
        format!("{}/projects/{id}/{path}", self.api_base)
    }
}

#[async_trait]
impl GitOps for GitLabMerges {
    async fn open_pr(&self, change: &GitOpsChange) -> Result<String, ChannelError> {
        if self.token.is_empty() || self.project.is_empty() {
            return Err(ChannelError::NotConfigured("GITLAB_TOKEN/GITLAB_REPO"));
        }

        ensure_success(
            "gitlab",
            self.client
                .post(self.project_url("repository/commits"))
                .header("PRIVATE-TOKEN", &self.token)
                .json(&json!({
                    "branch": change.branch,
                    "start_branch": self.base_branch,
                    "commit_message": change.title,
                    "actions": [{
                        "action": "create",
                        "file_path": change.file_path,
                        "content": change.content,
                    }],
                }))
                .send()
                .await?,
        )
        .await?;

        let mr: MergeRequest = ensure_success(
            "gitlab",
            self.client
                .post(self.project_url("merge_requests"))
                .header("PRIVATE-TOKEN", &self.token)
                .json(&json!({
                    "source_branch": change.branch,
                    "target_branch": self.base_branch,
                    "title": change.title,
                    "description": change.body,
                    "remove_source_branch": true,
                }))
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;

        info!(url = %mr.web_url, "Opened merge request");
        Ok(mr.web_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn change() -> GitOpsChange {
        GitOpsChange {
            file_path: "remediations/ns1/deployment-x/memory.yaml".to_string(),
            content: "memory: 615Mi\n".to_string(),
            title: "Raise memory for ns1/deployment/x".to_string(),
            body: "OOMKilled".to_string(),
            branch: "auto-agent/oom-ns1-x".to_string(),
        }
    }

    #[tokio::test]
    async fn test_github_pull_request_flow() {
        let mut server = mockito::Server::new_async().await;
        let base = server
            .mock("GET", "/repos/acme/deploy/git/ref/heads/main")
            .with_status(200)
            .with_body(r#"{"ref":"refs/heads/main","object":{"sha":"abc123","type":"commit"}}"#)
            .create_async()
            .await;
        let branch = server
            .mock("POST", "/repos/acme/deploy/git/refs")
            .match_body(Matcher::Json(serde_json::json!({
                "ref": "refs/heads/auto-agent/oom-ns1-x",
                "sha": "abc123"
            })))
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;
        let file = server
            .mock("PUT", "/repos/acme/deploy/contents/remediations/ns1/deployment-x/memory.yaml")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "content": "bWVtb3J5OiA2MTVNaQo=",
                "branch": "auto-agent/oom-ns1-x"
            })))
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;
        let pull = server
            .mock("POST", "/repos/acme/deploy/pulls")
            .with_status(201)
            .with_body(r#"{"number":5,"html_url":"https://github.com/acme/deploy/pull/5"}"#)
            .create_async()
            .await;

        let gitops = GitHubPulls::with_api_base(server.url(), "tok", "acme/deploy", "main");
        let url = gitops.open_pr(&change()).await.unwrap();

        assert_eq!(url, "https://github.com/acme/deploy/pull/5");
        base.assert_async().await;
        branch.assert_async().await;
        file.assert_async().await;
        pull.assert_async().await;
    }

    #[tokio::test]
    async fn test_github_stops_on_failed_step() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/acme/deploy/git/ref/heads/main")
            .with_status(404)
            .with_body("Not Found")
            .create_async()
            .await;

        let gitops = GitHubPulls::with_api_base(server.url(), "tok", "acme/deploy", "main");
        assert!(matches!(
            gitops.open_pr(&change()).await,
            Err(ChannelError::Rejected { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_gitlab_merge_request_flow() {
        let mut server = mockito::Server::new_async().await;
        let commit = server
            .mock("POST", "/projects/acme%2Fdeploy/repository/commits")
            .match_header("private-token", "tok")
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;
        let mr = server
            .mock("POST", "/projects/acme%2Fdeploy/merge_requests")
            .with_status(201)
            .with_body(r#"{"iid":1,"web_url":"https://gitlab.com/acme/deploy/-/merge_requests/1"}"#)
            .create_async()
            .await;

        let gitops = GitLabMerges::with_api_base(server.url(), "tok", "acme/deploy", "main");
        let url = gitops.open_pr(&change()).await.unwrap();

        assert_eq!(url, "https://gitlab.com/acme/deploy/-/merge_requests/1");
        commit.assert_async().await;
        mr.assert_async().await;
    }

    #[tokio::test]
    async fn test_unconfigured_clients_refuse() {
        let gh = GitHubPulls::new("", "acme/deploy", "main");
        let gl = GitLabMerges::new("tok", "", "main");
        assert!(matches!(gh.open_pr(&change()).await, Err(ChannelError::NotConfigured(_))));
        assert!(matches!(gl.open_pr(&change()).await, Err(ChannelError::NotConfigured(_))));
    }
}
