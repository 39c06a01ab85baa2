//! GitHub-backed tracker implementation.
//!
//! Tickets are created through the REST issues endpoint; board lookup
//! and attachment go through the GraphQL Projects V2 API. Board numbers
//! are tried as user-owned first, then organization-owned.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::errors::PublishError;
use crate::models::{GeneratedIssue, PublishedIssue};
use crate::publisher::Tracker;

const GITHUB_API_BASE: &str = "https://api.github.com";
const GITHUB_API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "blueprint";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const BOARD_QUERY_USER: &str = r#"query($owner: String!, $projectNumber: Int!) {
  user(login: $owner) {
    projectV2(number: $projectNumber) { id }
  }
}"#;

const BOARD_QUERY_ORG: &str = r#"query($owner: String!, $projectNumber: Int!) {
  organization(login: $owner) {
    projectV2(number: $projectNumber) { id }
  }
}"#;

const ATTACH_MUTATION: &str = r#"mutation($projectId: ID!, $contentId: ID!) {
  addProjectV2ItemById(input: {projectId: $projectId, contentId: $contentId}) {
    item { id }
  }
}"#;

/// Response from the create-issue endpoint (subset of fields).
#[derive(Debug, Deserialize)]
struct CreatedIssueResponse {
    id: i64,
    number: i64,
    html_url: String,
    #[serde(default)]
    node_id: String,
}

#[derive(Debug)]
pub struct GitHubTracker {
    http: reqwest::Client,
    token: String,
    owner: String,
    repo: String,
    api_base: String,
}

impl GitHubTracker {
    pub fn new(
        token: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Result<Self, PublishError> {
        let token = token.into();
        let owner = owner.into();
        let repo = repo.into();
        if token.is_empty() {
            return Err(PublishError::MissingConfig("GITHUB_TOKEN"));
        }
        if owner.is_empty() {
            return Err(PublishError::MissingConfig("GITHUB_OWNER"));
        }
        if repo.is_empty() {
            return Err(PublishError::MissingConfig("GITHUB_REPO"));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(GitHubTracker {
            http,
            token,
            owner,
            repo,
            api_base: GITHUB_API_BASE.to_string(),
        })
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .header("User-Agent", USER_AGENT)
    }

    /// Run one GraphQL request. A non-empty top-level `errors` array is
    /// a failure even under HTTP 200.
    async fn graphql(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<serde_json::Value, PublishError> {
        let url = format!("{}/graphql", self.api_base);
        let response = self
            .request(&url)
            .json(&json!({"query": query, "variables": variables}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = detail_from_body(&response.text().await.unwrap_or_default());
            return Err(PublishError::Api {
                status: status.as_u16(),
                detail,
            });
        }
        let body: serde_json::Value = response.json().await?;
        if let Some(errors) = body.get("errors")
            && errors.as_array().is_some_and(|a| !a.is_empty())
        {
            return Err(PublishError::Api {
                status: status.as_u16(),
                detail: errors.to_string(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl Tracker for GitHubTracker {
    async fn create_issue(&self, issue: &GeneratedIssue) -> Result<PublishedIssue, PublishError> {
        let url = format!("{}/repos/{}/{}/issues", self.api_base, self.owner, self.repo);
        let response = self
            .request(&url)
            .json(&issue_payload(issue))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = detail_from_body(&response.text().await.unwrap_or_default());
            return Err(PublishError::Api {
                status: status.as_u16(),
                detail,
            });
        }
        let created: CreatedIssueResponse = response.json().await?;
        Ok(PublishedIssue {
            title: issue.title.clone(),
            id: created.id,
            number: created.number,
            url: created.html_url,
            node_id: created.node_id,
        })
    }

    async fn resolve_board_id(&self, number: u32) -> Option<String> {
        let variables = json!({"owner": self.owner, "projectNumber": number});
        for (scope, query) in [("user", BOARD_QUERY_USER), ("organization", BOARD_QUERY_ORG)] {
            match self.graphql(query, variables.clone()).await {
                Ok(body) => {
                    if let Some(id) = board_id_from_response(&body, scope) {
                        return Some(id);
                    }
                }
                Err(e) => warn!("Board #{} lookup as {} failed: {}", number, scope, e),
            }
        }
        None
    }

    async fn attach_to_board(&self, board_id: &str, node_id: &str) -> Option<String> {
        let variables = json!({"projectId": board_id, "contentId": node_id});
        match self.graphql(ATTACH_MUTATION, variables).await {
            Ok(body) => {
                let item_id = item_id_from_response(&body);
                if item_id.is_none() {
                    warn!("Attach mutation for {} returned no item id", node_id);
                }
                item_id
            }
            Err(e) => {
                warn!("Failed to attach {} to board: {}", node_id, e);
                None
            }
        }
    }
}

/// REST payload for issue creation. Body and labels are included only
/// when present, matching the endpoint's optional fields.
fn issue_payload(issue: &GeneratedIssue) -> serde_json::Value {
    let mut payload = json!({"title": issue.title});
    if !issue.body.is_empty() {
        payload["body"] = json!(issue.body);
    }
    if !issue.labels.is_empty() {
        payload["labels"] = json!(issue.labels);
    }
    payload
}

/// Extract a human-readable detail from an error response body: the
/// JSON `message` field when present, otherwise the raw text.
fn detail_from_body(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| text.to_string())
}

fn board_id_from_response(body: &serde_json::Value, scope: &str) -> Option<String> {
    body.get("data")?
        .get(scope)?
        .get("projectV2")?
        .get("id")?
        .as_str()
        .map(str::to_string)
}

fn item_id_from_response(body: &serde_json::Value) -> Option<String> {
    body.get("data")?
        .get("addProjectV2ItemById")?
        .get("item")?
        .get("id")?
        .as_str()
        .map(str::to_string)
}
