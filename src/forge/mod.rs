//! The abstract forge client (§6 "Forge operations"). `ForgeClient` is an
//! `async_trait` object-safe interface, generalizing the way the teacher
//! keeps forge calls as plain async `reqwest`-based free functions in
//! `factory::github` into a trait so `coordinator`/`poller`/`webhook` depend
//! on an interface, not a concrete GitHub client.

pub mod github;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ForgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub head_sha: String,
    pub base_branch: String,
    pub head_branch: String,
    pub is_draft: bool,
}

#[derive(Debug, Clone)]
pub struct PrDetails {
    pub state: PrState,
    pub merged_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewEvent {
    Comment,
    Approve,
    RequestChanges,
}

impl ReviewEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewEvent::Comment => "COMMENT",
            ReviewEvent::Approve => "APPROVE",
            ReviewEvent::RequestChanges => "REQUEST_CHANGES",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InlineComment {
    pub path: String,
    pub line: u32,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct ReviewThread {
    pub id: String,
    pub path: String,
    pub line: u32,
    pub body: String,
    pub is_resolved: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReviewExistence {
    pub exists: bool,
    pub dismissed: bool,
}

/// One method per operation named in §6. Object-safe via `async_trait` so
/// `Arc<dyn ForgeClient>` can be shared across the coordinator, poller, and
/// webhook ingress.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    async fn list_open_prs(&self, owner: &str, repo: &str) -> Result<Vec<PullRequest>, ForgeError>;
    async fn get_pr_details(&self, owner: &str, repo: &str, number: u64) -> Result<PrDetails, ForgeError>;
    async fn get_pr_diff(&self, owner: &str, repo: &str, number: u64) -> Result<String, ForgeError>;
    async fn get_pr_body(&self, owner: &str, repo: &str, number: u64) -> Result<String, ForgeError>;
    async fn update_pr_body(&self, owner: &str, repo: &str, number: u64, body: &str) -> Result<(), ForgeError>;
    async fn get_pr_labels(&self, owner: &str, repo: &str, number: u64) -> Result<Vec<String>, ForgeError>;
    async fn add_labels(&self, owner: &str, repo: &str, number: u64, labels: &[String]) -> Result<(), ForgeError>;
    async fn remove_labels(&self, owner: &str, repo: &str, number: u64, labels: &[String]) -> Result<(), ForgeError>;

    async fn find_existing_comment(&self, owner: &str, repo: &str, number: u64, tag: &str) -> Result<Option<String>, ForgeError>;
    async fn post_comment(&self, owner: &str, repo: &str, number: u64, body: &str) -> Result<String, ForgeError>;
    async fn update_comment(&self, owner: &str, repo: &str, comment_id: &str, body: &str) -> Result<(), ForgeError>;
    async fn delete_comment(&self, owner: &str, repo: &str, comment_id: &str) -> Result<(), ForgeError>;
    async fn comment_exists(&self, owner: &str, repo: &str, comment_id: &str) -> Result<bool, ForgeError>;

    async fn post_review(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
        commit_id: &str,
        inline_comments: &[InlineComment],
        event: ReviewEvent,
    ) -> Result<String, ForgeError>;
    async fn review_exists(&self, owner: &str, repo: &str, number: u64, review_id: &str) -> Result<ReviewExistence, ForgeError>;
    async fn get_review_threads(&self, owner: &str, repo: &str, number: u64) -> Result<Vec<ReviewThread>, ForgeError>;
    async fn resolve_review_thread(&self, owner: &str, repo: &str, thread_id: &str) -> Result<(), ForgeError>;

    async fn get_clone_url(&self, owner: &str, repo: &str) -> Result<String, ForgeError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubPullRequestPayload {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub draft: bool,
    pub head: GithubRef,
    pub base: GithubRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubRef {
    pub sha: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
}
