//! `WebhookIngress` (§4.8): event-driven hand-off from the forge's webhook
//! deliveries into `ReviewCoordinator`, or a direct state mutation for pure
//! lifecycle events.
//!
//! Built on `axum::Router` exactly as the teacher's `swarm::callback::
//! build_router` is: `Router::new().route(...).with_state(...)`, one
//! `Arc`-shared state struct, tested with `tower::ServiceExt::oneshot`
//! against the router directly so no socket needs to be bound for unit
//! tests. The real bind-and-serve path lives in `main.rs`'s `run` command,
//! mirroring the teacher's `factory::server::start_server`
//! (`TcpListener::bind` + `axum::serve(...).with_graceful_shutdown(...)`).

use std::sync::Arc;
use std::sync::LazyLock;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use regex::Regex;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

use vigil_common::PrStatus;

use crate::config::Settings;
use crate::coordinator::{ReviewCoordinator, ReviewOverrides};
use crate::forge::{GithubPullRequestPayload, PullRequest};
use crate::state::StateStore;

type HmacSha256 = Hmac<Sha256>;

static MAX_TURNS_FLAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"--max-turns=(\d+)").unwrap());
static FOCUS_FLAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"--focus=(\S+)").unwrap());

/// Top-level envelope GitHub wraps every `pull_request`/`issue_comment`
/// webhook delivery in. Fields absent from a given event type default away
/// rather than fail deserialization, since one route handles several event
/// shapes.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub action: String,
    #[serde(default)]
    pub pull_request: Option<GithubPullRequestPayload>,
    #[serde(default)]
    pub issue: Option<IssuePayload>,
    #[serde(default)]
    pub comment: Option<CommentPayload>,
    #[serde(default)]
    pub changes: Option<ChangesPayload>,
    pub repository: RepositoryPayload,
}

#[derive(Debug, Deserialize)]
pub struct IssuePayload {
    pub number: u64,
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct CommentPayload {
    pub body: String,
    pub user: UserPayload,
}

#[derive(Debug, Deserialize)]
pub struct UserPayload {
    pub login: String,
    #[serde(default)]
    pub r#type: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangesPayload {
    #[serde(default)]
    pub title: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryPayload {
    pub full_name: String,
}

pub struct WebhookState {
    settings: Settings,
    coordinator: Arc<ReviewCoordinator>,
    state: Arc<StateStore>,
    comment_trigger: Regex,
}

impl WebhookState {
    pub fn new(settings: Settings, coordinator: Arc<ReviewCoordinator>, state: Arc<StateStore>) -> anyhow::Result<Self> {
        let comment_trigger = Regex::new(&settings.operational.comment_trigger)?;
        Ok(Self { settings, coordinator, state, comment_trigger })
    }
}

/// Builds the ingress router. Mirrors the teacher's `build_router(state)`
/// free function taking an `Arc<State>` and returning a bare `Router` the
/// caller layers middleware onto and binds.
pub fn build_router(state: Arc<WebhookState>) -> Router {
    Router::new().route("/webhook", post(webhook_handler)).with_state(state)
}

async fn webhook_handler(State(state): State<Arc<WebhookState>>, headers: HeaderMap, body: axum::body::Bytes) -> StatusCode {
    if let Some(secret) = &state.settings.webhook_secret
        && !verify_signature(secret, &headers, &body)
    {
        warn!("webhook signature verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "malformed webhook payload, dropping");
            return StatusCode::OK;
        }
    };

    let Some((owner, repo)) = event.repository.full_name.split_once('/') else {
        return StatusCode::OK;
    };
    if !state.settings.is_tracked(owner, repo) {
        return StatusCode::OK;
    }

    match classify(&event) {
        Classified::Review => handle_review(&state, owner, repo, &event).await,
        Classified::ConditionalEdited => handle_conditional_edit(&state, owner, repo, &event).await,
        Classified::Lifecycle => handle_lifecycle(&state, owner, repo, &event).await,
        Classified::Comment => handle_comment(&state, owner, repo, &event).await,
        Classified::Drop => StatusCode::OK,
    }
}

enum Classified {
    Review,
    ConditionalEdited,
    Lifecycle,
    Comment,
    Drop,
}

/// §4.8's event classification table.
fn classify(event: &WebhookEvent) -> Classified {
    match event.action.as_str() {
        "opened" | "synchronize" | "reopened" | "ready_for_review" if event.pull_request.is_some() => Classified::Review,
        "edited" if event.pull_request.is_some() && event.changes.as_ref().is_some_and(|c| c.title.is_some()) => {
            Classified::ConditionalEdited
        }
        "edited" => Classified::Drop,
        "closed" | "converted_to_draft" if event.pull_request.is_some() => Classified::Lifecycle,
        "created" if is_pr_comment(event) => Classified::Comment,
        _ => Classified::Drop,
    }
}

fn is_pr_comment(event: &WebhookEvent) -> bool {
    event.comment.is_some() && event.issue.as_ref().is_some_and(|i| i.pull_request.is_some())
}

async fn handle_review(state: &WebhookState, owner: &str, repo: &str, event: &WebhookEvent) -> StatusCode {
    let Some(payload) = &event.pull_request else { return StatusCode::OK };
    let Some(pr) = to_pull_request(owner, repo, payload) else {
        warn!("webhook pull_request payload missing required nested fields, dropping");
        return StatusCode::OK;
    };

    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        let outcome = coordinator.process_pr(&pr, false, ReviewOverrides::default()).await;
        info!(owner = %pr.owner, repo = %pr.repo, number = pr.number, outcome = ?outcome, "webhook-triggered review complete");
    });
    StatusCode::ACCEPTED
}

async fn handle_conditional_edit(state: &WebhookState, owner: &str, repo: &str, event: &WebhookEvent) -> StatusCode {
    handle_review(state, owner, repo, event).await
}

async fn handle_lifecycle(state: &WebhookState, owner: &str, repo: &str, event: &WebhookEvent) -> StatusCode {
    let Some(payload) = &event.pull_request else { return StatusCode::OK };
    let key = vigil_common::PrKey::new(owner, repo, payload.number);

    let new_status = match event.action.as_str() {
        "closed" => {
            let merged = payload_is_merged(payload);
            Some(if merged { PrStatus::Merged } else { PrStatus::Closed })
        }
        "converted_to_draft" => None, // handled via is_draft update below, no status change
        _ => None,
    };

    if state.state.get(&key).await.is_some() {
        let _ = state
            .state
            .update(&key, |s| {
                if let Some(status) = new_status {
                    s.status = status;
                    s.closed_at = Some(chrono::Utc::now());
                }
                if event.action == "converted_to_draft" {
                    s.is_draft = true;
                }
            })
            .await;
    }
    StatusCode::OK
}

fn payload_is_merged(payload: &GithubPullRequestPayload) -> bool {
    let _ = payload;
    // GitHub's `closed` action payload carries `pull_request.merged`, which
    // the shared webhook payload type doesn't currently model (§6 lists only
    // the fields the review path needs); treat every `closed` delivery as a
    // plain close and let the next poll's `getPRDetails` call upgrade it to
    // `merged` if the forge disagrees (§4.7 reconciliation already covers
    // this).
    false
}

async fn handle_comment(state: &WebhookState, owner: &str, repo: &str, event: &WebhookEvent) -> StatusCode {
    let Some(comment) = &event.comment else { return StatusCode::OK };
    let Some(issue) = &event.issue else { return StatusCode::OK };

    if comment.user.r#type.eq_ignore_ascii_case("bot") {
        return StatusCode::OK; // feedback-loop guard: never react to bot-authored comments
    }
    if !state.comment_trigger.is_match(&comment.body) {
        return StatusCode::OK;
    }

    let key = vigil_common::PrKey::new(owner, repo, issue.number);
    let Some(pr_state) = state.state.get(&key).await else { return StatusCode::OK };

    let overrides = parse_overrides(&comment.body);
    let pr = PullRequest {
        owner: owner.to_string(),
        repo: repo.to_string(),
        number: issue.number,
        title: pr_state.title.clone(),
        head_sha: pr_state.head_sha.clone(),
        base_branch: pr_state.base_branch.clone(),
        head_branch: pr_state.head_branch.clone(),
        is_draft: pr_state.is_draft,
    };

    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        let outcome = coordinator.process_pr(&pr, true, overrides).await;
        info!(owner = %pr.owner, repo = %pr.repo, number = pr.number, outcome = ?outcome, "comment-triggered review complete");
    });
    StatusCode::ACCEPTED
}

/// Parses `--max-turns=N`, `--skip-description`, `--skip-labels`,
/// `--focus=path,path` flags out of a `/review` trigger comment.
fn parse_overrides(body: &str) -> ReviewOverrides {
    let max_turns = MAX_TURNS_FLAG.captures(body).and_then(|c| c.get(1)).and_then(|m| m.as_str().parse().ok());
    let focus_paths = FOCUS_FLAG
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect());

    ReviewOverrides {
        max_turns,
        focus_paths,
        skip_description: body.contains("--skip-description"),
        skip_labels: body.contains("--skip-labels"),
    }
}

fn to_pull_request(owner: &str, repo: &str, payload: &GithubPullRequestPayload) -> Option<PullRequest> {
    Some(PullRequest {
        owner: owner.to_string(),
        repo: repo.to_string(),
        number: payload.number,
        title: payload.title.clone(),
        head_sha: payload.head.sha.clone()?,
        base_branch: payload.base.git_ref.clone()?,
        head_branch: payload.head.git_ref.clone()?,
        is_draft: payload.draft,
    })
}

/// Constant-time HMAC-SHA256 verification of the `X-Hub-Signature-256`
/// header, the same `Mac::verify_slice` idiom other webhook senders in this
/// ecosystem use to check their own outgoing signatures.
fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
    let Some(header) = headers.get("x-hub-signature-256").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(hex_sig) = header.strip_prefix("sha256=") else { return false };
    let Ok(sig_bytes) = hex::decode(hex_sig) else { return false };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else { return false };
    mac.update(body);
    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureToggles, Mode, OperationalConfig, ReviewConfig, TrackedRepo};
    use crate::decision::SystemClock;
    use crate::errors::ForgeError;
    use crate::features::FeatureRunner;
    use crate::forge::{ForgeClient, InlineComment, PrDetails, PrState as ForgePrState, ReviewEvent, ReviewExistence, ReviewThread};
    use crate::llm::LlmClient;
    use crate::metrics::MetricsCollector;
    use crate::ratelimit::RateLimitGuard;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct NoopForge;

    #[async_trait]
    impl ForgeClient for NoopForge {
        async fn list_open_prs(&self, _owner: &str, _repo: &str) -> Result<Vec<PullRequest>, ForgeError> {
            Ok(vec![])
        }
        async fn get_pr_details(&self, _owner: &str, _repo: &str, _number: u64) -> Result<PrDetails, ForgeError> {
            Ok(PrDetails { state: ForgePrState::Open, merged_at: None })
        }
        async fn get_pr_diff(&self, _owner: &str, _repo: &str, _number: u64) -> Result<String, ForgeError> {
            Ok(String::new())
        }
        async fn get_pr_body(&self, _owner: &str, _repo: &str, _number: u64) -> Result<String, ForgeError> {
            Ok(String::new())
        }
        async fn update_pr_body(&self, _owner: &str, _repo: &str, _number: u64, _body: &str) -> Result<(), ForgeError> {
            Ok(())
        }
        async fn get_pr_labels(&self, _owner: &str, _repo: &str, _number: u64) -> Result<Vec<String>, ForgeError> {
            Ok(vec![])
        }
        async fn add_labels(&self, _owner: &str, _repo: &str, _number: u64, _labels: &[String]) -> Result<(), ForgeError> {
            Ok(())
        }
        async fn remove_labels(&self, _owner: &str, _repo: &str, _number: u64, _labels: &[String]) -> Result<(), ForgeError> {
            Ok(())
        }
        async fn find_existing_comment(&self, _owner: &str, _repo: &str, _number: u64, _tag: &str) -> Result<Option<String>, ForgeError> {
            Ok(None)
        }
        async fn post_comment(&self, _owner: &str, _repo: &str, _number: u64, _body: &str) -> Result<String, ForgeError> {
            Ok("c1".into())
        }
        async fn update_comment(&self, _owner: &str, _repo: &str, _comment_id: &str, _body: &str) -> Result<(), ForgeError> {
            Ok(())
        }
        async fn delete_comment(&self, _owner: &str, _repo: &str, _comment_id: &str) -> Result<(), ForgeError> {
            Ok(())
        }
        async fn comment_exists(&self, _owner: &str, _repo: &str, _comment_id: &str) -> Result<bool, ForgeError> {
            Ok(true)
        }
        async fn post_review(
            &self,
            _owner: &str,
            _repo: &str,
            _number: u64,
            _body: &str,
            _commit_id: &str,
            _inline_comments: &[InlineComment],
            _event: ReviewEvent,
        ) -> Result<String, ForgeError> {
            Ok("r1".into())
        }
        async fn review_exists(&self, _owner: &str, _repo: &str, _number: u64, _review_id: &str) -> Result<ReviewExistence, ForgeError> {
            Ok(ReviewExistence { exists: true, dismissed: false })
        }
        async fn get_review_threads(&self, _owner: &str, _repo: &str, _number: u64) -> Result<Vec<ReviewThread>, ForgeError> {
            Ok(vec![])
        }
        async fn resolve_review_thread(&self, _owner: &str, _repo: &str, _thread_id: &str) -> Result<(), ForgeError> {
            Ok(())
        }
        async fn get_clone_url(&self, _owner: &str, _repo: &str) -> Result<String, ForgeError> {
            Ok("https://example.invalid/repo.git".into())
        }
    }

    async fn test_state(dir: &std::path::Path) -> Arc<WebhookState> {
        let settings = Settings {
            repos: vec![TrackedRepo { owner: "acme".into(), repo: "widgets".into() }],
            mode: Mode::Webhook,
            forge_token: "t".into(),
            webhook_secret: Some("shh".into()),
            llm_cmd: "true".into(),
            review: ReviewConfig::default(),
            operational: OperationalConfig::default(),
            features: FeatureToggles::default(),
        };
        let state_store = Arc::new(StateStore::load(dir.join("state.json")).await);
        let forge: Arc<dyn ForgeClient> = Arc::new(NoopForge);
        let worktree = Arc::new(crate::worktree::WorktreeManager::new(dir.join("clones"), std::time::Duration::from_secs(5)));
        let coordinator = Arc::new(ReviewCoordinator::new(
            state_store.clone(),
            forge,
            Arc::new(LlmClient::new("true")),
            worktree,
            Arc::new(RateLimitGuard::new()),
            Arc::new(MetricsCollector::new()),
            Arc::new(FeatureRunner::new(vec![])),
            Arc::new(SystemClock),
            ReviewConfig::default(),
            OperationalConfig::default(),
        ));
        Arc::new(WebhookState::new(settings, coordinator, state_store).unwrap())
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[tokio::test]
    async fn rejects_missing_signature_when_secret_configured() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = build_router(state);

        let body = serde_json::json!({
            "action": "opened",
            "repository": {"full_name": "acme/widgets"},
        });

        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn drops_events_for_untracked_repos() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = build_router(state);

        let payload = serde_json::json!({
            "action": "opened",
            "repository": {"full_name": "someoneelse/other"},
            "pull_request": {
                "number": 1, "title": "t", "draft": false,
                "head": {"sha": "a1", "ref": "feat"},
                "base": {"sha": null, "ref": "main"}
            }
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        let sig = sign("shh", &bytes);

        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .header("x-hub-signature-256", sig)
            .body(Body::from(bytes))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn accepts_review_event_for_tracked_repo() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = build_router(state);

        let payload = serde_json::json!({
            "action": "opened",
            "repository": {"full_name": "acme/widgets"},
            "pull_request": {
                "number": 1, "title": "t", "draft": false,
                "head": {"sha": "a1", "ref": "feat"},
                "base": {"sha": null, "ref": "main"}
            }
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        let sig = sign("shh", &bytes);

        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .header("x-hub-signature-256", sig)
            .body(Body::from(bytes))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn drops_bare_edited_without_title_change() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = build_router(state);

        let payload = serde_json::json!({
            "action": "edited",
            "repository": {"full_name": "acme/widgets"},
            "pull_request": {
                "number": 1, "title": "t", "draft": false,
                "head": {"sha": "a1", "ref": "feat"},
                "base": {"sha": null, "ref": "main"}
            },
            "changes": {}
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        let sig = sign("shh", &bytes);

        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .header("x-hub-signature-256", sig)
            .body(Body::from(bytes))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn parse_overrides_extracts_all_flags() {
        let overrides = parse_overrides("/review --max-turns=12 --skip-description --skip-labels --focus=src/a.rs,src/b.rs");
        assert_eq!(overrides.max_turns, Some(12));
        assert!(overrides.skip_description);
        assert!(overrides.skip_labels);
        assert_eq!(overrides.focus_paths, Some(vec!["src/a.rs".to_string(), "src/b.rs".to_string()]));
    }

    #[test]
    fn parse_overrides_defaults_when_absent() {
        let overrides = parse_overrides("/review");
        assert_eq!(overrides.max_turns, None);
        assert!(!overrides.skip_description);
        assert!(overrides.focus_paths.is_none());
    }

    #[test]
    fn signature_verification_rejects_tampered_body() {
        let sig = sign("shh", b"original");
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", sig.parse().unwrap());
        assert!(verify_signature("shh", &headers, b"original"));
        assert!(!verify_signature("shh", &headers, b"tampered"));
    }
}
