//! Layered configuration: a TOML file, then environment-variable overrides
//! that are authoritative ("locked" — they win even over a file value meant
//! to be tunable from a UI layer), matching the teacher's
//! `ForgeToml::claude_cmd()`/`skip_permissions()` env-fallback idiom
//! generalized to every tunable/sensitive field. No positional CLI overrides
//! per §6.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// How vigil discovers PRs that need review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Polling,
    Webhook,
    Both,
}

impl std::str::FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "polling" => Ok(Mode::Polling),
            "webhook" => Ok(Mode::Webhook),
            "both" => Ok(Mode::Both),
            other => Err(ConfigError::InvalidValue {
                field: "mode".into(),
                message: format!("'{other}' is not one of polling, webhook, both"),
            }),
        }
    }
}

/// One tracked `(owner, repo)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedRepo {
    pub owner: String,
    pub repo: String,
}

/// Review-lifecycle tuning parameters (§4.2, §4.3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_max_diff_lines")]
    pub max_diff_lines: u64,
    #[serde(default = "default_debounce_seconds")]
    pub debounce_period_seconds: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_review_history")]
    pub max_review_history: usize,
    #[serde(default = "default_max_feature_executions")]
    pub max_feature_executions: usize,
    #[serde(default)]
    pub skip_drafts: bool,
    #[serde(default)]
    pub skip_wip: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub security_paths: Vec<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_llm_max_turns")]
    pub llm_max_turns: u32,
    #[serde(default = "default_comment_tag")]
    pub comment_tag: String,
    #[serde(default = "default_snap_max_distance")]
    pub snap_max_distance: u32,
}

fn default_max_diff_lines() -> u64 {
    5000
}
fn default_debounce_seconds() -> i64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_review_history() -> usize {
    vigil_common::DEFAULT_MAX_REVIEW_HISTORY
}
fn default_max_feature_executions() -> usize {
    vigil_common::DEFAULT_MAX_FEATURE_EXECUTIONS
}
fn default_llm_timeout_secs() -> u64 {
    600
}
fn default_llm_max_turns() -> u32 {
    40
}
fn default_comment_tag() -> String {
    "<!-- vigil-review -->".to_string()
}
fn default_snap_max_distance() -> u32 {
    3
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_diff_lines: default_max_diff_lines(),
            debounce_period_seconds: default_debounce_seconds(),
            max_retries: default_max_retries(),
            max_review_history: default_max_review_history(),
            max_feature_executions: default_max_feature_executions(),
            skip_drafts: false,
            skip_wip: false,
            dry_run: false,
            exclude_paths: Vec::new(),
            security_paths: Vec::new(),
            llm_timeout_secs: default_llm_timeout_secs(),
            llm_max_turns: default_llm_max_turns(),
            comment_tag: default_comment_tag(),
            snap_max_distance: default_snap_max_distance(),
        }
    }
}

/// Operational tuning for the concurrency core (§5) and ingress loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationalConfig {
    #[serde(default = "default_polling_interval_secs")]
    pub polling_interval_secs: u64,
    #[serde(default = "default_max_concurrent_reviews")]
    pub max_concurrent_reviews: usize,
    #[serde(default = "default_stale_closed_days")]
    pub stale_closed_days: i64,
    #[serde(default = "default_stale_error_days")]
    pub stale_error_days: i64,
    #[serde(default = "default_comment_verify_interval_minutes")]
    pub comment_verify_interval_minutes: i64,
    #[serde(default = "default_stale_worktree_minutes")]
    pub stale_worktree_minutes: i64,
    #[serde(default = "default_clone_dir")]
    pub clone_dir: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_audit_dir")]
    pub audit_dir: PathBuf,
    #[serde(default = "default_audit_max_entries")]
    pub audit_max_entries: usize,
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
    #[serde(default)]
    pub enable_worktree: bool,
    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,
    #[serde(default = "default_comment_trigger")]
    pub comment_trigger: String,
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,
}

fn default_polling_interval_secs() -> u64 {
    300
}
fn default_max_concurrent_reviews() -> usize {
    4
}
fn default_stale_closed_days() -> i64 {
    30
}
fn default_stale_error_days() -> i64 {
    14
}
fn default_comment_verify_interval_minutes() -> i64 {
    60
}
fn default_stale_worktree_minutes() -> i64 {
    120
}
fn default_clone_dir() -> PathBuf {
    PathBuf::from(".vigil/clones")
}
fn default_state_file() -> PathBuf {
    PathBuf::from(".vigil/state.json")
}
fn default_audit_dir() -> PathBuf {
    PathBuf::from(".vigil/audit")
}
fn default_audit_max_entries() -> usize {
    5000
}
fn default_git_timeout_secs() -> u64 {
    60
}
fn default_webhook_port() -> u16 {
    8080
}
fn default_comment_trigger() -> String {
    r"^\s*/review\b".to_string()
}
fn default_shutdown_drain_secs() -> u64 {
    60
}

impl Default for OperationalConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: default_polling_interval_secs(),
            max_concurrent_reviews: default_max_concurrent_reviews(),
            stale_closed_days: default_stale_closed_days(),
            stale_error_days: default_stale_error_days(),
            comment_verify_interval_minutes: default_comment_verify_interval_minutes(),
            stale_worktree_minutes: default_stale_worktree_minutes(),
            clone_dir: default_clone_dir(),
            state_file: default_state_file(),
            audit_dir: default_audit_dir(),
            audit_max_entries: default_audit_max_entries(),
            git_timeout_secs: default_git_timeout_secs(),
            enable_worktree: false,
            webhook_port: default_webhook_port(),
            comment_trigger: default_comment_trigger(),
            shutdown_drain_secs: default_shutdown_drain_secs(),
        }
    }
}

/// Feature plugin toggles (§1 "feature plugins", §4.9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureToggles {
    #[serde(default)]
    pub audit_log: bool,
    #[serde(default)]
    pub auto_label: bool,
    #[serde(default)]
    pub auto_description: bool,
    #[serde(default)]
    pub jira: bool,
    #[serde(default)]
    pub slack: bool,
}

/// Raw shape of `vigil.toml`, before environment overrides are layered on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawSettings {
    #[serde(default)]
    repos: Vec<TrackedRepo>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    forge_token: Option<String>,
    #[serde(default)]
    webhook_secret: Option<String>,
    #[serde(default)]
    llm_cmd: Option<String>,
    #[serde(default)]
    review: ReviewConfig,
    #[serde(default)]
    operational: OperationalConfig,
    #[serde(default)]
    features: FeatureToggles,
}

/// Fully resolved runtime settings: file, then environment overrides, which
/// are authoritative and marked as "locked" to any UI layer that might also
/// want to edit these fields.
#[derive(Debug, Clone)]
pub struct Settings {
    pub repos: Vec<TrackedRepo>,
    pub mode: Mode,
    pub forge_token: String,
    pub webhook_secret: Option<String>,
    pub llm_cmd: String,
    pub review: ReviewConfig,
    pub operational: OperationalConfig,
    pub features: FeatureToggles,
}

impl Settings {
    /// Load from `path` if it exists (an absent file is not an error — an
    /// all-env-var deployment is valid), then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
            toml::from_str::<RawSettings>(&text)
                .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?
        } else {
            RawSettings::default()
        };
        Self::from_raw(raw)
    }

    fn from_raw(mut raw: RawSettings) -> Result<Self, ConfigError> {
        // Environment overrides are authoritative: they win even if the file
        // set a value, per §6 "locked to a UI layer".
        if let Ok(v) = std::env::var("VIGIL_MODE") {
            raw.mode = Some(v);
        }
        if let Ok(v) = std::env::var("VIGIL_FORGE_TOKEN") {
            raw.forge_token = Some(v);
        }
        if let Ok(v) = std::env::var("VIGIL_WEBHOOK_SECRET") {
            raw.webhook_secret = Some(v);
        }
        if let Ok(v) = std::env::var("VIGIL_LLM_CMD") {
            raw.llm_cmd = Some(v);
        }
        if let Ok(v) = std::env::var("VIGIL_MAX_DIFF_LINES") {
            raw.review.max_diff_lines = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue { field: "VIGIL_MAX_DIFF_LINES".into(), message: "not a number".into() })?;
        }
        if let Ok(v) = std::env::var("VIGIL_DRY_RUN") {
            raw.review.dry_run = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("VIGIL_MAX_CONCURRENT_REVIEWS") {
            raw.operational.max_concurrent_reviews = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue { field: "VIGIL_MAX_CONCURRENT_REVIEWS".into(), message: "not a number".into() })?;
        }
        if let Ok(v) = std::env::var("VIGIL_CLONE_DIR") {
            raw.operational.clone_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VIGIL_STATE_FILE") {
            raw.operational.state_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VIGIL_WEBHOOK_PORT") {
            raw.operational.webhook_port = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue { field: "VIGIL_WEBHOOK_PORT".into(), message: "not a port".into() })?;
        }

        let mode = match raw.mode {
            Some(s) => s.parse()?,
            None => Mode::Polling,
        };
        let forge_token = raw.forge_token.ok_or_else(|| ConfigError::MissingField("forge_token".into()))?;
        if raw.repos.is_empty() {
            return Err(ConfigError::MissingField("repos".into()));
        }

        Ok(Settings {
            repos: raw.repos,
            mode,
            forge_token,
            webhook_secret: raw.webhook_secret,
            llm_cmd: raw.llm_cmd.unwrap_or_else(|| "claude".to_string()),
            review: raw.review,
            operational: raw.operational,
            features: raw.features,
        })
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.operational.polling_interval_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.review.llm_timeout_secs)
    }

    pub fn tracked_slugs(&self) -> HashSet<String> {
        self.repos.iter().map(|r| format!("{}/{}", r.owner, r.repo)).collect()
    }

    pub fn is_tracked(&self, owner: &str, repo: &str) -> bool {
        self.repos.iter().any(|r| r.owner == owner && r.repo == repo)
    }

    /// A `Display`-safe copy with token-like fields redacted, for any egress
    /// (logs, `state inspect`, a future dashboard).
    pub fn redacted(&self) -> RedactedSettings {
        RedactedSettings {
            repos: self.repos.iter().map(|r| format!("{}/{}", r.owner, r.repo)).collect(),
            mode: self.mode,
            forge_token: redact(&self.forge_token),
            webhook_secret: self.webhook_secret.as_deref().map(redact),
            llm_cmd: self.llm_cmd.clone(),
            max_diff_lines: self.review.max_diff_lines,
            max_concurrent_reviews: self.operational.max_concurrent_reviews,
            dry_run: self.review.dry_run,
        }
    }
}

fn redact(secret: &str) -> String {
    if secret.len() <= 4 {
        "***".to_string()
    } else {
        format!("{}***", &secret[..4])
    }
}

/// Safe-for-egress projection of `Settings`.
#[derive(Debug, Clone, Serialize)]
pub struct RedactedSettings {
    pub repos: Vec<String>,
    pub mode: Mode,
    pub forge_token: String,
    pub webhook_secret: Option<String>,
    pub llm_cmd: String,
    pub max_diff_lines: u64,
    pub max_concurrent_reviews: usize,
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            forge_token = "ghp_abcdefghijklmnop"

            [[repos]]
            owner = "acme"
            repo = "widgets"
        "#
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let raw: RawSettings = toml::from_str(minimal_toml()).unwrap();
        let settings = Settings::from_raw(raw).unwrap();
        assert_eq!(settings.mode, Mode::Polling);
        assert_eq!(settings.review.max_diff_lines, 5000);
        assert_eq!(settings.repos.len(), 1);
        assert!(settings.is_tracked("acme", "widgets"));
    }

    #[test]
    fn missing_forge_token_is_an_error() {
        let raw: RawSettings = toml::from_str(
            r#"
            [[repos]]
            owner = "acme"
            repo = "widgets"
        "#,
        )
        .unwrap();
        let err = Settings::from_raw(raw).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "forge_token"));
    }

    #[test]
    fn empty_repos_is_an_error() {
        let raw: RawSettings = toml::from_str(r#"forge_token = "x""#).unwrap();
        let err = Settings::from_raw(raw).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "repos"));
    }

    #[test]
    fn redacted_hides_token() {
        let raw: RawSettings = toml::from_str(minimal_toml()).unwrap();
        let settings = Settings::from_raw(raw).unwrap();
        let r = settings.redacted();
        assert!(!r.forge_token.contains("efghijklmnop"));
        assert!(r.forge_token.starts_with("ghp_"));
    }

    #[test]
    fn env_override_wins_over_file_value() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            std::env::set_var("VIGIL_DRY_RUN", "true");
        }
        let raw: RawSettings = toml::from_str(minimal_toml()).unwrap();
        let settings = Settings::from_raw(raw).unwrap();
        unsafe {
            std::env::remove_var("VIGIL_DRY_RUN");
        }
        assert!(settings.review.dry_run);
    }
}
