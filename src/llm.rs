//! `llm::LlmClient` (§6 "LLM CLI envelope"): a subprocess invocation of the
//! external review CLI, with the same spawn/stdin-write/capture/timeout idiom
//! as `orchestrator::runner::ClaudeRunner::run_iteration`, but collecting the
//! full stdout rather than streaming JSON lines — the envelope is one JSON
//! object, not a JSON-lines stream.

pub mod envelope;

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

/// The envelope fields named in §6, one JSON object on stdout (possibly
/// wrapped in surrounding prose or a fenced code block; see `envelope`).
#[derive(Debug, Clone, Deserialize)]
pub struct LlmEnvelope {
    pub result: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub duration_api_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("failed to spawn llm cli: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("llm cli timed out after {0:?}")]
    Timeout(Duration),
    #[error("llm cli exited with non-zero status: {0}")]
    NonZeroExit(String),
    #[error("llm cli produced no parseable envelope")]
    Unparseable,
    #[error("llm cli reported is_error=true: {0}")]
    ReportedError(String),
}

/// Rate-limit/spending-limit signal embedded in an `is_error` result or a
/// non-zero exit's stderr, coarse enough to cover the CLI's wording without
/// parsing a dedicated error code out of prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSignal {
    RateLimit,
    SpendingLimit,
}

impl LlmError {
    /// Sniffs the CLI's reported message for a rate-limit/spending-limit
    /// signal so the caller can pause `RateLimitGuard` instead of treating
    /// this like an ordinary transient failure.
    pub fn rate_signal(&self) -> Option<RateSignal> {
        let message = match self {
            LlmError::ReportedError(msg) | LlmError::NonZeroExit(msg) => msg,
            _ => return None,
        };
        let lower = message.to_ascii_lowercase();
        if lower.contains("spending limit") || lower.contains("credit balance") || lower.contains("usage limit") {
            Some(RateSignal::SpendingLimit)
        } else if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("429") {
            Some(RateSignal::RateLimit)
        } else {
            None
        }
    }
}

/// One invocation of the LLM CLI. `cmd` is the binary name/path (e.g.
/// `claude`); `max_turns` and `timeout` are resolved per-call so a comment
/// trigger override (`--max-turns=N`) can take effect without mutating
/// global config.
pub struct LlmClient {
    cmd: String,
}

pub struct LlmInvocation<'a> {
    pub prompt: &'a str,
    pub max_turns: u32,
    pub timeout: Duration,
}

pub struct LlmOutcome {
    pub envelope: LlmEnvelope,
    pub elapsed: Duration,
}

impl LlmClient {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }

    /// Spawns the CLI, writes `prompt` to stdin, captures all of stdout, and
    /// parses the envelope via the three-tier extraction strategy.
    pub async fn invoke(&self, invocation: LlmInvocation<'_>) -> Result<LlmOutcome, LlmError> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.cmd);
        cmd.arg("--print")
            .arg("--output-format")
            .arg("json")
            .arg("--max-turns")
            .arg(invocation.max_turns.to_string())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(LlmError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(invocation.prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let output = tokio::time::timeout(invocation.timeout, child.wait_with_output())
            .await
            .map_err(|_| LlmError::Timeout(invocation.timeout))?
            .map_err(LlmError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LlmError::NonZeroExit(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let envelope: LlmEnvelope = serde_json::from_str(&stdout).map_err(|_| LlmError::Unparseable)?;

        if envelope.is_error {
            warn!(result = %envelope.result, "llm cli reported is_error");
            return Err(LlmError::ReportedError(envelope.result.clone()));
        }

        Ok(LlmOutcome { envelope, elapsed: start.elapsed() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_deserializes_minimal_shape() {
        let raw = r#"{"result":"{}","is_error":false}"#;
        let env: LlmEnvelope = serde_json::from_str(raw).unwrap();
        assert!(!env.is_error);
        assert_eq!(env.result, "{}");
        assert!(env.model.is_none());
    }

    #[test]
    fn rate_signal_detects_spending_limit_wording() {
        let err = LlmError::ReportedError("You have exceeded your spending limit for this month".into());
        assert_eq!(err.rate_signal(), Some(RateSignal::SpendingLimit));
    }

    #[test]
    fn rate_signal_detects_rate_limit_wording() {
        let err = LlmError::NonZeroExit("upstream returned 429 rate limit exceeded".into());
        assert_eq!(err.rate_signal(), Some(RateSignal::RateLimit));
    }

    #[test]
    fn rate_signal_is_none_for_unrelated_failure() {
        let err = LlmError::ReportedError("could not find repository root".into());
        assert_eq!(err.rate_signal(), None);
    }

    #[test]
    fn envelope_deserializes_full_shape() {
        let raw = r#"{
            "result": "{\"verdict\":\"APPROVE\"}",
            "is_error": false,
            "session_id": "abc",
            "input_tokens": 100,
            "output_tokens": 50,
            "cache_creation_input_tokens": 0,
            "cache_read_input_tokens": 10,
            "cost_usd": 0.02,
            "model": "claude",
            "num_turns": 3,
            "duration_ms": 1200,
            "duration_api_ms": 900
        }"#;
        let env: LlmEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.session_id.as_deref(), Some("abc"));
        assert_eq!(env.num_turns, Some(3));
    }
}
