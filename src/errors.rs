//! Typed error hierarchy for vigil.
//!
//! Three top-level enums cover the three concerns that actually need typed
//! matching elsewhere in the crate; everything else bubbles through
//! `anyhow::Error`.
//! - `ReviewError` — phase-level failures inside `ReviewCoordinator`, carrying
//!   the `(ErrorKind, Phase)` pair that gets written into `PrState.last_error`
//! - `ConfigError` — settings-loading failures surfaced at startup
//! - `ForgeError` — failures from the abstract forge client, classified so
//!   the coordinator can map them onto `ErrorKind` without re-parsing HTTP

use thiserror::Error;
use vigil_common::{ErrorKind, Phase};

/// A phase failure inside `ReviewCoordinator::process_pr`. Carries enough to
/// populate `PrState.last_error` and to decide whether to retry.
#[derive(Debug, Error)]
#[error("{phase} failed ({kind:?}): {message}")]
pub struct ReviewError {
    pub phase: Phase,
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl ReviewError {
    pub fn new(phase: Phase, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { phase, kind, message: message.into(), source: None }
    }

    pub fn transient(phase: Phase, message: impl Into<String>) -> Self {
        Self::new(phase, ErrorKind::Transient, message)
    }

    pub fn permanent(phase: Phase, message: impl Into<String>) -> Self {
        Self::new(phase, ErrorKind::Permanent, message)
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }
}

/// Errors loading or validating `Settings`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Classified failure from a `ForgeClient` call. `status` is the HTTP status
/// when the failure originated from a response rather than a transport error.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("forge request failed ({status}): {message}")]
    Response { status: u16, message: String },

    #[error("forge request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("forge transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed forge response: {0}")]
    Malformed(String),
}

impl ForgeError {
    /// §7 classification: 401/403/404/422 and explicit rate-limit are
    /// permanent (disable automatic retry); everything else is transient.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForgeError::Response { status, .. } => match *status {
                401 | 403 | 404 | 422 | 429 => ErrorKind::Permanent,
                _ => ErrorKind::Transient,
            },
            ForgeError::Timeout(_) => ErrorKind::Transient,
            ForgeError::Transport(_) => ErrorKind::Transient,
            ForgeError::Malformed(_) => ErrorKind::Transient,
        }
    }
}
