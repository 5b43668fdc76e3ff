//! `WorktreeManager` (§4.4): one bare clone per `(owner, repo)`, one
//! detached worktree per PR, each guarded by a per-repo in-process mutex.
//!
//! Bare-clone and fetch use `git2`, mirroring the teacher's
//! `tracker::git::GitTracker` `Repository::open` style. `git worktree
//! add/remove` has no first-class `git2` API with the flexibility needed
//! here (stale-worktree removal, `worktree prune`), so those shell out via
//! `tokio::process::Command` — the same subprocess idiom the LLM client uses
//! for the CLI invocation (spawn, capture, timeout, check exit status).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("clone/prepare failed for {owner}/{repo}: {message}")]
    ClonePrepare { owner: String, repo: String, message: String },
    #[error("git command timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WorktreeError {
    /// §7 classification, mirroring `ForgeError::kind()`: failures that won't
    /// succeed on retry (bad credentials, missing ref/repo, filesystem
    /// permission issues) are permanent; timeouts, network stalls, and
    /// locked-resource errors are worth retrying.
    pub fn kind(&self) -> vigil_common::ErrorKind {
        use vigil_common::ErrorKind;
        match self {
            WorktreeError::Timeout(_) => ErrorKind::Transient,
            WorktreeError::Git(e) => match e.code() {
                git2::ErrorCode::Auth | git2::ErrorCode::Certificate | git2::ErrorCode::NotFound => ErrorKind::Permanent,
                _ => ErrorKind::Transient,
            },
            WorktreeError::Io(e) => match e.kind() {
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound => ErrorKind::Permanent,
                _ => ErrorKind::Transient,
            },
            WorktreeError::ClonePrepare { message, .. } => {
                let lower = message.to_ascii_lowercase();
                let looks_permanent = lower.contains("authentication")
                    || lower.contains("permission denied")
                    || lower.contains("repository not found")
                    || lower.contains("not found")
                    || lower.contains("403")
                    || lower.contains("404");
                if looks_permanent {
                    ErrorKind::Permanent
                } else {
                    ErrorKind::Transient
                }
            }
        }
    }
}

pub struct WorktreeManager {
    clone_dir: PathBuf,
    git_timeout: Duration,
    repo_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorktreeManager {
    pub fn new(clone_dir: impl Into<PathBuf>, git_timeout: Duration) -> Self {
        Self { clone_dir: clone_dir.into(), git_timeout, repo_locks: Mutex::new(HashMap::new()) }
    }

    fn bare_path(&self, owner: &str, repo: &str) -> PathBuf {
        self.clone_dir.join(owner).join(repo)
    }

    fn worktree_path(&self, owner: &str, repo: &str, number: u64) -> PathBuf {
        self.clone_dir.join(owner).join(format!("{repo}--pr-{number}"))
    }

    async fn lock_for(&self, slug: &str) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().await;
        locks.entry(slug.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Validates an existing bare clone by probing its git metadata and
    /// deletes it if corrupt, then either clones (first sighting) or
    /// fetches `origin`. Serialized per-repo so two PRs on the same repo
    /// never fight over the same bare directory.
    pub async fn ensure_clone(&self, owner: &str, repo: &str, clone_url: &str) -> Result<PathBuf, WorktreeError> {
        let slug = format!("{owner}/{repo}");
        let lock = self.lock_for(&slug).await;
        let _guard = lock.lock().await;

        let bare = self.bare_path(owner, repo);
        let is_valid = bare.exists() && git2::Repository::open_bare(&bare).is_ok();
        if bare.exists() && !is_valid {
            warn!(%slug, path = %bare.display(), "corrupt bare clone, removing");
            tokio::fs::remove_dir_all(&bare).await.ok();
        }

        if !bare.exists() {
            if let Some(parent) = bare.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.run_git(None, &["clone", "--bare", clone_url, &bare.to_string_lossy()]).await.map_err(|e| {
                WorktreeError::ClonePrepare { owner: owner.into(), repo: repo.into(), message: e.to_string() }
            })?;
            info!(%slug, "bare clone created");
        } else {
            self.run_git(Some(&bare), &["fetch", "origin"]).await.map_err(|e| WorktreeError::ClonePrepare {
                owner: owner.into(),
                repo: repo.into(),
                message: e.to_string(),
            })?;
        }
        Ok(bare)
    }

    /// Ensures the clone, fetches the PR-ref pseudo-ref, removes any stale
    /// worktree at the PR's path, and creates a fresh detached worktree at
    /// `head_sha`. Returns the worktree path.
    pub async fn prepare_for_pr(&self, owner: &str, repo: &str, clone_url: &str, number: u64, head_sha: &str) -> Result<PathBuf, WorktreeError> {
        let bare = self.ensure_clone(owner, repo, clone_url).await?;
        let pr_ref = format!("refs/pull/{number}/head");
        let fetch_spec = format!("{pr_ref}:{pr_ref}");
        self.run_git(Some(&bare), &["fetch", "origin", &fetch_spec]).await.map_err(|e| WorktreeError::ClonePrepare {
            owner: owner.into(),
            repo: repo.into(),
            message: format!("fetch pr ref: {e}"),
        })?;

        let worktree_path = self.worktree_path(owner, repo, number);
        self.remove_worktree_at(&bare, &worktree_path).await;

        self.run_git(Some(&bare), &["worktree", "add", "--detach", &worktree_path.to_string_lossy(), head_sha])
            .await
            .map_err(|e| WorktreeError::ClonePrepare { owner: owner.into(), repo: repo.into(), message: format!("worktree add: {e}") })?;

        Ok(worktree_path)
    }

    /// Best-effort, non-blocking cleanup of a single PR's worktree.
    pub async fn cleanup_pr(&self, owner: &str, repo: &str, number: u64) {
        let bare = self.bare_path(owner, repo);
        let worktree_path = self.worktree_path(owner, repo, number);
        self.remove_worktree_at(&bare, &worktree_path).await;
    }

    async fn remove_worktree_at(&self, bare: &Path, worktree_path: &Path) {
        if !worktree_path.exists() {
            return;
        }
        let res = self.run_git(Some(bare), &["worktree", "remove", "--force", &worktree_path.to_string_lossy()]).await;
        if res.is_err() {
            // Fall back to filesystem removal plus a prune.
            let _ = tokio::fs::remove_dir_all(worktree_path).await;
            let _ = self.run_git(Some(bare), &["worktree", "prune"]).await;
        }
    }

    /// Removes worktrees whose mtime is older than `max_age_minutes`.
    pub async fn prune_stale_worktrees(&self, max_age_minutes: i64) -> usize {
        let mut pruned = 0;
        let cutoff = std::time::SystemTime::now() - Duration::from_secs((max_age_minutes.max(0) as u64) * 60);
        let mut owners = match tokio::fs::read_dir(&self.clone_dir).await {
            Ok(r) => r,
            Err(_) => return 0,
        };
        while let Ok(Some(owner_entry)) = owners.next_entry().await {
            let owner_path = owner_entry.path();
            if !owner_path.is_dir() {
                continue;
            }
            let mut repos = match tokio::fs::read_dir(&owner_path).await {
                Ok(r) => r,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = repos.next_entry().await {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.contains("--pr-") {
                    continue;
                }
                let mtime = entry.metadata().await.ok().and_then(|m| m.modified().ok());
                if mtime.map(|t| t < cutoff).unwrap_or(false) {
                    let repo_name = name.split("--pr-").next().unwrap_or(&name);
                    let bare = owner_path.join(repo_name);
                    self.remove_worktree_at(&bare, &path).await;
                    pruned += 1;
                }
            }
        }
        pruned
    }

    /// Removes bare clones for repositories no longer in `tracked`
    /// (`"owner/repo"` slugs).
    pub async fn prune_untracked(&self, tracked: &std::collections::HashSet<String>) -> usize {
        let mut pruned = 0;
        let mut owners = match tokio::fs::read_dir(&self.clone_dir).await {
            Ok(r) => r,
            Err(_) => return 0,
        };
        while let Ok(Some(owner_entry)) = owners.next_entry().await {
            let owner_path = owner_entry.path();
            if !owner_path.is_dir() {
                continue;
            }
            let owner = owner_entry.file_name().to_string_lossy().to_string();
            let mut repos = match tokio::fs::read_dir(&owner_path).await {
                Ok(r) => r,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = repos.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.contains("--pr-") {
                    continue;
                }
                let slug = format!("{owner}/{name}");
                if !tracked.contains(&slug) {
                    if tokio::fs::remove_dir_all(entry.path()).await.is_ok() {
                        pruned += 1;
                    }
                }
            }
        }
        pruned
    }

    async fn run_git(&self, cwd: Option<&Path>, args: &[&str]) -> Result<(), WorktreeError> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd.spawn()?;
        let output = tokio::time::timeout(self.git_timeout, child.wait_with_output())
            .await
            .map_err(|_| WorktreeError::Timeout(self.git_timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::ClonePrepare { owner: String::new(), repo: String::new(), message: stderr.trim().to_string() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_bare_origin(dir: &Path) -> PathBuf {
        let origin = dir.join("origin");
        let repo = git2::Repository::init(&origin).unwrap();
        let sig = git2::Signature::now("tester", "tester@example.com").unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();
            std::fs::write(origin.join("README.md"), "hello").unwrap();
            index.add_path(Path::new("README.md")).unwrap();
            index.write().unwrap();
            index.write_tree().unwrap()
        };
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();
        origin
    }

    #[tokio::test]
    async fn ensure_clone_creates_bare_repo() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_bare_origin(dir.path());
        let mgr = WorktreeManager::new(dir.path().join("clones"), Duration::from_secs(30));
        let bare = mgr.ensure_clone("acme", "widgets", &origin.to_string_lossy()).await.unwrap();
        assert!(bare.join("HEAD").exists());
    }

    #[tokio::test]
    async fn ensure_clone_is_idempotent_and_fetches_on_second_call() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_bare_origin(dir.path());
        let mgr = WorktreeManager::new(dir.path().join("clones"), Duration::from_secs(30));
        mgr.ensure_clone("acme", "widgets", &origin.to_string_lossy()).await.unwrap();
        let bare2 = mgr.ensure_clone("acme", "widgets", &origin.to_string_lossy()).await.unwrap();
        assert!(bare2.exists());
    }

    #[tokio::test]
    async fn corrupt_bare_clone_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_bare_origin(dir.path());
        let mgr = WorktreeManager::new(dir.path().join("clones"), Duration::from_secs(30));
        let bare = mgr.bare_path("acme", "widgets");
        tokio::fs::create_dir_all(&bare).await.unwrap();
        tokio::fs::write(bare.join("garbage"), b"not a repo").await.unwrap();

        let result = mgr.ensure_clone("acme", "widgets", &origin.to_string_lossy()).await.unwrap();
        assert!(git2::Repository::open_bare(&result).is_ok());
    }

    #[tokio::test]
    async fn prune_untracked_removes_repos_not_in_tracked_set() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_bare_origin(dir.path());
        let mgr = WorktreeManager::new(dir.path().join("clones"), Duration::from_secs(30));
        mgr.ensure_clone("acme", "widgets", &origin.to_string_lossy()).await.unwrap();

        let tracked = std::collections::HashSet::new();
        let pruned = mgr.prune_untracked(&tracked).await;
        assert_eq!(pruned, 1);
        assert!(!mgr.bare_path("acme", "widgets").exists());
    }

    #[test]
    fn timeout_is_transient() {
        let err = WorktreeError::Timeout(Duration::from_secs(60));
        assert_eq!(err.kind(), vigil_common::ErrorKind::Transient);
    }

    #[test]
    fn clone_prepare_with_network_wording_is_transient() {
        let err = WorktreeError::ClonePrepare { owner: "acme".into(), repo: "widgets".into(), message: "fetch-pack: unexpected disconnect".into() };
        assert_eq!(err.kind(), vigil_common::ErrorKind::Transient);
    }

    #[test]
    fn clone_prepare_with_auth_failure_wording_is_permanent() {
        let err = WorktreeError::ClonePrepare { owner: "acme".into(), repo: "widgets".into(), message: "remote: Authentication failed for 'https://...'".into() };
        assert_eq!(err.kind(), vigil_common::ErrorKind::Permanent);
    }

    #[test]
    fn io_permission_denied_is_permanent() {
        let err = WorktreeError::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"));
        assert_eq!(err.kind(), vigil_common::ErrorKind::Permanent);
    }

    #[test]
    fn io_other_is_transient() {
        let err = WorktreeError::Io(std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted"));
        assert_eq!(err.kind(), vigil_common::ErrorKind::Transient);
    }
}
