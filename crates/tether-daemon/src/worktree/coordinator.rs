//! Worktree coordinator: one positioned worktree per logical run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::coord::SingleFlight;
use crate::git::{GitError, RepositoryManager, validate_name};

/// Errors from worktree coordination.
#[derive(Debug, Clone, Error)]
pub enum WorktreeError {
    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Origin repository not found: {0}")]
    OriginMissing(String),

    #[error("Invalid run: {0}")]
    InvalidRun(String),
}

/// What a run needs: where its origin lives, where its worktree goes, and
/// which branch it works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub run_id: String,
    pub origin_path: PathBuf,
    pub worktree_path: PathBuf,
    pub branch: String,
    /// Base branch from run metadata; detected from the origin when absent.
    pub base_branch: Option<String>,
}

/// Outcome of [`WorktreeCoordinator::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredWorktree {
    pub run_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    /// Whether the worktree was (re)created during this call.
    pub created: bool,
    /// Whether the tree was hard-reset onto the fetched remote branch.
    pub reset_to_remote: bool,
}

/// Ensures a worktree + branch exists and is positioned for a run.
///
/// Concurrent `ensure` calls for one run id share a single computation.
#[derive(Clone)]
pub struct WorktreeCoordinator {
    repos: RepositoryManager,
    inflight: Arc<SingleFlight<String, Result<EnsuredWorktree, WorktreeError>>>,
}

impl WorktreeCoordinator {
    pub fn new(repos: RepositoryManager) -> Self {
        Self {
            repos,
            inflight: Arc::new(SingleFlight::new()),
        }
    }

    pub const fn repositories(&self) -> &RepositoryManager {
        &self.repos
    }

    /// Ensure the run's worktree exists, is on the run branch, and carries
    /// any remote-authored commits (only when the tree is clean).
    pub async fn ensure(&self, spec: RunSpec) -> Result<EnsuredWorktree, WorktreeError> {
        let this = self.clone();
        let key = spec.run_id.clone();
        self.inflight
            .run(key, move || async move { this.ensure_inner(spec).await })
            .await
    }

    #[instrument(skip_all, fields(run_id = %spec.run_id, branch = %spec.branch))]
    async fn ensure_inner(&self, spec: RunSpec) -> Result<EnsuredWorktree, WorktreeError> {
        validate_name(&spec.run_id)
            .map_err(|e| WorktreeError::InvalidRun(e.to_string()))?;
        validate_name(&spec.branch)?;
        if !self.repos.is_git_directory(&spec.origin_path).await {
            return Err(WorktreeError::OriginMissing(
                spec.origin_path.display().to_string(),
            ));
        }

        let live = self.repos.inspect_work_tree(&spec.worktree_path).await?;
        if !live {
            discard_corrupt_dir(&spec.worktree_path).await?;
        }

        let base_branch = match &spec.base_branch {
            Some(base) => base.clone(),
            None => self.repos.detect_default_branch(&spec.origin_path).await,
        };
        debug!(base_branch = %base_branch, live, "resolved run base branch");

        let path = if live {
            self.position_existing(&spec, &base_branch).await?;
            spec.worktree_path.clone()
        } else {
            info!(path = %spec.worktree_path.display(), "Creating run worktree");
            self.repos
                .create_worktree(
                    &spec.origin_path,
                    &spec.worktree_path,
                    &spec.branch,
                    &base_branch,
                )
                .await?
        };

        let reset_to_remote = self.sync_from_remote(&path, &spec.branch).await?;

        let repos = self.repos.clone();
        let origin = spec.origin_path.clone();
        tokio::spawn(async move { repos.prewarm_history(&origin).await });

        Ok(EnsuredWorktree {
            run_id: spec.run_id,
            path,
            branch: spec.branch,
            base_branch,
            created: !live,
            reset_to_remote,
        })
    }

    /// Create-or-switch an existing worktree onto the run branch.
    async fn position_existing(&self, spec: &RunSpec, base_branch: &str) -> Result<(), WorktreeError> {
        let current = self.repos.current_branch(&spec.worktree_path).await;
        if current.as_deref() == Some(spec.branch.as_str()) {
            return Ok(());
        }
        info!(
            from = current.as_deref().unwrap_or("(detached)"),
            to = %spec.branch,
            "Switching run worktree branch"
        );
        // Make origin/<branch> visible before deciding how to switch.
        self.repos
            .fetch_remote_branch(&spec.worktree_path, &spec.branch)
            .await?;
        self.repos
            .switch_branch(&spec.worktree_path, &spec.branch, base_branch)
            .await?;
        Ok(())
    }

    /// Fetch the run branch and hard-reset onto it, but only when the tree is
    /// clean. Returns whether a reset happened.
    ///
    /// The clean check and the reset are not atomic: an edit landing between
    /// them is lost.
    async fn sync_from_remote(&self, path: &Path, branch: &str) -> Result<bool, WorktreeError> {
        match self.repos.fetch_remote_branch(path, branch).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(branch, "run branch not on remote yet");
                return Ok(false);
            }
            Err(e) => {
                warn!(branch, error = %e, "Fetching run branch failed, keeping local state");
                return Ok(false);
            }
        }
        if !self.repos.is_clean(path).await? {
            info!(path = %path.display(), "Worktree has local changes, not resetting to remote");
            return Ok(false);
        }
        self.repos
            .reset_hard(path, &format!("refs/remotes/origin/{branch}"))
            .await?;
        debug!(branch, "worktree reset to fetched remote branch");
        Ok(true)
    }
}

/// A path that exists but is not a live worktree is treated as absent.
async fn discard_corrupt_dir(path: &Path) -> Result<(), WorktreeError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => {
            warn!(path = %path.display(), "Worktree path is not a live git directory, recreating");
            let removal = if path.is_dir() {
                tokio::fs::remove_dir_all(path).await
            } else {
                tokio::fs::remove_file(path).await
            };
            removal.map_err(|e| WorktreeError::Git(e.into()))
        }
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::git::GitRunner;
    use std::time::Duration;

    fn coordinator() -> WorktreeCoordinator {
        let git = GitRunner::discover(None, Duration::from_secs(60));
        WorktreeCoordinator::new(RepositoryManager::new(git, tether_core::GitConfig::default()))
    }

    fn spec(tmp: &Path, run_id: &str) -> RunSpec {
        RunSpec {
            run_id: run_id.into(),
            origin_path: tmp.join("origin"),
            worktree_path: tmp.join("wt"),
            branch: "run/1".into(),
            base_branch: Some("main".into()),
        }
    }

    #[tokio::test]
    async fn rejects_invalid_run_id() {
        let tmp = tempfile::tempdir().unwrap();
        let err = coordinator().ensure(spec(tmp.path(), "../escape")).await.unwrap_err();
        assert!(matches!(err, WorktreeError::InvalidRun(_)));
    }

    #[tokio::test]
    async fn missing_origin_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let err = coordinator().ensure(spec(tmp.path(), "run-1")).await.unwrap_err();
        match err {
            WorktreeError::OriginMissing(path) => assert!(path.ends_with("origin")),
            other => panic!("Expected OriginMissing, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn discard_corrupt_dir_removes_non_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let wt = tmp.path().join("wt");
        std::fs::create_dir_all(wt.join("junk")).unwrap();
        discard_corrupt_dir(&wt).await.unwrap();
        assert!(!wt.exists());
        // Absent path is fine.
        discard_corrupt_dir(&wt).await.unwrap();
    }
}
