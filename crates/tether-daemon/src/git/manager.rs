//! Repository manager: clone / fetch / branch / worktree orchestration.
//!
//! Clone and fetch calls are deduplicated per `(repo, op, dest)` through a
//! [`SingleFlight`] cache; mutations of shared repository state go through the
//! runner's FIFO queue; worktree creation is serialised per
//! `(origin, branch)` with a [`KeyedLock`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tether_core::GitConfig;
use tracing::{debug, info, instrument, warn};

use crate::coord::{KeyedLock, SingleFlight};

use super::command::{GitRunner, redact_credentials};
use super::error::GitError;
use super::hooks;
use super::layout;
use super::refname::validate_name;

/// Branch names probed, in order, when the remote does not advertise HEAD.
const DEFAULT_BRANCH_CANDIDATES: &[&str] = &["main", "master", "dev", "develop"];

/// Lock age after which `pull` treats `shallow.lock` as abandoned.
const PULL_STALE_LOCK: Duration = Duration::from_secs(15);

/// Lock age after which history prewarming treats `shallow.lock` as abandoned.
const PREWARM_STALE_LOCK: Duration = Duration::from_secs(60);

/// Marker file (in the common git dir) rate-limiting history prewarming.
const PREWARM_MARKER: &str = "tether-prewarm";

/// Dedup key for clone/fetch calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationKey {
    Clone { repo_url: String, dest: PathBuf },
    Fetch { repo_url: String, branch: String, dest: PathBuf },
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name (`refs/heads/` stripped).
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
    pub prunable: bool,
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_porcelain(text: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in text.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                ..WorktreeEntry::default()
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(branch.strip_prefix("refs/heads/").unwrap_or(branch).to_string());
        } else if line == "bare" {
            entry.bare = true;
        } else if line == "detached" {
            entry.detached = true;
        } else if line.starts_with("prunable") {
            entry.prunable = true;
        }
    }
    entries.extend(current);
    entries
}

/// Parse `git ls-remote --symref <remote> HEAD` output into a branch name.
pub fn parse_symref_head(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix("ref: refs/heads/")?;
        let (branch, target) = rest.split_once('\t')?;
        (target.trim() == "HEAD").then(|| branch.to_string())
    })
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Owns clone/fetch/branch/worktree operations on git repositories.
#[derive(Clone)]
pub struct RepositoryManager {
    git: GitRunner,
    config: Arc<GitConfig>,
    operations: Arc<SingleFlight<OperationKey, Result<(), GitError>>>,
    worktree_locks: Arc<KeyedLock<(PathBuf, String)>>,
}

impl RepositoryManager {
    pub fn new(git: GitRunner, config: GitConfig) -> Self {
        let ttl = config.operation_cache_ttl();
        Self {
            git,
            config: Arc::new(config),
            operations: Arc::new(SingleFlight::with_ttl(ttl)),
            worktree_locks: Arc::new(KeyedLock::new()),
        }
    }

    pub const fn git(&self) -> &GitRunner {
        &self.git
    }

    pub fn config(&self) -> &GitConfig {
        &self.config
    }

    // =========================================================================
    // Origin repositories
    // =========================================================================

    /// Make `origin` a clone of `repo_url` positioned on `branch`.
    ///
    /// Clones when absent, otherwise repoints the `origin` remote. Detects
    /// the default branch when none is given, then fetches (force-updating
    /// the tracking ref) and pulls; a divergent pull is recovered by a hard
    /// reset to `FETCH_HEAD`. Returns the branch that was checked out.
    #[instrument(skip_all, fields(repo = %redact_credentials(repo_url), origin = %origin.display()))]
    pub async fn ensure_repository(
        &self,
        repo_url: &str,
        origin: &Path,
        branch: Option<&str>,
        remote_url: Option<&str>,
    ) -> Result<String, GitError> {
        let fetch_url = remote_url.unwrap_or(repo_url);

        if layout::has_git_marker(origin) {
            self.set_remote_url(origin, fetch_url).await?;
        } else {
            self.clone_repository(repo_url, fetch_url, origin).await?;
        }

        let branch = match branch {
            Some(b) => {
                validate_name(b)?;
                b.to_string()
            }
            None => self.detect_default_branch(origin).await,
        };

        self.fetch_branch(repo_url, origin, &branch).await?;
        self.checkout_and_pull(origin, &branch).await?;

        info!(branch = %branch, "Repository ready");
        Ok(branch)
    }

    /// Clone `fetch_url` into `dest`; concurrent calls for the same
    /// `(repo_url, dest)` share one clone.
    pub async fn clone_repository(
        &self,
        repo_url: &str,
        fetch_url: &str,
        dest: &Path,
    ) -> Result<(), GitError> {
        let key = OperationKey::Clone {
            repo_url: repo_url.to_string(),
            dest: dest.to_path_buf(),
        };
        let this = self.clone();
        let fetch_url = fetch_url.to_string();
        let dest = dest.to_path_buf();
        self.operations
            .run(key, move || async move { this.clone_once(&fetch_url, &dest).await })
            .await
    }

    async fn clone_once(&self, fetch_url: &str, dest: &Path) -> Result<(), GitError> {
        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        let mut args = vec!["clone".to_string(), "--no-tags".to_string()];
        if let Some(depth) = self.config.fetch_depth {
            args.push(format!("--depth={depth}"));
        }
        args.push(fetch_url.to_string());
        args.push(dest.display().to_string());

        info!(url = %redact_credentials(fetch_url), dest = %dest.display(), "Cloning repository");
        match self.git.run_mutating(parent, &args).await {
            Ok(_) => Ok(()),
            // Someone else (another process) finished the clone first.
            Err(e) if layout::has_git_marker(dest) => {
                warn!(error = %e, "clone failed but destination is already a repository");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_remote_url(&self, origin: &Path, url: &str) -> Result<(), GitError> {
        match self.git.run(origin, &["remote", "get-url", "origin"]).await {
            Ok(current) if current.text() == url => Ok(()),
            Ok(_) => {
                debug!(url = %redact_credentials(url), "Updating origin remote URL");
                self.git
                    .run_mutating(origin, &["remote", "set-url", "origin", url])
                    .await
                    .map(drop)
            }
            Err(_) => self
                .git
                .run_mutating(origin, &["remote", "add", "origin", url])
                .await
                .map(drop),
        }
    }

    /// Detect the remote default branch: remote HEAD symbolic-ref, then
    /// `ls-remote --symref`, then common names, then `"main"`.
    pub async fn detect_default_branch(&self, repo: &Path) -> String {
        if let Ok(out) = self
            .git
            .run(repo, &["symbolic-ref", "--quiet", "--short", "refs/remotes/origin/HEAD"])
            .await
        {
            if let Some(branch) = out.text().strip_prefix("origin/") {
                debug!(branch, "default branch from origin/HEAD");
                return branch.to_string();
            }
        }

        if let Ok(out) = self.git.run(repo, &["ls-remote", "--symref", "origin", "HEAD"]).await {
            if let Some(branch) = parse_symref_head(&out.stdout) {
                debug!(branch = %branch, "default branch from ls-remote --symref");
                return branch;
            }
        }

        for candidate in DEFAULT_BRANCH_CANDIDATES {
            if self.remote_branch_exists(repo, candidate).await
                || self
                    .git
                    .succeeds(repo, &["ls-remote", "--exit-code", "--heads", "origin", candidate])
                    .await
            {
                debug!(branch = candidate, "default branch from probing");
                return (*candidate).to_string();
            }
        }

        debug!("default branch unknown, assuming main");
        "main".to_string()
    }

    /// Fetch `branch` into `origin` with a force-updating refspec; concurrent
    /// calls for the same `(repo_url, branch, origin)` share one fetch.
    pub async fn fetch_branch(
        &self,
        repo_url: &str,
        origin: &Path,
        branch: &str,
    ) -> Result<(), GitError> {
        validate_name(branch)?;
        let key = OperationKey::Fetch {
            repo_url: repo_url.to_string(),
            branch: branch.to_string(),
            dest: origin.to_path_buf(),
        };
        let this = self.clone();
        let origin = origin.to_path_buf();
        let branch = branch.to_string();
        self.operations
            .run(key, move || async move {
                this.fetch_with_lock_recovery(&origin, &branch).await
            })
            .await
    }

    /// Fetch a branch ref, remediating stale/contended `shallow.lock`.
    async fn fetch_with_lock_recovery(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        layout::remove_stale_shallow_lock(repo, self.config.stale_lock_age());
        match self.fetch_once(repo, branch).await {
            Err(e) if e.is_lock_contention() => {
                layout::force_remove_shallow_lock(repo);
                self.fetch_once(repo, branch).await
            }
            other => other,
        }
    }

    async fn fetch_once(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        let mut args = vec!["fetch".to_string(), "--no-tags".to_string()];
        // Never re-shallow a repository whose history was prewarmed.
        if let Some(depth) = self.config.fetch_depth.filter(|_| layout::is_shallow(repo)) {
            args.push(format!("--depth={depth}"));
        }
        args.push("origin".to_string());
        args.push(format!("+refs/heads/{branch}:refs/remotes/origin/{branch}"));
        self.git.run(repo, &args).await.map(drop)
    }

    async fn checkout_and_pull(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        let checkout = if self.local_branch_exists(repo, branch).await {
            self.git.run_mutating(repo, &["checkout", branch]).await
        } else {
            let upstream = format!("origin/{branch}");
            self.git
                .run_mutating(repo, &["checkout", "-B", branch, "--track", &upstream])
                .await
        };
        match checkout {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {
                // The branch is checked out in a linked worktree; the fetch
                // above already refreshed its tracking ref.
                warn!(branch, error = %e, "branch checked out elsewhere, skipping pull");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        layout::remove_stale_shallow_lock(repo, PULL_STALE_LOCK);
        let pull = ["pull", self.config.pull_strategy.flag(), "--no-tags", "origin", branch];
        let result = match self.git.run_mutating(repo, &pull).await {
            Err(e) if e.is_lock_contention() => {
                layout::force_remove_shallow_lock(repo);
                self.git.run_mutating(repo, &pull).await
            }
            other => other,
        };

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_divergence() => {
                warn!(branch, error = %e, "pull diverged, resetting to fetched head");
                self.recover_divergence(repo, branch).await
            }
            Err(e) => Err(e),
        }
    }

    /// Abort any half-finished rebase/merge, fetch again, and hard-reset to
    /// `FETCH_HEAD` (the tracking ref may be stale when only FETCH_HEAD moved).
    async fn recover_divergence(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        let _ = self.git.run_mutating(repo, &["rebase", "--abort"]).await;
        let _ = self.git.run_mutating(repo, &["merge", "--abort"]).await;
        self.fetch_with_lock_recovery(repo, branch).await?;
        self.git
            .run_mutating(repo, &["reset", "--hard", "FETCH_HEAD"])
            .await?;
        info!(branch, "Recovered from divergent history");
        Ok(())
    }

    // =========================================================================
    // Worktrees
    // =========================================================================

    /// Create (or adopt) a worktree for `branch` at `path`.
    ///
    /// At most one worktree exists per `(origin, branch)`: a registration at a
    /// different path is removed first. The branch is attached if it exists
    /// locally, created from `origin/<branch>` if it exists remotely, and
    /// otherwise created from `origin/<base_branch>`. Returns the actual
    /// worktree path.
    #[instrument(skip_all, fields(origin = %origin.display(), path = %path.display(), branch = %branch, base = %base_branch))]
    pub async fn create_worktree(
        &self,
        origin: &Path,
        path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<PathBuf, GitError> {
        validate_name(branch)?;
        validate_name(base_branch)?;

        let _guard = self
            .worktree_locks
            .lock((origin.to_path_buf(), branch.to_string()))
            .await;

        if let Err(e) = self.fetch_with_lock_recovery(origin, branch).await {
            debug!(branch, error = %e, "remote branch fetch failed (non-fatal)");
        }
        let _ = self.git.run_mutating(origin, &["worktree", "prune"]).await;

        let entries = self.list_worktrees(origin).await?;
        if let Some(existing) = entries.iter().find(|e| e.branch.as_deref() == Some(branch)) {
            if same_path(&existing.path, path) {
                debug!("worktree already attached at requested path");
                self.finalize_worktree(&existing.path, branch).await?;
                return Ok(existing.path.clone());
            }
            if same_path(&existing.path, origin) {
                info!(branch, "detaching origin checkout to free branch for worktree");
                self.git
                    .run_mutating(origin, &["checkout", "--detach"])
                    .await?;
            } else {
                warn!(
                    branch,
                    old_path = %existing.path.display(),
                    "branch attached to another worktree, replacing it"
                );
                self.remove_worktree(origin, &existing.path).await?;
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let path_arg = path.display().to_string();
        let local = self.local_branch_exists(origin, branch).await;
        let remote = !local && self.remote_branch_exists(origin, branch).await;
        let from_base = !local && !remote;
        let args: Vec<String> = if local {
            vec!["worktree".into(), "add".into(), path_arg, branch.into()]
        } else if remote {
            vec![
                "worktree".into(),
                "add".into(),
                "--track".into(),
                "-b".into(),
                branch.into(),
                path_arg,
                format!("origin/{branch}"),
            ]
        } else {
            if let Err(e) = self.fetch_with_lock_recovery(origin, base_branch).await {
                debug!(base_branch, error = %e, "base branch fetch failed");
            }
            if !self.remote_branch_exists(origin, base_branch).await {
                return Err(GitError::MissingBaseBranch {
                    base: base_branch.to_string(),
                    branch: branch.to_string(),
                });
            }
            vec![
                "worktree".into(),
                "add".into(),
                "--no-track".into(),
                "-b".into(),
                branch.into(),
                path_arg,
                format!("origin/{base_branch}"),
            ]
        };

        let actual = match self.git.run_mutating(origin, &args).await {
            Ok(_) => path.to_path_buf(),
            Err(e) if e.is_already_exists() => {
                let entries = self.list_worktrees(origin).await?;
                let Some(entry) = entries.into_iter().find(|e| e.branch.as_deref() == Some(branch))
                else {
                    return Err(e);
                };
                info!(actual = %entry.path.display(), "worktree created concurrently, adopting it");
                entry.path
            }
            Err(e) if from_base && e.is_missing_ref() => {
                return Err(GitError::MissingBaseBranch {
                    base: base_branch.to_string(),
                    branch: branch.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        self.finalize_worktree(&actual, branch).await?;
        info!(actual = %actual.display(), from_base, "Worktree ready");
        Ok(actual)
    }

    /// Configure push/pull tracking and install hooks. Idempotent.
    async fn finalize_worktree(&self, worktree: &Path, branch: &str) -> Result<(), GitError> {
        let remote_key = format!("branch.{branch}.remote");
        let merge_key = format!("branch.{branch}.merge");
        let merge_ref = format!("refs/heads/{branch}");
        self.git
            .run_mutating(worktree, &["config", &remote_key, "origin"])
            .await?;
        self.git
            .run_mutating(worktree, &["config", &merge_key, &merge_ref])
            .await?;
        self.git
            .run_mutating(worktree, &["config", "push.autoSetupRemote", "true"])
            .await?;
        hooks::install_hooks(worktree, &self.config.protected_branches)
    }

    /// Deregister and delete a worktree. Missing directories are tolerated.
    pub async fn remove_worktree(&self, origin: &Path, path: &Path) -> Result<(), GitError> {
        let path_arg = path.display().to_string();
        if let Err(e) = self
            .git
            .run_mutating(origin, &["worktree", "remove", "--force", &path_arg])
            .await
        {
            warn!(path = %path.display(), error = %e, "git worktree remove failed, deleting directory");
        }
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.git.run_mutating(origin, &["worktree", "prune"]).await?;
        info!(path = %path.display(), "Removed worktree");
        Ok(())
    }

    /// List worktrees registered with `origin`.
    pub async fn list_worktrees(&self, origin: &Path) -> Result<Vec<WorktreeEntry>, GitError> {
        let out = self
            .git
            .run(origin, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_porcelain(&out.stdout))
    }

    // =========================================================================
    // Branch helpers
    // =========================================================================

    /// Whether `path` is a live git working tree.
    pub async fn is_git_directory(&self, path: &Path) -> bool {
        layout::has_git_marker(path)
            && self
                .git
                .run(path, &["rev-parse", "--is-inside-work-tree"])
                .await
                .is_ok_and(|out| out.text() == "true")
    }

    /// Like [`is_git_directory`](Self::is_git_directory), but only answers
    /// `false` when `path` has no git marker or git says it is not a
    /// repository. Timeouts, spawn failures and refusals are errors.
    pub async fn inspect_work_tree(&self, path: &Path) -> Result<bool, GitError> {
        if !layout::has_git_marker(path) {
            return Ok(false);
        }
        match self
            .git
            .run(path, &["rev-parse", "--is-inside-work-tree"])
            .await
        {
            Ok(out) => Ok(out.text() == "true"),
            Err(e) if e.is_not_a_repository() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn current_branch(&self, path: &Path) -> Option<String> {
        self.git
            .run(path, &["symbolic-ref", "--quiet", "--short", "HEAD"])
            .await
            .ok()
            .map(|out| out.text().to_string())
            .filter(|b| !b.is_empty())
    }

    pub async fn local_branch_exists(&self, repo: &Path, branch: &str) -> bool {
        let refname = format!("refs/heads/{branch}");
        self.git
            .succeeds(repo, &["rev-parse", "--verify", "--quiet", &refname])
            .await
    }

    pub async fn remote_branch_exists(&self, repo: &Path, branch: &str) -> bool {
        let refname = format!("refs/remotes/origin/{branch}");
        self.git
            .succeeds(repo, &["rev-parse", "--verify", "--quiet", &refname])
            .await
    }

    /// Fetch `branch` for an existing checkout. `Ok(false)` when the remote
    /// has no such branch.
    pub async fn fetch_remote_branch(&self, repo: &Path, branch: &str) -> Result<bool, GitError> {
        validate_name(branch)?;
        match self.fetch_with_lock_recovery(repo, branch).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_missing_ref() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Switch `worktree` to `branch`, creating it from `origin/<branch>` or,
    /// failing that, `origin/<base_branch>`.
    pub async fn switch_branch(
        &self,
        worktree: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<(), GitError> {
        validate_name(branch)?;
        if self.local_branch_exists(worktree, branch).await {
            self.git.run_mutating(worktree, &["switch", branch]).await?;
        } else if self.remote_branch_exists(worktree, branch).await {
            let upstream = format!("origin/{branch}");
            self.git
                .run_mutating(worktree, &["switch", "--track", "-c", branch, &upstream])
                .await?;
        } else {
            let start = format!("origin/{base_branch}");
            self.git
                .run_mutating(worktree, &["switch", "--no-track", "-c", branch, &start])
                .await
                .map_err(|e| {
                    if e.is_missing_ref() {
                        GitError::MissingBaseBranch {
                            base: base_branch.to_string(),
                            branch: branch.to_string(),
                        }
                    } else {
                        e
                    }
                })?;
        }
        self.finalize_worktree(worktree, branch).await
    }

    /// Whether the working tree has no staged, unstaged, or untracked changes.
    pub async fn is_clean(&self, path: &Path) -> Result<bool, GitError> {
        let out = self.git.run(path, &["status", "--porcelain"]).await?;
        Ok(out.text().is_empty())
    }

    pub async fn reset_hard(&self, path: &Path, target: &str) -> Result<(), GitError> {
        self.git
            .run_mutating(path, &["reset", "--hard", target])
            .await
            .map(drop)
    }

    // =========================================================================
    // History prewarming
    // =========================================================================

    /// Convert a shallow clone into a blob-filtered full-history clone and
    /// write a commit-graph. Rate-limited by a marker file; never fails.
    pub async fn prewarm_history(&self, repo: &Path) {
        let Some(git_dir) = layout::git_dir(repo) else {
            return;
        };
        let marker = layout::common_dir(&git_dir).join(PREWARM_MARKER);
        let recent = std::fs::metadata(&marker)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .is_some_and(|age| age < self.config.prewarm_interval());
        if recent {
            debug!(repo = %repo.display(), "history prewarm ran recently, skipping");
            return;
        }
        // Stamp first so concurrent callers back off.
        let stamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        if let Err(e) = tokio::fs::write(&marker, stamp.to_string()).await {
            warn!(marker = %marker.display(), error = %e, "Failed to write prewarm marker");
            return;
        }

        if layout::is_shallow(repo) {
            layout::remove_stale_shallow_lock(repo, PREWARM_STALE_LOCK);
            let steps: [&[&str]; 3] = [
                &["config", "remote.origin.promisor", "true"],
                &["config", "remote.origin.partialclonefilter", "blob:none"],
                &["fetch", "--no-tags", "--unshallow", "--filter=blob:none", "origin"],
            ];
            for args in steps {
                if let Err(e) = self.git.run_mutating(repo, args).await {
                    warn!(repo = %repo.display(), error = %e, "history prewarm step failed");
                    return;
                }
            }
            info!(repo = %repo.display(), "Converted shallow clone to full history");
        }

        match self
            .git
            .run(repo, &["commit-graph", "write", "--reachable"])
            .await
        {
            Ok(_) => debug!(repo = %repo.display(), "commit-graph written"),
            Err(e) => warn!(repo = %repo.display(), error = %e, "commit-graph write failed"),
        }
    }
}
