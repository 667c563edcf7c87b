//! On-disk git layout: `.git` directories, worktree pointer files, the shared
//! `commondir`, and stale lock remediation.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

/// Resolve the git directory for a working tree.
///
/// A regular checkout has a `.git` directory; a linked worktree has a `.git`
/// file containing `gitdir: <path>` (relative paths are relative to the
/// worktree).
pub fn git_dir(work_tree: &Path) -> Option<PathBuf> {
    let dot_git = work_tree.join(".git");
    let meta = std::fs::symlink_metadata(&dot_git).ok()?;
    if meta.is_dir() {
        return Some(dot_git);
    }
    if meta.is_file() {
        let content = std::fs::read_to_string(&dot_git).ok()?;
        let target = content
            .lines()
            .find_map(|line| line.strip_prefix("gitdir:"))?
            .trim();
        let target = PathBuf::from(target);
        let resolved = if target.is_absolute() {
            target
        } else {
            work_tree.join(target)
        };
        return resolved.is_dir().then_some(resolved);
    }
    None
}

/// Resolve the common directory shared by all worktrees of a repository.
///
/// Linked worktree git dirs carry a `commondir` file pointing (usually
/// relatively) at the main `.git`; a main git dir is its own common dir.
pub fn common_dir(git_dir: &Path) -> PathBuf {
    let Ok(content) = std::fs::read_to_string(git_dir.join("commondir")) else {
        return git_dir.to_path_buf();
    };
    let target = PathBuf::from(content.trim());
    if target.is_absolute() {
        target
    } else {
        git_dir.join(target)
    }
}

/// Hooks directory that git consults for `work_tree` (hooks are shared).
pub fn hooks_dir(work_tree: &Path) -> Option<PathBuf> {
    git_dir(work_tree).map(|dir| common_dir(&dir).join("hooks"))
}

/// Whether `path` carries a version-control metadata marker.
pub fn has_git_marker(path: &Path) -> bool {
    git_dir(path).is_some()
}

/// Whether the repository is a shallow clone.
pub fn is_shallow(work_tree: &Path) -> bool {
    git_dir(work_tree).is_some_and(|dir| common_dir(&dir).join("shallow").exists())
}

fn shallow_lock_path(work_tree: &Path) -> Option<PathBuf> {
    git_dir(work_tree).map(|dir| common_dir(&dir).join("shallow.lock"))
}

/// Remove `shallow.lock` if it is older than `max_age`. Returns whether a
/// lock was removed.
pub fn remove_stale_shallow_lock(work_tree: &Path, max_age: Duration) -> bool {
    let Some(lock) = shallow_lock_path(work_tree) else {
        return false;
    };
    let Ok(meta) = std::fs::metadata(&lock) else {
        return false;
    };
    let age = meta
        .modified()
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .unwrap_or_default();
    if age < max_age {
        return false;
    }
    match std::fs::remove_file(&lock) {
        Ok(()) => {
            info!(lock = %lock.display(), age_secs = age.as_secs(), "Removed stale shallow.lock");
            true
        }
        Err(e) => {
            warn!(lock = %lock.display(), error = %e, "Failed to remove stale shallow.lock");
            false
        }
    }
}

/// Remove `shallow.lock` regardless of age. Used after a lock-contention
/// failure, right before the single retry.
pub fn force_remove_shallow_lock(work_tree: &Path) -> bool {
    let Some(lock) = shallow_lock_path(work_tree) else {
        return false;
    };
    match std::fs::remove_file(&lock) {
        Ok(()) => {
            warn!(lock = %lock.display(), "Force-removed shallow.lock after lock contention");
            true
        }
        Err(_) => false,
    }
}
