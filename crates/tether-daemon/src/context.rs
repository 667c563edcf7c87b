//! Process-scoped composition root.

use std::path::PathBuf;
use std::sync::Arc;

use tether_core::Config;
use tracing::info;

use crate::git::{GitRunner, RepositoryManager};
use crate::sync::SyncManager;
use crate::worktree::WorktreeCoordinator;

/// Everything one process needs, built once and passed to whoever needs it.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub config: Arc<Config>,
    pub repos: RepositoryManager,
    pub worktrees: WorktreeCoordinator,
    pub sync: Arc<SyncManager>,
}

impl OrchestrationContext {
    pub fn new(config: Config) -> Self {
        let git = GitRunner::discover(
            config.git.git_executable.as_deref(),
            config.git.command_timeout(),
        );
        info!(git = %git.executable().display(), "Resolved git executable");

        let repos = RepositoryManager::new(git, config.git.clone());
        let worktrees = WorktreeCoordinator::new(repos.clone());
        let sync = Arc::new(SyncManager::new(config.sync.clone()));
        Self {
            config: Arc::new(config),
            repos,
            worktrees,
            sync,
        }
    }

    /// Base directory for run worktrees.
    pub fn worktree_dir(&self) -> PathBuf {
        self.config.daemon.worktree_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".tether")
                .join("worktrees")
        })
    }

    /// Stop background work owned by the context.
    pub async fn shutdown(&self) {
        self.sync.stop_all().await;
    }
}
