//! Per-run git worktree coordination.
//!
//! Maps a logical run id onto a worktree + branch of an origin repository,
//! creating or repositioning it through the [`RepositoryManager`](crate::git::RepositoryManager).

mod coordinator;

pub use coordinator::{EnsuredWorktree, RunSpec, WorktreeCoordinator, WorktreeError};
