//! Git repository orchestration.
//!
//! Clones, fetches, branch switches and worktree lifecycle for origin
//! repositories, safe under concurrent callers and tolerant of locked or
//! history-rewritten repositories.

pub mod command;
pub mod error;
pub mod hooks;
pub mod layout;
mod manager;
pub mod refname;

pub use command::{GitOutput, GitRunner, redact_credentials, resolve_git_executable};
pub use error::{GitError, GitFailureKind};
pub use manager::{
    OperationKey, RepositoryManager, WorktreeEntry, parse_symref_head, parse_worktree_porcelain,
};
pub use refname::validate_name;
