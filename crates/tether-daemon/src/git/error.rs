//! Git error types and stderr classification.

use std::sync::Arc;

use thiserror::Error;

/// Coarse classification of a failed git invocation, derived from stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitFailureKind {
    /// Another process holds a `*.lock` file.
    LockContention,
    /// Divergent, conflicting, or unrelated histories.
    Divergence,
    /// A ref, revision, or remote branch does not exist.
    MissingRef,
    /// The branch or worktree already exists / is already checked out.
    AlreadyExists,
    /// The working directory is not inside any repository.
    NotARepository,
    Other,
}

impl GitFailureKind {
    /// Classify a git stderr blob.
    pub fn classify(stderr: &str) -> Self {
        let s = stderr.to_ascii_lowercase();
        if s.contains("not a git repository") {
            Self::NotARepository
        } else if s.contains("shallow.lock")
            || s.contains("index.lock")
            || s.contains("another git process")
            || (s.contains(".lock") && (s.contains("file exists") || s.contains("unable to create")))
        {
            Self::LockContention
        } else if s.contains("divergent branches")
            || s.contains("not possible to fast-forward")
            || s.contains("unrelated histories")
            || s.contains("conflict")
            || s.contains("non-fast-forward")
            || s.contains("need to specify how to reconcile")
            || s.contains("could not apply")
        {
            Self::Divergence
        } else if s.contains("already exists")
            || s.contains("is already checked out")
            || s.contains("is already used by worktree")
            || s.contains("already registered")
        {
            Self::AlreadyExists
        } else if s.contains("invalid reference")
            || s.contains("not a valid object name")
            || s.contains("couldn't find remote ref")
            || s.contains("unknown revision")
            || s.contains("not a commit")
            || s.contains("invalid upstream")
            || s.contains("did not match any")
        {
            Self::MissingRef
        } else {
            Self::Other
        }
    }
}

/// Errors from git operations. Cloneable so shared in-flight results can be
/// handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum GitError {
    #[error("git {command} failed: {stderr}")]
    Command {
        /// Redacted command line (without the `git` prefix).
        command: String,
        /// Redacted, trimmed stderr.
        stderr: String,
        kind: GitFailureKind,
    },

    #[error("Failed to spawn git ({executable}): {reason}")]
    Spawn { executable: String, reason: String },

    #[error("git {command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Base branch '{base}' does not exist on origin (needed to create '{branch}')")]
    MissingBaseBranch { base: String, branch: String },

    #[error("Not a git repository: {0}")]
    NotARepository(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for GitError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl GitError {
    /// Failure kind, `Other` for anything that is not a git exit failure.
    pub const fn kind(&self) -> GitFailureKind {
        match self {
            Self::Command { kind, .. } => *kind,
            Self::MissingBaseBranch { .. } => GitFailureKind::MissingRef,
            Self::NotARepository(_) => GitFailureKind::NotARepository,
            _ => GitFailureKind::Other,
        }
    }

    pub fn is_lock_contention(&self) -> bool {
        self.kind() == GitFailureKind::LockContention
    }

    pub fn is_divergence(&self) -> bool {
        self.kind() == GitFailureKind::Divergence
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == GitFailureKind::AlreadyExists
    }

    pub fn is_missing_ref(&self) -> bool {
        self.kind() == GitFailureKind::MissingRef
    }

    pub fn is_not_a_repository(&self) -> bool {
        self.kind() == GitFailureKind::NotARepository
    }
}
