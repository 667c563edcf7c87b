//! Tether Daemon Library
//!
//! Local side of a remote-development setup:
//! - Git repository and worktree orchestration under concurrent callers
//! - Per-run worktree coordination
//! - Bidirectional workspace file sync over a remote channel
//! - Singleflight and keyed-lock coordination primitives

pub mod context;
pub mod coord;
pub mod git;
pub mod sync;
pub mod worktree;

pub use context::OrchestrationContext;
