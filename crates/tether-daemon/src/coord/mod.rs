//! Coordination primitives shared by the git and worktree layers.

pub mod keyed_lock;
pub mod singleflight;

pub use keyed_lock::{KeyedGuard, KeyedLock};
pub use singleflight::SingleFlight;
