//! Bidirectional workspace file synchronisation.

pub mod batch;
pub mod channel;
pub mod directory;
pub mod echo;
pub mod filter;
mod manager;
pub mod paths;
pub mod retry;
mod session;
pub mod timer;
pub mod watcher;

use std::sync::Arc;

use thiserror::Error;

pub use channel::{
    ChannelError, ChannelEvents, FileAction, FileUpload, InboundBatch, InboundFile, RemoteChannel,
};
pub use directory::DirectoryChannel;
pub use manager::{SyncManager, SyncOutcome};
pub use session::{InboundReport, SyncSession, SyncStatus};

/// Errors from sync sessions and the session registry.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("File watcher error: {0}")]
    Watcher(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Path resolves outside the workspace: {0}")]
    OutsideWorkspace(String),

    #[error("Invalid inbound payload: {0}")]
    InvalidPayload(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Tree scan failed: {0}")]
    Scan(String),

    #[error("No sync session for {0}")]
    UnknownSession(String),

    #[error("Sync session already disposed")]
    Disposed,
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}
