//! Remote channel: the ack-based link to a remote environment.
//!
//! The transport itself lives elsewhere; sessions only need to upload file
//! batches, ask whether the link is up, and observe availability changes.

use std::sync::Weak;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Write,
    Delete,
}

/// One entry of an outbound batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpload {
    /// Forward-slash path relative to the workspace root.
    pub destination_path: String,
    pub action: FileAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_base64: Option<String>,
    /// Unix permission bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl FileUpload {
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            destination_path: path.into(),
            action: FileAction::Delete,
            content_base64: None,
            mode: None,
        }
    }

    /// Approximate wire size, used for batch byte bounds.
    pub fn wire_size(&self) -> usize {
        self.destination_path.len() + self.content_base64.as_ref().map_or(0, String::len)
    }
}

/// One remote-origin file change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFile {
    pub path: String,
    pub action: FileAction,
    #[serde(default)]
    pub content_base64: Option<String>,
    #[serde(default)]
    pub mode: Option<u32>,
}

/// Inbound remote→local sync message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundBatch {
    pub run_id: String,
    pub files: Vec<InboundFile>,
    /// Sender timestamp, milliseconds since the epoch.
    pub timestamp: i64,
}

/// Errors from a remote channel call.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("Remote channel unavailable")]
    Unavailable,

    #[error("Remote channel timed out after {0}s")]
    Timeout(u64),

    #[error("Remote rejected batch: {0}")]
    Rejected(String),

    #[error("Remote channel I/O error: {0}")]
    Io(String),
}

/// Addressable, acknowledged link to one remote environment.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Whether the remote is currently reachable.
    fn is_available(&self) -> bool;

    /// Upload one batch; resolves when the remote acknowledges it.
    async fn upload_files(&self, batch: Vec<FileUpload>) -> Result<(), ChannelError>;

    /// Availability observer: the value flips on connect / disconnect.
    fn availability(&self) -> watch::Receiver<bool>;
}

/// Receiver side of channel availability notifications.
#[async_trait]
pub trait ChannelEvents: Send + Sync {
    async fn on_available(&self);
    async fn on_unavailable(&self);
}

/// Forward availability flips from `channel` to `events` until either side
/// goes away.
pub fn subscribe<E>(channel: &dyn RemoteChannel, events: Weak<E>) -> JoinHandle<()>
where
    E: ChannelEvents + 'static,
{
    let mut availability = channel.availability();
    tokio::spawn(async move {
        while availability.changed().await.is_ok() {
            let available = *availability.borrow_and_update();
            let Some(events) = events.upgrade() else {
                break;
            };
            if available {
                events.on_available().await;
            } else {
                events.on_unavailable().await;
            }
        }
    })
}
