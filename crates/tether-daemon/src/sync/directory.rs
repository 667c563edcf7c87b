//! A [`RemoteChannel`] backed by a local directory, e.g. a mounted remote
//! filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::channel::{ChannelError, FileAction, FileUpload, RemoteChannel};
use super::paths::resolve_destination;

pub struct DirectoryChannel {
    root: PathBuf,
    available: watch::Sender<bool>,
}

impl DirectoryChannel {
    /// Mirror into `root`, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ChannelError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| ChannelError::Io(e.to_string()))?;
        let (available, _) = watch::channel(true);
        Ok(Self { root, available })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Flip availability; subscribers are notified on change only.
    pub fn set_available(&self, available: bool) {
        self.available.send_if_modified(|current| {
            let changed = *current != available;
            *current = available;
            changed
        });
    }

    async fn apply(&self, upload: &FileUpload) -> Result<(), ChannelError> {
        let dest = resolve_destination(&self.root, &upload.destination_path).ok_or_else(|| {
            ChannelError::Rejected(format!(
                "destination escapes channel root: {}",
                upload.destination_path
            ))
        })?;

        match upload.action {
            FileAction::Delete => match tokio::fs::remove_file(&dest).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(ChannelError::Io(e.to_string())),
            },
            FileAction::Write => {
                let content = STANDARD
                    .decode(upload.content_base64.as_deref().unwrap_or_default())
                    .map_err(|e| ChannelError::Rejected(format!("bad payload: {e}")))?;
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| ChannelError::Io(e.to_string()))?;
                }
                tokio::fs::write(&dest, content)
                    .await
                    .map_err(|e| ChannelError::Io(e.to_string()))?;
                #[cfg(unix)]
                if let Some(mode) = upload.mode {
                    use std::os::unix::fs::PermissionsExt;
                    tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))
                        .await
                        .map_err(|e| ChannelError::Io(e.to_string()))?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl RemoteChannel for DirectoryChannel {
    fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    async fn upload_files(&self, batch: Vec<FileUpload>) -> Result<(), ChannelError> {
        if !self.is_available() {
            return Err(ChannelError::Unavailable);
        }
        for upload in &batch {
            if let Err(e) = self.apply(upload).await {
                warn!(path = %upload.destination_path, error = %e, "Directory channel rejected file");
                return Err(e);
            }
        }
        debug!(files = batch.len(), root = %self.root.display(), "batch mirrored");
        Ok(())
    }

    fn availability(&self) -> watch::Receiver<bool> {
        self.available.subscribe()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn write(path: &str, content: &[u8]) -> FileUpload {
        FileUpload {
            destination_path: path.into(),
            action: FileAction::Write,
            content_base64: Some(STANDARD.encode(content)),
            mode: Some(0o644),
        }
    }

    #[tokio::test]
    async fn mirrors_writes_and_deletes() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = DirectoryChannel::open(tmp.path().join("remote")).await.unwrap();

        channel
            .upload_files(vec![write("src/a.txt", b"hello"), write("b.txt", b"bye")])
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(channel.root().join("src/a.txt")).unwrap(),
            b"hello"
        );

        channel
            .upload_files(vec![FileUpload::delete("b.txt"), FileUpload::delete("missing.txt")])
            .await
            .unwrap();
        assert!(!channel.root().join("b.txt").exists());
    }

    #[tokio::test]
    async fn rejects_escaping_destinations() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = DirectoryChannel::open(tmp.path().join("remote")).await.unwrap();

        let err = channel
            .upload_files(vec![write("../escape.txt", b"x")])
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Rejected(_)));
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn unavailable_channel_refuses_and_notifies() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = DirectoryChannel::open(tmp.path()).await.unwrap();
        let mut rx = channel.availability();

        channel.set_available(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());

        let err = channel.upload_files(vec![write("a.txt", b"x")]).await.unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable));

        // No-op flips do not notify.
        channel.set_available(false);
        assert!(!rx.has_changed().unwrap());
    }
}
