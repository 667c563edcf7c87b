//! One local⟷remote workspace sync session.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tether_core::SyncConfig;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::SyncError;
use super::batch::{BatchBuilder, PendingChange, PendingChanges, PreparedUpload, content_hash};
use super::channel::{self, ChannelError, ChannelEvents, FileAction, InboundFile, RemoteChannel};
use super::echo::{EchoGuard, PathGuards};
use super::filter::SyncIgnore;
use super::paths::{relative_path, resolve_destination};
use super::retry::RetryPolicy;
use super::timer::FlushTimer;
use super::watcher::{WatchHandle, scan_tree, watch_tree};

/// Point-in-time view of a session, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub local_path: PathBuf,
    pub run_id: Option<String>,
    pub pending: usize,
    /// Milliseconds since the epoch of the last successful flush.
    pub last_sync_at: Option<u64>,
    pub last_sync_files: usize,
    pub last_error: Option<String>,
    pub channel_available: bool,
    /// Retries are exhausted; waiting for an availability notification.
    pub lazy: bool,
    pub syncing: bool,
    pub retry_attempts: u32,
}

/// Result of applying an inbound batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundReport {
    pub applied: usize,
    pub rejected: usize,
}

#[derive(Debug)]
struct SessionState {
    pending: PendingChanges,
    echo: EchoGuard,
    retry_attempts: u32,
    waiting_for_remote: bool,
    syncing: bool,
    needs_flush: bool,
    last_sync_at: Option<u64>,
    last_sync_files: usize,
    last_error: Option<String>,
}

struct SessionInner {
    me: Weak<SessionInner>,
    root: PathBuf,
    run_id: Option<String>,
    config: SyncConfig,
    retry: RetryPolicy,
    channel: Arc<dyn RemoteChannel>,
    filter: Arc<SyncIgnore>,
    state: Mutex<SessionState>,
    timer: FlushTimer,
    watcher: Mutex<Option<WatchHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// Watches a workspace and streams its changes to a [`RemoteChannel`].
///
/// Cloning is cheap; all clones drive the same session.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

impl SyncSession {
    /// Start watching `root`, queue the whole tree, and schedule the first
    /// flush. A failure part-way tears everything down again.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub async fn start(
        root: &Path,
        run_id: Option<String>,
        channel: Arc<dyn RemoteChannel>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let root = tokio::fs::canonicalize(root).await?;
        if !tokio::fs::metadata(&root).await?.is_dir() {
            return Err(SyncError::NotADirectory(root.display().to_string()));
        }

        let filter = Arc::new(SyncIgnore::new(&root, &config.extra_ignores));
        let inner = Arc::new_cyclic(|me| SessionInner {
            me: me.clone(),
            state: Mutex::new(SessionState {
                pending: PendingChanges::default(),
                echo: EchoGuard::new(config.echo_suppression()),
                retry_attempts: 0,
                waiting_for_remote: false,
                syncing: false,
                needs_flush: false,
                last_sync_at: None,
                last_sync_files: 0,
                last_error: None,
            }),
            retry: RetryPolicy::from_config(&config),
            root,
            run_id,
            config,
            channel,
            filter,
            timer: FlushTimer::new(),
            watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        let session = Self { inner };
        if let Err(e) = session.begin().await {
            warn!(error = %e, "Sync session failed to start");
            session.dispose().await;
            return Err(e);
        }
        info!(run_id = ?session.inner.run_id, "Sync session started");
        Ok(session)
    }

    async fn begin(&self) -> Result<(), SyncError> {
        let inner = &self.inner;
        let (handle, events) = watch_tree(&inner.root, inner.config.write_stability())?;
        *inner.watcher.lock().await = Some(handle);

        let consumer = tokio::spawn(consume_events(Arc::downgrade(inner), events));
        let subscription = channel::subscribe(inner.channel.as_ref(), Arc::downgrade(inner));
        inner.tasks.lock().await.extend([consumer, subscription]);

        let queued = inner.enqueue_tree().await?;
        debug!(queued, "initial scan queued");
        inner.schedule_flush(inner.config.full_sync_delay()).await;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn run_id(&self) -> Option<&str> {
        self.inner.run_id.as_deref()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Record a local change to `path`. Returns whether it was queued
    /// (ignored, out-of-tree and echo-suppressed paths are dropped).
    pub async fn record_change(&self, path: &Path, action: FileAction) -> bool {
        self.inner.record_change(path, action).await
    }

    /// Upload everything pending now.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Drop queued writes, re-enumerate the tree and flush immediately.
    /// Returns how many files were queued.
    pub async fn full_sync(&self) -> Result<usize, SyncError> {
        self.inner.full_sync().await
    }

    /// Write or delete remote-origin files under the workspace root.
    pub async fn apply_inbound(&self, files: &[InboundFile]) -> InboundReport {
        let mut report = InboundReport::default();
        for file in files {
            match self.inner.apply_remote(file).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(path = %file.path, error = %e, "Rejected inbound file");
                    report.rejected += 1;
                }
            }
        }
        if report.applied > 0 {
            debug!(applied = report.applied, "inbound files applied");
        }
        report
    }

    pub async fn on_channel_available(&self) {
        self.inner.on_available().await;
    }

    pub async fn on_channel_unavailable(&self) {
        self.inner.on_unavailable().await;
    }

    pub async fn status(&self) -> SyncStatus {
        let inner = &self.inner;
        let state = inner.state.lock().await;
        SyncStatus {
            local_path: inner.root.clone(),
            run_id: inner.run_id.clone(),
            pending: state.pending.len(),
            last_sync_at: state.last_sync_at,
            last_sync_files: state.last_sync_files,
            last_error: state.last_error.clone(),
            channel_available: inner.channel.is_available(),
            lazy: state.waiting_for_remote,
            syncing: state.syncing,
            retry_attempts: state.retry_attempts,
        }
    }

    /// Stop timers, the watcher and subscriptions, and clear all state.
    /// Later calls are no-ops.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.timer.cancel().await;
        if let Some(watcher) = inner.watcher.lock().await.take() {
            watcher.stop();
        }
        for task in inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        let mut state = inner.state.lock().await;
        state.pending.clear();
        state.echo.clear();
        state.retry_attempts = 0;
        state.waiting_for_remote = false;
        state.needs_flush = false;
        info!(root = %inner.root.display(), "Sync session stopped");
    }
}

impl SessionInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    async fn record_change(&self, path: &Path, action: FileAction) -> bool {
        if self.is_disposed() {
            return false;
        }
        let Some(relative) = relative_path(&self.root, path) else {
            return false;
        };
        if relative.split('/').count() > self.config.max_watch_depth
            || self.filter.is_ignored(&relative, false)
        {
            return false;
        }

        let backing_off = {
            let mut state = self.state.lock().await;
            if state.echo.is_recent_remote(&relative) {
                debug!(path = %relative, "dropping echo of remote write");
                return false;
            }
            state.pending.upsert(PendingChange {
                action,
                absolute_path: path.to_path_buf(),
                relative_path: relative,
            });
            state.waiting_for_remote || state.retry_attempts > 0
        };
        // A backoff or lazy wait already owns the next flush.
        if !backing_off {
            self.schedule_flush(self.config.debounce()).await;
        }
        true
    }

    /// Turn one settled watcher path into pending changes.
    async fn observe_path(&self, path: PathBuf) {
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.file_type().is_symlink() => {}
            Ok(meta) if meta.is_dir() => {
                let Some(relative) = relative_path(&self.root, &path) else {
                    return;
                };
                if self.filter.is_ignored(&relative, true) {
                    return;
                }
                // Content moved in with the directory produces no events of its own.
                let root = self.root.clone();
                let filter = Arc::clone(&self.filter);
                let depth = self.config.max_watch_depth;
                let files = tokio::task::spawn_blocking(move || scan_tree(&root, &path, &filter, depth))
                    .await
                    .unwrap_or_default();
                for (file, _) in files {
                    self.record_change(&file, FileAction::Write).await;
                }
            }
            Ok(_) => {
                self.record_change(&path, FileAction::Write).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.record_change(&path, FileAction::Delete).await;
            }
            Err(e) => debug!(path = %path.display(), error = %e, "unreadable watcher path"),
        }
    }

    async fn enqueue_tree(&self) -> Result<usize, SyncError> {
        let root = self.root.clone();
        let filter = Arc::clone(&self.filter);
        let depth = self.config.max_watch_depth;
        let files = tokio::task::spawn_blocking(move || scan_tree(&root, &root, &filter, depth))
            .await
            .map_err(|e| SyncError::Scan(e.to_string()))?;

        let queued = files.len();
        let mut state = self.state.lock().await;
        for (absolute_path, relative_path) in files {
            state.pending.upsert(PendingChange {
                action: FileAction::Write,
                absolute_path,
                relative_path,
            });
        }
        Ok(queued)
    }

    async fn full_sync(&self) -> Result<usize, SyncError> {
        if self.is_disposed() {
            return Err(SyncError::Disposed);
        }
        {
            let mut state = self.state.lock().await;
            // Enumeration cannot rediscover deletions, so those stay queued.
            let deletes: Vec<_> = state
                .pending
                .take()
                .into_iter()
                .filter(|change| change.action == FileAction::Delete)
                .collect();
            state.pending.restore(deletes);
            state.echo.clear_hashes();
            state.retry_attempts = 0;
            state.waiting_for_remote = false;
        }
        let queued = self.enqueue_tree().await?;
        info!(queued, root = %self.root.display(), "Full sync requested");
        self.schedule_flush(self.config.full_sync_delay()).await;
        Ok(queued)
    }

    async fn schedule_flush(&self, delay: Duration) {
        if self.is_disposed() {
            return;
        }
        let me = self.me.clone();
        self.timer.schedule(delay, fire_flush(me)).await;
    }

    async fn schedule_retry(&self) {
        let delay = {
            let mut state = self.state.lock().await;
            if !self.retry.should_retry(state.retry_attempts) {
                if !state.waiting_for_remote {
                    state.waiting_for_remote = true;
                    warn!(
                        attempts = state.retry_attempts,
                        pending = state.pending.len(),
                        "Remote unreachable, sync paused until the channel returns"
                    );
                }
                return;
            }
            let delay = self.retry.delay_for_attempt(state.retry_attempts);
            state.retry_attempts += 1;
            delay
        };
        debug!(delay_ms = delay.as_millis(), "flush retry scheduled");
        self.schedule_flush(delay).await;
    }

    async fn flush(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            if self.is_disposed() {
                return;
            }
            if state.syncing {
                state.needs_flush = true;
                return;
            }
            if state.pending.is_empty() {
                return;
            }
            if !self.channel.is_available() {
                state.last_error = Some(ChannelError::Unavailable.to_string());
                drop(state);
                self.schedule_retry().await;
                return;
            }
            state.syncing = true;
            state.pending.take()
        };

        let count = snapshot.len();
        let result = self.upload_snapshot(&snapshot).await;

        let again = {
            let mut state = self.state.lock().await;
            state.syncing = false;
            match &result {
                Ok(sent) => {
                    state.retry_attempts = 0;
                    state.waiting_for_remote = false;
                    state.last_sync_at = Some(now_millis());
                    state.last_sync_files = *sent;
                    state.last_error = None;
                }
                Err(e) => {
                    state.pending.restore(snapshot);
                    state.last_error = Some(e.to_string());
                }
            }
            std::mem::take(&mut state.needs_flush)
        };

        match result {
            Ok(sent) => {
                if sent > 0 {
                    info!(files = sent, considered = count, "Sync flush complete");
                }
                if again {
                    self.schedule_flush(Duration::ZERO).await;
                }
            }
            Err(e) => {
                warn!(error = %e, restored = count, "Sync flush failed");
                self.schedule_retry().await;
            }
        }
    }

    /// Prepare, batch and upload a snapshot. Returns files sent.
    async fn upload_snapshot(&self, snapshot: &[PendingChange]) -> Result<usize, SyncError> {
        let mut builder = BatchBuilder::new(self.config.max_batch_files, self.config.max_batch_bytes);
        let mut sent = 0;
        for change in snapshot {
            let Some(item) = self.prepare(change).await else {
                continue;
            };
            if let Some(batch) = builder.push(item) {
                sent += self.send_batch(batch).await?;
            }
        }
        if let Some(batch) = builder.finish() {
            sent += self.send_batch(batch).await?;
        }
        Ok(sent)
    }

    async fn prepare(&self, change: &PendingChange) -> Option<PreparedUpload> {
        let relative = change.relative_path.clone();
        if change.action == FileAction::Delete {
            return Some(PreparedUpload::delete(relative));
        }

        let meta = match tokio::fs::symlink_metadata(&change.absolute_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Some(PreparedUpload::delete(relative));
            }
            Err(e) => {
                warn!(path = %relative, error = %e, "Cannot stat file, skipping");
                return None;
            }
        };
        if meta.file_type().is_symlink() || !meta.is_file() {
            debug!(path = %relative, "skipping non-regular file");
            return None;
        }
        let limit = self.config.max_file_bytes;
        if meta.len() > limit {
            warn!(path = %relative, size = meta.len(), limit, "Skipping oversized file");
            return None;
        }

        let content = match tokio::fs::read(&change.absolute_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Some(PreparedUpload::delete(relative));
            }
            Err(e) => {
                warn!(path = %relative, error = %e, "Cannot read file, skipping");
                return None;
            }
        };
        if content.len() as u64 > limit {
            warn!(path = %relative, size = content.len(), limit, "Skipping oversized file");
            return None;
        }

        let hash = content_hash(&content);
        if self.state.lock().await.echo.is_unchanged(&relative, &hash) {
            debug!(path = %relative, "content unchanged since last sync");
            return None;
        }
        Some(PreparedUpload::write(relative, &content, file_mode(&meta)))
    }

    async fn send_batch(&self, batch: Vec<PreparedUpload>) -> Result<usize, SyncError> {
        let (uploads, tracked): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|item| (item.upload, (item.relative_path, item.hash)))
            .unzip();
        let files = uploads.len();

        let timeout = self.config.upload_timeout();
        match tokio::time::timeout(timeout, self.channel.upload_files(uploads)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ChannelError::Timeout(timeout.as_secs()).into()),
        }

        let mut state = self.state.lock().await;
        for (relative, hash) in tracked {
            state.echo.record_upload(&relative, hash);
        }
        debug!(files, "batch acknowledged");
        Ok(files)
    }

    async fn apply_remote(&self, file: &InboundFile) -> Result<(), SyncError> {
        if self.is_disposed() {
            return Err(SyncError::Disposed);
        }
        let dest = resolve_destination(&self.root, &file.path)
            .ok_or_else(|| SyncError::OutsideWorkspace(file.path.clone()))?;
        let relative = relative_path(&self.root, &dest)
            .ok_or_else(|| SyncError::OutsideWorkspace(file.path.clone()))?;

        match file.action {
            FileAction::Delete => self.apply_remote_delete(&dest, &relative).await,
            FileAction::Write => {
                let content = STANDARD
                    .decode(file.content_base64.as_deref().unwrap_or_default())
                    .map_err(|e| SyncError::InvalidPayload(format!("{}: {e}", file.path)))?;
                self.apply_remote_write(&dest, &relative, &content, file.mode)
                    .await
            }
        }
    }

    async fn apply_remote_delete(&self, dest: &Path, relative: &str) -> Result<(), SyncError> {
        let is_dir = tokio::fs::symlink_metadata(dest)
            .await
            .is_ok_and(|meta| meta.is_dir());
        let undo = {
            let mut state = self.state.lock().await;
            let guards = state.echo.snapshot(relative);
            let displaced = if is_dir {
                state.echo.mark_remote_delete_tree(relative);
                state.pending.remove_within(relative)
            } else {
                state.echo.mark_remote_delete(relative);
                state.pending.remove(relative).into_iter().collect()
            };
            RemoteApplyUndo { guards, displaced }
        };

        let removal = if is_dir {
            tokio::fs::remove_dir_all(dest).await
        } else {
            tokio::fs::remove_file(dest).await
        };
        match removal {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                self.undo_remote_apply(relative, undo).await;
                Err(e.into())
            }
        }
    }

    async fn apply_remote_write(
        &self,
        dest: &Path,
        relative: &str,
        content: &[u8],
        mode: Option<u32>,
    ) -> Result<(), SyncError> {
        let undo = {
            // Guards go up before the bytes land.
            let mut state = self.state.lock().await;
            let guards = state.echo.snapshot(relative);
            let displaced = state.pending.remove(relative).into_iter().collect();
            state.echo.mark_remote_write(relative, content_hash(content));
            RemoteApplyUndo { guards, displaced }
        };
        if let Err(e) = write_file(dest, content, mode).await {
            self.undo_remote_apply(relative, undo).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Give back what a failed remote apply took from the local side.
    async fn undo_remote_apply(&self, relative: &str, undo: RemoteApplyUndo) {
        let restored = undo.displaced.len();
        let backing_off = {
            let mut state = self.state.lock().await;
            state.echo.restore(relative, undo.guards);
            state.pending.restore(undo.displaced);
            state.waiting_for_remote || state.retry_attempts > 0
        };
        if restored > 0 {
            debug!(path = relative, restored, "local changes restored after failed remote apply");
            if !backing_off {
                self.schedule_flush(self.config.debounce()).await;
            }
        }
    }
}

/// Local state displaced by a remote apply, kept until the apply lands.
struct RemoteApplyUndo {
    guards: PathGuards,
    displaced: Vec<PendingChange>,
}

async fn write_file(dest: &Path, content: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, content).await?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode & 0o7777);
        tokio::fs::set_permissions(dest, perms).await?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

#[async_trait]
impl ChannelEvents for SessionInner {
    async fn on_available(&self) {
        if self.is_disposed() {
            return;
        }
        let (was_lazy, has_pending) = {
            let mut state = self.state.lock().await;
            let was_lazy = std::mem::take(&mut state.waiting_for_remote);
            state.retry_attempts = 0;
            (was_lazy, !state.pending.is_empty())
        };
        info!(was_lazy, has_pending, "Remote channel available");
        if has_pending {
            self.schedule_flush(self.config.reconnect_flush()).await;
        }
    }

    async fn on_unavailable(&self) {
        if self.is_disposed() {
            return;
        }
        let schedule = {
            let state = self.state.lock().await;
            !state.waiting_for_remote && !state.pending.is_empty()
        };
        info!("Remote channel unavailable");
        if schedule {
            self.schedule_flush(self.config.disconnect_flush()).await;
        }
    }
}

fn fire_flush(session: Weak<SessionInner>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Some(inner) = session.upgrade() {
            inner.flush().await;
        }
    })
}

async fn consume_events(session: Weak<SessionInner>, mut events: mpsc::UnboundedReceiver<PathBuf>) {
    while let Some(path) = events.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        inner.observe_path(path).await;
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
