//! Registry of sync sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tether_core::SyncConfig;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::coord::KeyedLock;

use super::SyncError;
use super::channel::{InboundBatch, RemoteChannel};
use super::session::{InboundReport, SyncSession, SyncStatus};

/// Result of an explicit sync trigger. Failures are reported, not raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub ok: bool,
    pub files_queued: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncOutcome {
    fn failed(error: impl ToString) -> Self {
        Self {
            ok: false,
            files_queued: 0,
            error: Some(error.to_string()),
        }
    }
}

/// Owns every [`SyncSession`] in the process, keyed by canonical local
/// path, with a reverse index from run id to path.
pub struct SyncManager {
    config: SyncConfig,
    sessions: Arc<RwLock<HashMap<PathBuf, SyncSession>>>,
    runs: Arc<RwLock<HashMap<String, PathBuf>>>,
    starting: KeyedLock<PathBuf>,
}

impl SyncManager {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            runs: Arc::new(RwLock::new(HashMap::new())),
            starting: KeyedLock::new(),
        }
    }

    /// Start syncing `local_path` through `channel`. Returns the existing
    /// session when one is already running for the path.
    #[instrument(skip_all, fields(path = %local_path.display(), run_id = ?run_id))]
    pub async fn start_sync(
        &self,
        local_path: &Path,
        run_id: Option<String>,
        channel: Arc<dyn RemoteChannel>,
    ) -> Result<SyncSession, SyncError> {
        let key = tokio::fs::canonicalize(local_path).await?;
        let _guard = self.starting.lock(key.clone()).await;

        if let Some(existing) = self.sessions.read().await.get(&key).cloned() {
            debug!("sync session already running");
            if let Some(run_id) = run_id {
                self.runs.write().await.insert(run_id, key);
            }
            return Ok(existing);
        }

        let session = SyncSession::start(&key, run_id.clone(), channel, self.config.clone()).await?;
        self.sessions.write().await.insert(key.clone(), session.clone());
        if let Some(run_id) = run_id {
            self.runs.write().await.insert(run_id, key);
        }
        Ok(session)
    }

    /// Stop and forget the session for `local_path`. Returns whether one
    /// existed.
    pub async fn stop_sync(&self, local_path: &Path) -> bool {
        let key = canonical_or_given(local_path).await;
        let Some(session) = self.sessions.write().await.remove(&key) else {
            return false;
        };
        self.runs.write().await.retain(|_, path| *path != key);
        session.dispose().await;
        true
    }

    /// Stop every session.
    pub async fn stop_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        self.runs.write().await.clear();
        for session in sessions {
            session.dispose().await;
        }
    }

    /// Manual full resync of one workspace.
    pub async fn trigger_sync(&self, local_path: &Path) -> SyncOutcome {
        let Some(session) = self.session(local_path).await else {
            return SyncOutcome::failed(SyncError::UnknownSession(
                local_path.display().to_string(),
            ));
        };
        match session.full_sync().await {
            Ok(files_queued) => SyncOutcome {
                ok: true,
                files_queued,
                error: None,
            },
            Err(e) => {
                warn!(path = %local_path.display(), error = %e, "Manual sync failed");
                SyncOutcome::failed(e)
            }
        }
    }

    pub async fn get_status(&self, local_path: &Path) -> Option<SyncStatus> {
        let session = self.session(local_path).await?;
        Some(session.status().await)
    }

    pub async fn get_all_sessions(&self) -> Vec<SyncStatus> {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(sessions.len());
        for session in sessions {
            statuses.push(session.status().await);
        }
        statuses
    }

    pub async fn session(&self, local_path: &Path) -> Option<SyncSession> {
        let key = canonical_or_given(local_path).await;
        self.sessions.read().await.get(&key).cloned()
    }

    pub async fn session_for_run(&self, run_id: &str) -> Option<SyncSession> {
        let path = self.runs.read().await.get(run_id).cloned()?;
        self.sessions.read().await.get(&path).cloned()
    }

    /// Apply a remote→local batch to the session registered for its run.
    pub async fn handle_inbound(&self, batch: InboundBatch) -> Result<InboundReport, SyncError> {
        let session = self
            .session_for_run(&batch.run_id)
            .await
            .ok_or_else(|| SyncError::UnknownSession(batch.run_id.clone()))?;
        let report = session.apply_inbound(&batch.files).await;
        if report.rejected > 0 {
            warn!(
                run_id = %batch.run_id,
                rejected = report.rejected,
                applied = report.applied,
                "Inbound batch partially rejected"
            );
        }
        Ok(report)
    }

    /// Route a channel-up notification for `run_id`. Returns whether a
    /// session received it.
    pub async fn notify_channel_available(&self, run_id: &str) -> bool {
        let Some(session) = self.session_for_run(run_id).await else {
            return false;
        };
        info!(run_id, "Routing channel-available notification");
        session.on_channel_available().await;
        true
    }

    pub async fn notify_channel_unavailable(&self, run_id: &str) -> bool {
        let Some(session) = self.session_for_run(run_id).await else {
            return false;
        };
        session.on_channel_unavailable().await;
        true
    }
}

async fn canonical_or_given(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}
