//! Recursive workspace watcher with write-stability staging, and the full
//! tree enumeration used by initial and manual syncs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::SyncError;
use super::filter::SyncIgnore;
use super::paths::relative_path;

/// Keeps the OS watcher and its staging task alive.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
    pump: JoinHandle<()>,
}

impl WatchHandle {
    pub fn stop(self) {
        self.pump.abort();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Watch `root` recursively. Paths come out of the returned receiver once
/// they have been quiet for `stability`.
pub fn watch_tree(
    root: &Path,
    stability: Duration,
) -> Result<(WatchHandle, mpsc::UnboundedReceiver<PathBuf>), SyncError> {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    for path in event.paths {
                        let _ = raw_tx.send(path);
                    }
                }
            }
            Err(e) => warn!(error = %e, "File watcher error"),
        },
        notify::Config::default(),
    )
    .map_err(|e| SyncError::Watcher(e.to_string()))?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| SyncError::Watcher(format!("failed to watch {}: {e}", root.display())))?;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let pump = tokio::spawn(stage_events(raw_rx, out_tx, stability));
    debug!(root = %root.display(), "workspace watcher started");

    Ok((
        WatchHandle {
            _watcher: watcher,
            pump,
        },
        out_rx,
    ))
}

/// Hold each path until no event has touched it for `stability`.
async fn stage_events(
    mut raw: mpsc::UnboundedReceiver<PathBuf>,
    out: mpsc::UnboundedSender<PathBuf>,
    stability: Duration,
) {
    let mut staged: HashMap<PathBuf, Instant> = HashMap::new();
    loop {
        let next_due = staged.values().min().map(|seen| *seen + stability);
        let due = async {
            match next_due {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            received = raw.recv() => match received {
                Some(path) => {
                    staged.insert(path, Instant::now());
                }
                None => break,
            },
            () = due => {
                let now = Instant::now();
                let ready: Vec<PathBuf> = staged
                    .iter()
                    .filter(|(_, seen)| **seen + stability <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in ready {
                    staged.remove(&path);
                    if out.send(path).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Every regular, non-ignored file under `start` (a directory inside
/// `root`) as (absolute, root-relative). Symlinks are neither followed nor
/// returned.
pub fn scan_tree(
    root: &Path,
    start: &Path,
    filter: &SyncIgnore,
    max_depth: usize,
) -> Vec<(PathBuf, String)> {
    let start_depth = start
        .strip_prefix(root)
        .map_or(0, |rel| rel.components().count());
    WalkDir::new(start)
        .follow_links(false)
        .max_depth(max_depth.saturating_sub(start_depth))
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || relative_path(root, entry.path())
                    .is_some_and(|rel| !filter.is_ignored(&rel, entry.file_type().is_dir()))
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = relative_path(root, entry.path())?;
            Some((entry.into_path(), rel))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn scan_skips_ignored_and_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn f() {}").unwrap();
        std::fs::write(root.join("README.md"), "# hi").unwrap();
        std::fs::write(root.join("node_modules/pkg/index.js"), "").unwrap();
        std::fs::write(root.join("debug.log"), "").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(root.join("README.md"), root.join("link.md")).unwrap();

        let filter = SyncIgnore::new(root, &[]);
        let mut found: Vec<_> = scan_tree(root, root, &filter, 64)
            .into_iter()
            .map(|(_, rel)| rel)
            .collect();
        found.sort();
        assert_eq!(found, vec!["README.md", "src/lib.rs"]);
    }

    #[test]
    fn scan_respects_depth() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("a/b/c")).unwrap();
        std::fs::write(root.join("a/top.txt"), "").unwrap();
        std::fs::write(root.join("a/b/c/deep.txt"), "").unwrap();

        let filter = SyncIgnore::new(root, &[]);
        let found: Vec<_> = scan_tree(root, root, &filter, 2)
            .into_iter()
            .map(|(_, rel)| rel)
            .collect();
        assert_eq!(found, vec!["a/top.txt"]);
    }

    #[tokio::test]
    async fn staged_events_are_emitted_once_quiet() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        tokio::spawn(stage_events(raw_rx, out_tx, Duration::from_millis(50)));

        raw_tx.send(PathBuf::from("/ws/a.txt")).unwrap();
        raw_tx.send(PathBuf::from("/ws/a.txt")).unwrap();
        raw_tx.send(PathBuf::from("/ws/b.txt")).unwrap();

        let mut emitted = Vec::new();
        for _ in 0..2 {
            let path = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
                .await
                .unwrap()
                .unwrap();
            emitted.push(path);
        }
        emitted.sort();
        assert_eq!(emitted, vec![PathBuf::from("/ws/a.txt"), PathBuf::from("/ws/b.txt")]);
        assert!(
            tokio::time::timeout(Duration::from_millis(200), out_rx.recv())
                .await
                .is_err()
        );
    }
}
