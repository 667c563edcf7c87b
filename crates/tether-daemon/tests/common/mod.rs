//! Shared fixtures: throwaway git repositories and a recording channel.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::{Semaphore, watch};

use tether_daemon::git::{GitRunner, RepositoryManager};
use tether_daemon::sync::{ChannelError, FileAction, FileUpload, RemoteChannel};

/// Run git synchronously with a fixed identity, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A bare upstream plus a separate working clone used to author commits.
pub struct Upstream {
    pub bare: PathBuf,
    pub author: PathBuf,
}

impl Upstream {
    /// Create `upstream.git` with one commit on `main` under `root`.
    pub fn create(root: &Path) -> Self {
        let bare = root.join("upstream.git");
        let author = root.join("author");
        std::fs::create_dir_all(&bare).unwrap();
        std::fs::create_dir_all(&author).unwrap();
        git(&bare, &["init", "--bare", "-b", "main"]);
        git(&author, &["init", "-b", "main"]);
        git(&author, &["remote", "add", "origin", bare.to_str().unwrap()]);
        std::fs::write(author.join("README.md"), "# upstream\n").unwrap();
        git(&author, &["add", "."]);
        git(&author, &["commit", "-m", "initial"]);
        git(&author, &["push", "-u", "origin", "main"]);
        Self { bare, author }
    }

    pub fn url(&self) -> String {
        self.bare.display().to_string()
    }

    /// Commit `file` with `content` on `branch` and push it.
    pub fn commit(&self, branch: &str, file: &str, content: &str) -> String {
        git(&self.author, &["checkout", "-B", branch]);
        std::fs::write(self.author.join(file), content).unwrap();
        git(&self.author, &["add", "."]);
        git(&self.author, &["commit", "-m", &format!("update {file}")]);
        git(&self.author, &["push", "--force", "origin", branch]);
        git(&self.author, &["rev-parse", "HEAD"])
    }

    /// Replace the tip of `branch` with a rewritten commit and force-push.
    pub fn rewrite(&self, branch: &str, file: &str, content: &str) -> String {
        git(&self.author, &["checkout", branch]);
        std::fs::write(self.author.join(file), content).unwrap();
        git(&self.author, &["add", "."]);
        git(&self.author, &["commit", "--amend", "-m", "rewritten"]);
        git(&self.author, &["push", "--force", "origin", branch]);
        git(&self.author, &["rev-parse", "HEAD"])
    }
}

pub fn manager() -> RepositoryManager {
    let git = GitRunner::discover(None, Duration::from_secs(120));
    RepositoryManager::new(git, tether_core::GitConfig::default())
}

/// A manager whose git runs `prelude` (a shell fragment with `$1` bound to
/// the subcommand) before handing off to the real git.
#[cfg(unix)]
pub fn scripted_manager(dir: &Path, prelude: &str) -> RepositoryManager {
    use std::os::unix::fs::PermissionsExt;

    let wrapper = dir.join("git-scripted");
    std::fs::write(&wrapper, format!("#!/bin/sh\n{prelude}\nexec git \"$@\"\n")).unwrap();
    std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();
    let git = GitRunner::new(wrapper, Duration::from_secs(120));
    RepositoryManager::new(git, tether_core::GitConfig::default())
}

/// A manager whose git calls are logged (one subcommand per line) to `log`.
#[cfg(unix)]
pub fn logging_manager(dir: &Path, log: &Path) -> RepositoryManager {
    scripted_manager(dir, &format!("echo \"$1\" >> '{}'", log.display()))
}

/// In-memory channel recording every acknowledged batch.
pub struct RecordingChannel {
    available: watch::Sender<bool>,
    batches: Mutex<Vec<Vec<FileUpload>>>,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl RecordingChannel {
    pub fn new(available: bool) -> Self {
        let (tx, _) = watch::channel(available);
        Self {
            available: tx,
            batches: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.send_replace(available);
    }

    /// Reject the next `n` uploads.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Hold every upload until [`release`](Self::release) lets it through.
    pub fn hold(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` held uploads through.
    pub fn release(&self, n: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(n);
        }
    }

    /// Most uploads ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<FileUpload>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<FileUpload> {
        self.batches().into_iter().flatten().collect()
    }

    /// Uploads touching `path`.
    pub fn uploads_for(&self, path: &str) -> Vec<FileUpload> {
        self.uploads()
            .into_iter()
            .filter(|u| u.destination_path == path)
            .collect()
    }

    pub fn clear(&self) {
        self.batches.lock().unwrap().clear();
    }
}

#[async_trait]
impl RemoteChannel for RecordingChannel {
    fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    async fn upload_files(&self, batch: Vec<FileUpload>) -> Result<(), ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        let result = self.accept(batch);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn availability(&self) -> watch::Receiver<bool> {
        self.available.subscribe()
    }
}

impl RecordingChannel {
    fn accept(&self, batch: Vec<FileUpload>) -> Result<(), ChannelError> {
        if !self.is_available() {
            return Err(ChannelError::Unavailable);
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChannelError::Rejected("injected failure".into()));
        }
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

pub fn decoded(upload: &FileUpload) -> Vec<u8> {
    assert_eq!(upload.action, FileAction::Write);
    STANDARD
        .decode(upload.content_base64.as_deref().unwrap())
        .unwrap()
}

/// Poll `check` every 25ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}
