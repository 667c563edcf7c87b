//! Git process invocation.
//!
//! [`GitRunner`] resolves one absolute git executable, runs commands with a
//! timeout, redacts credentials before anything reaches a log or an error,
//! and funnels repository mutations through a single FIFO queue: git cannot
//! safely run concurrent mutations against one `.git` directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::{GitError, GitFailureKind};

/// Environment variable that overrides the git executable search.
pub const GIT_PATH_ENV: &str = "TETHER_GIT_PATH";

/// Well-known install locations probed before falling back to `PATH`.
const COMMON_GIT_PATHS: &[&str] = &[
    "/usr/bin/git",
    "/usr/local/bin/git",
    "/opt/homebrew/bin/git",
    "/bin/git",
    "C:\\Program Files\\Git\\cmd\\git.exe",
];

static CREDENTIALS_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // literal pattern
    Regex::new(r"([A-Za-z][A-Za-z0-9+.\-]*://)[^/@\s:]+(?::[^/@\s]*)?@").unwrap()
});

/// Replace `scheme://user:pass@` with `scheme://***:***@`.
pub fn redact_credentials(text: &str) -> String {
    CREDENTIALS_RE.replace_all(text, "${1}***:***@").into_owned()
}

/// Resolve the git executable: explicit override, `TETHER_GIT_PATH`,
/// common install paths, then `PATH`. Falls back to a bare `git`.
pub fn resolve_git_executable(explicit: Option<&Path>) -> PathBuf {
    let env_override = std::env::var_os(GIT_PATH_ENV).map(PathBuf::from);
    let candidates = explicit
        .map(Path::to_path_buf)
        .into_iter()
        .chain(env_override)
        .chain(COMMON_GIT_PATHS.iter().map(PathBuf::from));

    for candidate in candidates {
        if candidate.is_file() {
            return candidate;
        }
    }

    which::which("git").unwrap_or_else(|_| {
        warn!("git executable not found in common paths or PATH; using bare 'git'");
        PathBuf::from("git")
    })
}

/// Captured output of a successful git invocation.
#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Trimmed stdout.
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }
}

/// Shared handle for running git. Clones share the mutation queue.
#[derive(Clone)]
pub struct GitRunner {
    executable: PathBuf,
    timeout: Duration,
    queue: Arc<Mutex<()>>,
}

impl GitRunner {
    pub fn new(executable: PathBuf, timeout: Duration) -> Self {
        Self {
            executable,
            timeout,
            queue: Arc::new(Mutex::new(())),
        }
    }

    /// Build a runner by searching for git (see [`resolve_git_executable`]).
    pub fn discover(explicit: Option<&Path>, timeout: Duration) -> Self {
        Self::new(resolve_git_executable(explicit), timeout)
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Run a read-only (or self-contained) git command in `cwd`.
    pub async fn run<S: AsRef<str>>(&self, cwd: &Path, args: &[S]) -> Result<GitOutput, GitError> {
        self.exec(cwd, args).await
    }

    /// Run a command that mutates shared repository state, queued behind every
    /// other mutation issued through this runner (FIFO).
    pub async fn run_mutating<S: AsRef<str>>(
        &self,
        cwd: &Path,
        args: &[S],
    ) -> Result<GitOutput, GitError> {
        let _turn = self.queue.lock().await;
        self.exec(cwd, args).await
    }

    /// Run and report only whether git exited zero. Spawn failures count as false.
    pub async fn succeeds<S: AsRef<str>>(&self, cwd: &Path, args: &[S]) -> bool {
        self.exec(cwd, args).await.is_ok()
    }

    async fn exec<S: AsRef<str>>(&self, cwd: &Path, args: &[S]) -> Result<GitOutput, GitError> {
        let command_line = redact_credentials(
            &args.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(" "),
        );
        debug!(cwd = %cwd.display(), command = %command_line, "running git");

        let start = Instant::now();
        let mut cmd = Command::new(&self.executable);
        cmd.args(args.iter().map(AsRef::as_ref))
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(GitError::Spawn {
                    executable: self.executable.display().to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %command_line, timeout_secs = self.timeout.as_secs(), "git timed out");
                return Err(GitError::Timeout {
                    command: command_line,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let elapsed_ms = start.elapsed().as_millis();

        if output.status.success() {
            debug!(command = %command_line, elapsed_ms, "git completed");
            return Ok(GitOutput { stdout, stderr });
        }

        let stderr = redact_credentials(stderr.trim());
        let kind = GitFailureKind::classify(&stderr);
        debug!(
            command = %command_line,
            status = %output.status,
            elapsed_ms,
            ?kind,
            stderr = %stderr,
            "git failed"
        );
        Err(GitError::Command {
            command: command_line,
            stderr,
            kind,
        })
    }
}
