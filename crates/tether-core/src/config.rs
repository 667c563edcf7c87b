//! Configuration resolution for Tether.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/tether/settings.json)
//! 3. Project config (.tether/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete Tether configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Daemon-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub log_level: String,
    /// Base directory for run worktrees. `None` means `~/.tether/worktrees`.
    pub worktree_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            worktree_dir: None,
        }
    }
}

/// How `git pull` reconciles the local branch with the fetched one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PullStrategy {
    Rebase,
    Merge,
    /// Divergence (e.g. a force-pushed remote) fails loudly and triggers
    /// the hard-reset recovery path.
    #[default]
    FastForwardOnly,
}

impl PullStrategy {
    /// The `git pull` flag selecting this strategy.
    pub const fn flag(self) -> &'static str {
        match self {
            Self::Rebase => "--rebase",
            Self::Merge => "--no-rebase",
            Self::FastForwardOnly => "--ff-only",
        }
    }
}

/// Repository orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub pull_strategy: PullStrategy,
    /// Shallow clone/fetch depth. `None` fetches full history.
    pub fetch_depth: Option<u32>,
    /// How long an in-flight clone/fetch stays joinable by new callers.
    pub operation_cache_ttl_ms: u64,
    /// Hard ceiling for any single git invocation.
    pub command_timeout_secs: u64,
    /// Branches the installed hooks refuse to force-push or delete.
    pub protected_branches: Vec<String>,
    /// Explicit git executable; overrides the candidate search.
    pub git_executable: Option<PathBuf>,
    /// Minimum spacing between two history prewarm runs on one repository.
    pub prewarm_interval_secs: u64,
    /// A `shallow.lock` older than this is considered abandoned.
    pub stale_lock_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            pull_strategy: PullStrategy::default(),
            fetch_depth: Some(50),
            operation_cache_ttl_ms: 5_000,
            command_timeout_secs: 300,
            protected_branches: vec!["main".to_string(), "master".to_string()],
            git_executable: None,
            prewarm_interval_secs: 60 * 60,
            stale_lock_secs: 30,
        }
    }
}

impl GitConfig {
    pub const fn operation_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.operation_cache_ttl_ms)
    }

    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub const fn prewarm_interval(&self) -> Duration {
        Duration::from_secs(self.prewarm_interval_secs)
    }

    pub const fn stale_lock_age(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }
}

/// File synchronisation tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after a local change before a flush fires.
    pub debounce_ms: u64,
    /// Delay before the flush that follows a full/manual sync.
    pub full_sync_delay_ms: u64,
    /// How long a remote-origin write is immune to re-upload.
    pub echo_suppression_ms: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// Failed retries tolerated before the session goes lazy.
    pub retry_max_attempts: u32,
    /// Flush delay after the channel becomes reachable again.
    pub reconnect_flush_ms: u64,
    /// Flush delay after the channel drops.
    pub disconnect_flush_ms: u64,
    pub max_batch_files: usize,
    pub max_batch_bytes: usize,
    /// Files larger than this are skipped, never chunked.
    pub max_file_bytes: u64,
    pub upload_timeout_secs: u64,
    pub max_watch_depth: usize,
    /// A path must be quiet this long before its watcher event is recorded.
    pub write_stability_ms: u64,
    /// Additional gitignore-syntax patterns appended to the default set.
    pub extra_ignores: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            full_sync_delay_ms: 0,
            echo_suppression_ms: 3_000,
            retry_initial_ms: 2_000,
            retry_max_ms: 30_000,
            retry_max_attempts: 5,
            reconnect_flush_ms: 250,
            disconnect_flush_ms: 2_000,
            max_batch_files: 200,
            max_batch_bytes: 6 * 1024 * 1024, // 6 MiB
            max_file_bytes: 50 * 1024 * 1024, // 50 MiB
            upload_timeout_secs: 60,
            max_watch_depth: 64,
            write_stability_ms: 100,
            extra_ignores: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub const fn full_sync_delay(&self) -> Duration {
        Duration::from_millis(self.full_sync_delay_ms)
    }

    pub const fn echo_suppression(&self) -> Duration {
        Duration::from_millis(self.echo_suppression_ms)
    }

    pub const fn reconnect_flush(&self) -> Duration {
        Duration::from_millis(self.reconnect_flush_ms)
    }

    pub const fn disconnect_flush(&self) -> Duration {
        Duration::from_millis(self.disconnect_flush_ms)
    }

    pub const fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub const fn write_stability(&self) -> Duration {
        Duration::from_millis(self.write_stability_ms)
    }
}

/// Load configuration with hierarchical resolution.
///
/// Files are deep-merged key by key, so a project file only needs the
/// settings it changes.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::Value::Object(serde_json::Map::new());

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_json(&mut merged, read_json(&global_path)?);
        }
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".tether").join("settings.json");
        if project_path.exists() {
            merge_json(&mut merged, read_json(&project_path)?);
        }
    }

    let mut config: Config = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);

    Ok(config)
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_json(base.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Load a single settings file, e.g. one passed with `--config`.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let mut config: Config = serde_json::from_value(read_json(path)?)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".tether").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/tether/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("tether").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("TETHER_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(val) = lookup("TETHER_GIT_PATH") {
        config.git.git_executable = Some(PathBuf::from(val));
    }
    if let Some(n) = lookup("TETHER_SYNC_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
        config.sync.debounce_ms = n;
    }
    if let Some(n) = lookup("TETHER_MAX_BATCH_FILES").and_then(|v| v.parse().ok()) {
        config.sync.max_batch_files = n;
    }
    if let Some(val) = lookup("TETHER_PROTECTED_BRANCHES") {
        config.git.protected_branches = val
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect();
    }
}
