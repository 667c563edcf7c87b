//! Tether Daemon
//!
//! Prepares local git worktrees for remote runs and mirrors a workspace
//! into a remote channel.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use tether_core::config::{load_config, load_config_file};
use tether_daemon::OrchestrationContext;
use tether_daemon::sync::DirectoryChannel;
use tether_daemon::worktree::RunSpec;

#[derive(Parser, Debug)]
#[command(name = "tether-daemon")]
#[command(version, about = "Tether daemon - worktree orchestration and workspace sync")]
struct Args {
    /// Log level filter (e.g. "info", "debug", "warn"). Overrides settings.
    #[arg(long, global = true, env = "TETHER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "TETHER_LOG_JSON")]
    log_json: bool,

    /// Settings file to use instead of the global + project hierarchy.
    #[arg(long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clone or refresh an origin repository and check out a branch.
    EnsureRepo {
        /// Repository URL to clone from
        url: String,
        /// Local origin directory
        origin: PathBuf,
        /// Branch to check out (default: detected)
        #[arg(long)]
        branch: Option<String>,
        /// Remote URL to fetch from when it differs from the clone URL
        #[arg(long)]
        remote_url: Option<String>,
    },
    /// Create (or adopt) a worktree for a branch.
    Worktree {
        origin: PathBuf,
        path: PathBuf,
        branch: String,
        /// Base branch for a new branch (default: detected)
        #[arg(long)]
        base: Option<String>,
    },
    /// Ensure the worktree for a run exists and is positioned.
    Run {
        run_id: String,
        #[arg(long)]
        origin: PathBuf,
        /// Directory holding run worktrees (default: settings, then ~/.tether/worktrees)
        #[arg(long, env = "TETHER_WORKTREE_DIR")]
        worktree_root: Option<PathBuf>,
        #[arg(long)]
        branch: String,
        #[arg(long)]
        base: Option<String>,
    },
    /// Mirror a workspace into a directory until interrupted.
    Sync {
        local: PathBuf,
        remote_dir: PathBuf,
        #[arg(long)]
        run_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config_file(path)?,
        None => load_config(std::env::current_dir().ok().as_deref())?,
    };
    if let Some(level) = &args.log_level {
        config.daemon.log_level.clone_from(level);
    }

    let level = &config.daemon.log_level;
    let log_filter = format!("tether_daemon={level},tether_core={level}");
    tether_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tether-daemon");

    let ctx = OrchestrationContext::new(config);
    let result = run_command(&ctx, args.command).await;
    ctx.shutdown().await;
    result
}

#[allow(clippy::print_stdout)]
async fn run_command(ctx: &OrchestrationContext, command: Command) -> anyhow::Result<()> {
    match command {
        Command::EnsureRepo {
            url,
            origin,
            branch,
            remote_url,
        } => {
            let branch = ctx
                .repos
                .ensure_repository(&url, &origin, branch.as_deref(), remote_url.as_deref())
                .await?;
            println!("{branch}");
        }
        Command::Worktree {
            origin,
            path,
            branch,
            base,
        } => {
            let base = match base {
                Some(base) => base,
                None => ctx.repos.detect_default_branch(&origin).await,
            };
            let path = ctx
                .repos
                .create_worktree(&origin, &path, &branch, &base)
                .await?;
            println!("{}", path.display());
        }
        Command::Run {
            run_id,
            origin,
            worktree_root,
            branch,
            base,
        } => {
            let root = worktree_root.unwrap_or_else(|| ctx.worktree_dir());
            let ensured = ctx
                .worktrees
                .ensure(RunSpec {
                    worktree_path: root.join(&run_id),
                    run_id,
                    origin_path: origin,
                    branch,
                    base_branch: base,
                })
                .await?;
            info!(
                path = %ensured.path.display(),
                created = ensured.created,
                reset_to_remote = ensured.reset_to_remote,
                "Run worktree ready"
            );
            println!("{}", ensured.path.display());
        }
        Command::Sync {
            local,
            remote_dir,
            run_id,
        } => {
            let channel = DirectoryChannel::open(&remote_dir)
                .await
                .with_context(|| format!("Failed to open {}", remote_dir.display()))?;
            let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let session = ctx
                .sync
                .start_sync(&local, Some(run_id.clone()), Arc::new(channel))
                .await?;
            info!(run_id = %run_id, local = %session.root().display(), remote = %remote_dir.display(), "Syncing until interrupted");

            wait_for_shutdown().await?;

            let status = session.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }
    Ok(())
}
