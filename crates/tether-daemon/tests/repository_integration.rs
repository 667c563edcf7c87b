#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Repository manager and worktree coordinator against real git
//! repositories in temporary directories.

mod common;

use std::path::Path;

use common::{Upstream, git, manager};
use tether_daemon::git::{GitError, RepositoryManager};
use tether_daemon::worktree::{RunSpec, WorktreeCoordinator};

async fn origin_clone(repos: &RepositoryManager, upstream: &Upstream, root: &Path) -> std::path::PathBuf {
    let origin = root.join("origin");
    let branch = repos
        .ensure_repository(&upstream.url(), &origin, None, None)
        .await
        .unwrap();
    assert_eq!(branch, "main");
    origin
}

#[tokio::test]
async fn ensure_repository_clones_then_refreshes() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let repos = manager();

    let origin = origin_clone(&repos, &upstream, tmp.path()).await;
    assert!(origin.join("README.md").exists());

    let head = upstream.commit("main", "NEWS.md", "news\n");
    let branch = repos
        .ensure_repository(&upstream.url(), &origin, Some("main"), None)
        .await
        .unwrap();
    assert_eq!(branch, "main");
    assert_eq!(git(&origin, &["rev-parse", "HEAD"]), head);
    assert!(origin.join("NEWS.md").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn concurrent_ensure_issues_one_clone() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let log = tmp.path().join("git.log");
    let repos = common::logging_manager(tmp.path(), &log);
    let origin = tmp.path().join("origin");

    let calls = (0..8).map(|_| {
        let repos = repos.clone();
        let url = upstream.url();
        let origin = origin.clone();
        async move { repos.ensure_repository(&url, &origin, Some("main"), None).await }
    });
    let results = futures::future::join_all(calls).await;
    for result in results {
        assert_eq!(result.unwrap(), "main");
    }

    let log = std::fs::read_to_string(&log).unwrap();
    let clones = log.lines().filter(|line| *line == "clone").count();
    assert_eq!(clones, 1, "git log:\n{log}");
}

#[tokio::test]
async fn force_pushed_branch_converges() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let repos = manager();

    upstream.commit("main", "app.txt", "v1\n");
    let origin = origin_clone(&repos, &upstream, tmp.path()).await;
    assert_eq!(std::fs::read_to_string(origin.join("app.txt")).unwrap(), "v1\n");

    let rewritten = upstream.rewrite("main", "app.txt", "v1-rewritten\n");
    repos
        .ensure_repository(&upstream.url(), &origin, Some("main"), None)
        .await
        .unwrap();

    assert_eq!(git(&origin, &["rev-parse", "HEAD"]), rewritten);
    assert_eq!(
        std::fs::read_to_string(origin.join("app.txt")).unwrap(),
        "v1-rewritten\n"
    );
}

#[tokio::test]
async fn new_branch_is_based_on_origin_base() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let repos = manager();
    let origin = origin_clone(&repos, &upstream, tmp.path()).await;

    let wt = tmp.path().join("wt");
    let actual = repos
        .create_worktree(&origin, &wt, "feature-x", "main")
        .await
        .unwrap();
    assert_eq!(actual, wt);

    assert_eq!(
        git(&origin, &["rev-parse", "feature-x"]),
        git(&origin, &["rev-parse", "origin/main"])
    );
    assert_eq!(git(&wt, &["symbolic-ref", "--short", "HEAD"]), "feature-x");
    assert_eq!(git(&wt, &["config", "branch.feature-x.remote"]), "origin");
    let hook = std::fs::read_to_string(origin.join(".git/hooks/pre-push")).unwrap();
    assert!(hook.contains("managed-by: tether"));
}

#[tokio::test]
async fn existing_remote_branch_is_tracked() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let repos = manager();
    let origin = origin_clone(&repos, &upstream, tmp.path()).await;
    let head = upstream.commit("feature-y", "y.txt", "y\n");

    let wt = tmp.path().join("wt-y");
    repos
        .create_worktree(&origin, &wt, "feature-y", "main")
        .await
        .unwrap();

    assert_eq!(git(&wt, &["rev-parse", "HEAD"]), head);
    assert!(wt.join("y.txt").exists());
}

#[tokio::test]
async fn missing_base_branch_is_named() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let repos = manager();
    let origin = origin_clone(&repos, &upstream, tmp.path()).await;

    let err = repos
        .create_worktree(&origin, &tmp.path().join("wt"), "feature-z", "does-not-exist")
        .await
        .unwrap_err();
    match &err {
        GitError::MissingBaseBranch { base, branch } => {
            assert_eq!(base, "does-not-exist");
            assert_eq!(branch, "feature-z");
        }
        other => panic!("Expected MissingBaseBranch, got: {other:?}"),
    }
    assert!(err.to_string().contains("does-not-exist"));
}

#[tokio::test]
async fn concurrent_create_worktree_yields_one_worktree() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let repos = manager();
    let origin = origin_clone(&repos, &upstream, tmp.path()).await;
    let wt = tmp.path().join("wt-shared");

    let calls = (0..4).map(|_| {
        let repos = repos.clone();
        let origin = origin.clone();
        let wt = wt.clone();
        async move { repos.create_worktree(&origin, &wt, "shared", "main").await }
    });
    for result in futures::future::join_all(calls).await {
        assert_eq!(result.unwrap().canonicalize().unwrap(), wt.canonicalize().unwrap());
    }

    let attached: Vec<_> = repos
        .list_worktrees(&origin)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.branch.as_deref() == Some("shared"))
        .collect();
    assert_eq!(attached.len(), 1);
}

#[tokio::test]
async fn branch_moves_to_newly_requested_path() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let repos = manager();
    let origin = origin_clone(&repos, &upstream, tmp.path()).await;

    let first = tmp.path().join("wt-a");
    let second = tmp.path().join("wt-b");
    repos.create_worktree(&origin, &first, "moving", "main").await.unwrap();
    repos.create_worktree(&origin, &second, "moving", "main").await.unwrap();

    let attached: Vec<_> = repos
        .list_worktrees(&origin)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.branch.as_deref() == Some("moving"))
        .collect();
    assert_eq!(attached.len(), 1);
    assert_eq!(
        attached[0].path.canonicalize().unwrap(),
        second.canonicalize().unwrap()
    );
    assert!(!first.exists());
}

#[tokio::test]
async fn coordinator_resets_only_clean_worktrees() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let repos = manager();
    let origin = origin_clone(&repos, &upstream, tmp.path()).await;
    let coordinator = WorktreeCoordinator::new(repos);

    let spec = RunSpec {
        run_id: "run-1".into(),
        origin_path: origin.clone(),
        worktree_path: tmp.path().join("runs").join("run-1"),
        branch: "run-1".into(),
        base_branch: None,
    };

    let first = coordinator.ensure(spec.clone()).await.unwrap();
    assert!(first.created);
    assert!(!first.reset_to_remote);
    assert_eq!(first.base_branch, "main");

    // Remote-authored commit on the run branch surfaces locally.
    let remote_head = upstream.commit("run-1", "remote.txt", "from remote\n");
    let second = coordinator.ensure(spec.clone()).await.unwrap();
    assert!(!second.created);
    assert!(second.reset_to_remote);
    assert_eq!(git(&second.path, &["rev-parse", "HEAD"]), remote_head);

    // A dirty tree is left alone.
    std::fs::write(second.path.join("local-edit.txt"), "mine\n").unwrap();
    upstream.commit("run-1", "remote2.txt", "again\n");
    let third = coordinator.ensure(spec).await.unwrap();
    assert!(!third.reset_to_remote);
    assert_eq!(git(&third.path, &["rev-parse", "HEAD"]), remote_head);
    assert!(third.path.join("local-edit.txt").exists());
    assert!(!third.path.join("remote2.txt").exists());
}

#[tokio::test]
async fn coordinator_shares_concurrent_ensures() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let repos = manager();
    let origin = origin_clone(&repos, &upstream, tmp.path()).await;
    let coordinator = WorktreeCoordinator::new(repos.clone());

    let spec = RunSpec {
        run_id: "run-2".into(),
        origin_path: origin.clone(),
        worktree_path: tmp.path().join("runs").join("run-2"),
        branch: "run-2".into(),
        base_branch: Some("main".into()),
    };
    let calls = (0..4).map(|_| coordinator.ensure(spec.clone()));
    let results = futures::future::join_all(calls).await;
    let paths: Vec<_> = results.into_iter().map(|r| r.unwrap().path).collect();
    assert!(paths.iter().all(|p| *p == paths[0]));

    let attached = repos
        .list_worktrees(&origin)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.branch.as_deref() == Some("run-2"))
        .count();
    assert_eq!(attached, 1);
}

#[tokio::test]
async fn corrupt_worktree_dir_is_recreated() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let repos = manager();
    let origin = origin_clone(&repos, &upstream, tmp.path()).await;
    let coordinator = WorktreeCoordinator::new(repos);

    let wt = tmp.path().join("runs").join("run-3");
    std::fs::create_dir_all(&wt).unwrap();
    std::fs::write(wt.join("garbage"), "not a repo").unwrap();

    let ensured = coordinator
        .ensure(RunSpec {
            run_id: "run-3".into(),
            origin_path: origin,
            worktree_path: wt.clone(),
            branch: "run-3".into(),
            base_branch: Some("main".into()),
        })
        .await
        .unwrap();
    assert!(ensured.created);
    assert!(!wt.join("garbage").exists());
    assert!(wt.join("README.md").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn unreadable_worktree_is_kept_not_recreated() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let repos = manager();
    let origin = origin_clone(&repos, &upstream, tmp.path()).await;
    let spec = RunSpec {
        run_id: "flaky-run".into(),
        origin_path: origin,
        worktree_path: tmp.path().join("runs").join("flaky-run"),
        branch: "flaky-run".into(),
        base_branch: Some("main".into()),
    };
    let ensured = WorktreeCoordinator::new(repos).ensure(spec.clone()).await.unwrap();
    std::fs::write(ensured.path.join("work.txt"), "unsaved\n").unwrap();

    // git refuses to look inside the worktree for a reason other than it
    // not being a repository.
    let refusing = common::scripted_manager(
        tmp.path(),
        r#"case "$(pwd -P)" in
*/runs/flaky-run*)
    if [ "$1" = rev-parse ]; then
        echo "fatal: detected dubious ownership in repository at '$(pwd -P)'" >&2
        exit 128
    fi;;
esac"#,
    );
    let result = WorktreeCoordinator::new(refusing).ensure(spec).await;
    assert!(result.is_err());
    assert!(ensured.path.join(".git").exists());
    assert!(ensured.path.join("work.txt").exists());
}

#[tokio::test]
async fn coordinator_survives_unreachable_remote() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let repos = manager();
    let origin = origin_clone(&repos, &upstream, tmp.path()).await;
    let coordinator = WorktreeCoordinator::new(repos);
    let spec = RunSpec {
        run_id: "run-4".into(),
        origin_path: origin.clone(),
        worktree_path: tmp.path().join("runs").join("run-4"),
        branch: "run-4".into(),
        base_branch: Some("main".into()),
    };
    let first = coordinator.ensure(spec.clone()).await.unwrap();
    assert!(first.created);

    let missing = tmp.path().join("gone.git");
    git(&origin, &["remote", "set-url", "origin", missing.to_str().unwrap()]);
    let again = coordinator.ensure(spec).await.unwrap();
    assert!(!again.created);
    assert!(!again.reset_to_remote);
    assert_eq!(again.path, first.path);
}

#[cfg(unix)]
#[tokio::test]
async fn fetch_retries_once_after_shallow_lock_contention() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let origin = origin_clone(&manager(), &upstream, tmp.path()).await;
    let head = upstream.commit("main", "NEWS.md", "news\n");

    // Behave like a concurrent git holding the lock: fail while it exists.
    let log = tmp.path().join("fetch.log");
    let repos = common::scripted_manager(
        tmp.path(),
        &format!(
            r#"if [ "$1" = fetch ]; then
    echo fetch >> '{}'
    if [ -e .git/shallow.lock ]; then
        echo "fatal: Unable to create '$(pwd)/.git/shallow.lock': File exists." >&2
        exit 128
    fi
fi"#,
            log.display()
        ),
    );
    let lock = origin.join(".git/shallow.lock");
    std::fs::write(&lock, "").unwrap();

    repos.fetch_branch(&upstream.url(), &origin, "main").await.unwrap();
    assert!(!lock.exists());
    let fetches = std::fs::read_to_string(&log).unwrap();
    assert_eq!(fetches.lines().count(), 2);
    assert_eq!(git(&origin, &["rev-parse", "origin/main"]), head);
}

#[cfg(unix)]
#[tokio::test]
async fn prewarm_unshallows_once_per_interval() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    upstream.commit("main", "a.txt", "a\n");
    upstream.commit("main", "b.txt", "b\n");
    let url = format!("file://{}", upstream.bare.display());
    git(tmp.path(), &["clone", "--depth", "1", &url, "origin"]);
    let origin = tmp.path().join("origin");
    assert!(origin.join(".git/shallow").exists());

    let log = tmp.path().join("git.log");
    let repos = common::logging_manager(tmp.path(), &log);
    repos.prewarm_history(&origin).await;
    assert!(!origin.join(".git/shallow").exists());
    assert_eq!(
        git(&origin, &["config", "remote.origin.partialclonefilter"]),
        "blob:none"
    );
    assert_eq!(git(&origin, &["rev-list", "--count", "HEAD"]), "3");
    assert!(std::fs::read_to_string(&log).unwrap().contains("fetch"));

    // Within the interval the marker short-circuits without touching git.
    std::fs::remove_file(&log).unwrap();
    repos.prewarm_history(&origin).await;
    assert!(!log.exists());
}
