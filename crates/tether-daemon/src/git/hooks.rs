//! Protected-branch hooks.
//!
//! `pre-push` refuses force-pushes and deletions of protected branches;
//! `pre-commit` refuses direct commits on them unless
//! `TETHER_ALLOW_PROTECTED_COMMIT=1`. Hooks we did not write are never
//! overwritten.

use std::path::Path;

use tracing::{debug, warn};

use super::error::GitError;
use super::layout;

/// First line after the shebang of every hook we manage.
const MANAGED_MARKER: &str = "# managed-by: tether";

fn protected_list(protected: &[String]) -> String {
    protected
        .iter()
        .filter(|b| !b.is_empty() && b.chars().all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')))
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render the `pre-push` hook script.
pub fn pre_push_script(protected: &[String]) -> String {
    format!(
        r#"#!/bin/sh
{MANAGED_MARKER}
protected="{list}"
zero=0000000000000000000000000000000000000000
while read -r local_ref local_sha remote_ref remote_sha; do
  branch="${{remote_ref#refs/heads/}}"
  for p in $protected; do
    [ "$branch" = "$p" ] || continue
    case "$local_sha" in
      *[!0]*) ;;
      *) echo "tether: refusing to delete protected branch '$p'" >&2; exit 1 ;;
    esac
    case "$remote_sha" in
      *[!0]*)
        if ! git merge-base --is-ancestor "$remote_sha" "$local_sha" 2>/dev/null; then
          echo "tether: refusing to force-push protected branch '$p'" >&2
          exit 1
        fi ;;
    esac
  done
done
exit 0
"#,
        list = protected_list(protected)
    )
}

/// Render the `pre-commit` hook script.
pub fn pre_commit_script(protected: &[String]) -> String {
    format!(
        r#"#!/bin/sh
{MANAGED_MARKER}
[ "$TETHER_ALLOW_PROTECTED_COMMIT" = "1" ] && exit 0
protected="{list}"
branch="$(git symbolic-ref --short HEAD 2>/dev/null)" || exit 0
for p in $protected; do
  if [ "$branch" = "$p" ]; then
    echo "tether: direct commits to protected branch '$p' are not allowed" >&2
    exit 1
  fi
done
exit 0
"#,
        list = protected_list(protected)
    )
}

/// Install (or refresh) both hooks for the repository or worktree at `work_tree`.
/// Idempotent.
pub fn install_hooks(work_tree: &Path, protected: &[String]) -> Result<(), GitError> {
    let hooks = layout::hooks_dir(work_tree)
        .ok_or_else(|| GitError::NotARepository(work_tree.display().to_string()))?;
    std::fs::create_dir_all(&hooks)?;

    for (name, script) in [
        ("pre-push", pre_push_script(protected)),
        ("pre-commit", pre_commit_script(protected)),
    ] {
        let path = hooks.join(name);
        match std::fs::read_to_string(&path) {
            Ok(existing) if existing == script => continue,
            Ok(existing) if !existing.contains(MANAGED_MARKER) => {
                warn!(hook = %path.display(), "Existing hook not managed by tether, leaving it in place");
                continue;
            }
            _ => {}
        }
        std::fs::write(&path, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
        debug!(hook = %path.display(), "Installed hook");
    }
    Ok(())
}
