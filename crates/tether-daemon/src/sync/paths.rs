//! Workspace-relative path handling.

use std::path::{Component, Path, PathBuf};

/// Forward-slash path of `path` relative to `root`, or `None` when `path`
/// is the root itself or lies outside it.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Whether the forward-slash path `relative` is `dir` or lies beneath it.
pub fn is_within(relative: &str, dir: &str) -> bool {
    relative
        .strip_prefix(dir)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Resolve a remote-supplied relative path under `root`.
///
/// Rejects absolute paths, `..` escapes, symlinks along the way (dangling
/// ones included) whose target leaves the root, and destinations whose
/// nearest existing ancestor resolves outside the root.
pub fn resolve_destination(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = relative.replace('\\', "/");
    let resolved = normalize(Path::new(&relative))?;
    if resolved.as_os_str().is_empty() {
        return None;
    }

    let canonical_root = root.canonicalize().ok()?;
    let dest = root.join(&resolved);
    let mut current = root.to_path_buf();
    for part in resolved.components() {
        current.push(part);
        let Ok(meta) = std::fs::symlink_metadata(&current) else {
            // Nothing below a missing component exists yet.
            break;
        };
        if meta.file_type().is_symlink() && !link_stays_inside(&current, &canonical_root) {
            return None;
        }
    }

    let mut ancestor = dest.as_path();
    loop {
        if let Ok(real) = ancestor.canonicalize() {
            return real.starts_with(&canonical_root).then_some(dest);
        }
        ancestor = ancestor.parent()?;
    }
}

/// Lexically resolve `.` and `..`. `None` for absolute paths or `..`
/// climbing above the start.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Whether the symlink at `link` points somewhere under `canonical_root`,
/// judged from its target even when that target does not exist.
fn link_stays_inside(link: &Path, canonical_root: &Path) -> bool {
    let Ok(target) = std::fs::read_link(link) else {
        return false;
    };
    let Some(parent) = link.parent() else {
        return false;
    };
    // A `..` in the target is resolved against the real (not lexical)
    // parent, so only accept targets that climb nowhere.
    if target
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return link
            .canonicalize()
            .is_ok_and(|real| real.starts_with(canonical_root));
    }
    let absolute = if target.is_absolute() {
        target
    } else {
        parent.join(target)
    };
    let mut ancestor = absolute.as_path();
    loop {
        if let Ok(real) = ancestor.canonicalize() {
            return real.starts_with(canonical_root);
        }
        match ancestor.parent() {
            Some(up) => ancestor = up,
            None => return false,
        }
    }
}
