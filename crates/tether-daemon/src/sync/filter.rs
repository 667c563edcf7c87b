//! Workspace ignore matcher: the root `.gitignore` plus a fixed default set.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, warn};

/// Patterns always excluded from sync, in gitignore syntax.
pub const DEFAULT_IGNORES: &[&str] = &[
    ".git/",
    ".hg/",
    ".svn/",
    "node_modules/",
    "bower_components/",
    ".venv/",
    "venv/",
    "__pycache__/",
    "target/",
    "dist/",
    "build/",
    "out/",
    ".next/",
    ".cache/",
    ".idea/",
    ".vscode/",
    "*.log",
    ".DS_Store",
];

/// Decides whether a workspace-relative path takes part in sync.
#[derive(Debug)]
pub struct SyncIgnore {
    matcher: Gitignore,
}

impl SyncIgnore {
    /// Build the matcher for `root`. An unreadable or malformed `.gitignore`
    /// is logged and skipped; the defaults always apply.
    pub fn new(root: &Path, extra: &[String]) -> Self {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in DEFAULT_IGNORES {
            if let Err(e) = builder.add_line(None, pattern) {
                warn!(pattern, error = %e, "Invalid default ignore pattern");
            }
        }
        for pattern in extra {
            if let Err(e) = builder.add_line(None, pattern) {
                warn!(pattern = %pattern, error = %e, "Invalid extra ignore pattern");
            }
        }

        let gitignore = root.join(".gitignore");
        if gitignore.is_file() {
            if let Some(e) = builder.add(&gitignore) {
                warn!(path = %gitignore.display(), error = %e, "Partially parsed .gitignore");
            } else {
                debug!(path = %gitignore.display(), "loaded workspace ignore file");
            }
        }

        let matcher = builder.build().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to build ignore matcher, ignoring nothing");
            Gitignore::empty()
        });
        Self { matcher }
    }

    /// Whether `relative` (forward-slash, relative to the root) or any of
    /// its parent directories is ignored.
    pub fn is_ignored(&self, relative: &str, is_dir: bool) -> bool {
        if relative.is_empty() {
            return false;
        }
        self.matcher
            .matched_path_or_any_parents(Path::new(relative), is_dir)
            .is_ignore()
    }
}
