//! Echo-loop guards.
//!
//! Two independent guards keep a change received from the remote from being
//! sent straight back: a timing window over recently written paths, and the
//! last content hash seen on the wire for every path.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::batch::ContentHash;
use super::paths::is_within;

/// Guard state of one path, taken before a remote apply so a failed apply
/// can be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathGuards {
    recent: Option<Instant>,
    recent_tree: Option<Instant>,
    hash: Option<ContentHash>,
}

#[derive(Debug)]
pub struct EchoGuard {
    window: Duration,
    recent_remote: HashMap<String, Instant>,
    /// Directories removed by the remote; covers every path beneath them.
    recent_trees: HashMap<String, Instant>,
    last_synced: HashMap<String, ContentHash>,
}

impl EchoGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent_remote: HashMap::new(),
            recent_trees: HashMap::new(),
            last_synced: HashMap::new(),
        }
    }

    pub fn snapshot(&self, relative: &str) -> PathGuards {
        PathGuards {
            recent: self.recent_remote.get(relative).copied(),
            recent_tree: self.recent_trees.get(relative).copied(),
            hash: self.last_synced.get(relative).copied(),
        }
    }

    /// Put back what [`snapshot`](Self::snapshot) saw for `relative`.
    pub fn restore(&mut self, relative: &str, guards: PathGuards) {
        fn put<V>(map: &mut HashMap<String, V>, key: &str, value: Option<V>) {
            match value {
                Some(value) => {
                    map.insert(key.to_string(), value);
                }
                None => {
                    map.remove(key);
                }
            }
        }
        put(&mut self.recent_remote, relative, guards.recent);
        put(&mut self.recent_trees, relative, guards.recent_tree);
        put(&mut self.last_synced, relative, guards.hash);
    }

    /// Must be called before the remote content hits the disk.
    pub fn mark_remote_write(&mut self, relative: &str, hash: ContentHash) {
        self.recent_remote
            .insert(relative.to_string(), Instant::now() + self.window);
        self.last_synced.insert(relative.to_string(), hash);
    }

    pub fn mark_remote_delete(&mut self, relative: &str) {
        self.recent_remote
            .insert(relative.to_string(), Instant::now() + self.window);
        self.last_synced.remove(relative);
    }

    /// Directory variant of [`mark_remote_delete`](Self::mark_remote_delete):
    /// the window and the hash reset apply to everything beneath `relative`.
    pub fn mark_remote_delete_tree(&mut self, relative: &str) {
        self.recent_trees
            .insert(relative.to_string(), Instant::now() + self.window);
        self.last_synced.retain(|path, _| !is_within(path, relative));
    }

    /// Whether `relative` is inside its post-remote-write window.
    pub fn is_recent_remote(&mut self, relative: &str) -> bool {
        let now = Instant::now();
        self.recent_remote.retain(|_, expires| *expires > now);
        self.recent_trees.retain(|_, expires| *expires > now);
        self.recent_remote.contains_key(relative)
            || self
                .recent_trees
                .keys()
                .any(|dir| is_within(relative, dir))
    }

    /// Whether `hash` is what was last observed on the wire for `relative`.
    pub fn is_unchanged(&self, relative: &str, hash: &ContentHash) -> bool {
        self.last_synced.get(relative) == Some(hash)
    }

    /// Record an acknowledged upload.
    pub fn record_upload(&mut self, relative: &str, hash: Option<ContentHash>) {
        match hash {
            Some(hash) => {
                self.last_synced.insert(relative.to_string(), hash);
            }
            None => {
                self.last_synced.remove(relative);
            }
        }
    }

    /// Forget every tracked hash.
    pub fn clear_hashes(&mut self) {
        self.last_synced.clear();
    }

    pub fn clear(&mut self) {
        self.recent_remote.clear();
        self.recent_trees.clear();
        self.last_synced.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::batch::content_hash;

    #[tokio::test(start_paused = true)]
    async fn remote_write_window_expires() {
        let mut guard = EchoGuard::new(Duration::from_secs(3));
        guard.mark_remote_write("x.txt", content_hash(b"remote"));

        assert!(guard.is_recent_remote("x.txt"));
        assert!(!guard.is_recent_remote("y.txt"));

        tokio::time::advance(Duration::from_millis(2_900)).await;
        assert!(guard.is_recent_remote("x.txt"));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!guard.is_recent_remote("x.txt"));
        // The content guard outlives the window.
        assert!(guard.is_unchanged("x.txt", &content_hash(b"remote")));
    }

    #[test]
    fn deletes_clear_hash_tracking() {
        let mut guard = EchoGuard::new(Duration::from_secs(3));
        let hash = content_hash(b"v1");

        guard.record_upload("a.txt", Some(hash));
        assert!(guard.is_unchanged("a.txt", &hash));
        guard.record_upload("a.txt", None);
        assert!(!guard.is_unchanged("a.txt", &hash));

        guard.mark_remote_write("b.txt", hash);
        guard.mark_remote_delete("b.txt");
        assert!(!guard.is_unchanged("b.txt", &hash));
    }

    #[tokio::test(start_paused = true)]
    async fn tree_delete_covers_children() {
        let mut guard = EchoGuard::new(Duration::from_secs(3));
        guard.record_upload("dir/a.txt", Some(content_hash(b"a")));
        guard.record_upload("dirt.txt", Some(content_hash(b"d")));
        guard.mark_remote_delete_tree("dir");

        assert!(guard.is_recent_remote("dir"));
        assert!(guard.is_recent_remote("dir/sub/b.txt"));
        assert!(!guard.is_recent_remote("dirt.txt"));
        assert!(!guard.is_unchanged("dir/a.txt", &content_hash(b"a")));
        assert!(guard.is_unchanged("dirt.txt", &content_hash(b"d")));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!guard.is_recent_remote("dir/sub/b.txt"));
    }

    #[tokio::test(start_paused = true)]
    async fn restore_undoes_a_remote_mark() {
        let mut guard = EchoGuard::new(Duration::from_secs(3));
        let local = content_hash(b"local");
        guard.record_upload("a.txt", Some(local));

        let saved = guard.snapshot("a.txt");
        guard.mark_remote_write("a.txt", content_hash(b"remote"));
        assert!(guard.is_recent_remote("a.txt"));

        guard.restore("a.txt", saved);
        assert!(!guard.is_recent_remote("a.txt"));
        assert!(guard.is_unchanged("a.txt", &local));
    }
}
