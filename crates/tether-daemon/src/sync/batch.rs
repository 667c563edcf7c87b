//! Pending changes and upload batching.

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use indexmap::IndexMap;

use super::channel::{FileAction, FileUpload};
use super::paths::is_within;

/// Change-detection hash of file content. Not an integrity boundary.
pub type ContentHash = blake3::Hash;

pub fn content_hash(bytes: &[u8]) -> ContentHash {
    blake3::hash(bytes)
}

/// One pending change; at most one per relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub action: FileAction,
    pub absolute_path: PathBuf,
    pub relative_path: String,
}

/// Insertion-ordered, last-write-wins set of pending changes.
#[derive(Debug, Default)]
pub struct PendingChanges {
    entries: IndexMap<String, PendingChange>,
}

impl PendingChanges {
    /// Record `change`, replacing whatever was pending for its path.
    pub fn upsert(&mut self, change: PendingChange) {
        self.entries.insert(change.relative_path.clone(), change);
    }

    pub fn remove(&mut self, relative: &str) -> Option<PendingChange> {
        self.entries.shift_remove(relative)
    }

    /// Remove every entry at or beneath the directory `dir`.
    pub fn remove_within(&mut self, dir: &str) -> Vec<PendingChange> {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|path| is_within(path, dir))
            .cloned()
            .collect();
        keys.iter()
            .filter_map(|key| self.entries.shift_remove(key))
            .collect()
    }

    pub fn get(&self, relative: &str) -> Option<&PendingChange> {
        self.entries.get(relative)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drain everything into a snapshot; the set keeps accumulating afresh.
    pub fn take(&mut self) -> Vec<PendingChange> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Put a failed snapshot back without clobbering anything recorded
    /// since it was taken.
    pub fn restore(&mut self, snapshot: Vec<PendingChange>) {
        for change in snapshot {
            self.entries
                .entry(change.relative_path.clone())
                .or_insert(change);
        }
    }
}

/// A batch entry plus the bookkeeping applied once it is acknowledged.
#[derive(Debug, Clone)]
pub struct PreparedUpload {
    pub upload: FileUpload,
    pub relative_path: String,
    /// Hash of the uploaded content; `None` for deletes.
    pub hash: Option<ContentHash>,
}

impl PreparedUpload {
    pub fn write(relative_path: String, content: &[u8], mode: Option<u32>) -> Self {
        Self {
            upload: FileUpload {
                destination_path: relative_path.clone(),
                action: FileAction::Write,
                content_base64: Some(STANDARD.encode(content)),
                mode,
            },
            hash: Some(content_hash(content)),
            relative_path,
        }
    }

    pub fn delete(relative_path: String) -> Self {
        Self {
            upload: FileUpload::delete(relative_path.clone()),
            hash: None,
            relative_path,
        }
    }
}

/// Groups prepared uploads into batches bounded by file count and bytes.
///
/// A single entry larger than the byte bound travels alone.
#[derive(Debug)]
pub struct BatchBuilder {
    max_files: usize,
    max_bytes: usize,
    current: Vec<PreparedUpload>,
    current_bytes: usize,
}

impl BatchBuilder {
    pub fn new(max_files: usize, max_bytes: usize) -> Self {
        Self {
            max_files: max_files.max(1),
            max_bytes,
            current: Vec::new(),
            current_bytes: 0,
        }
    }

    /// Add an entry; returns the completed batch when adding it would
    /// have exceeded either bound.
    pub fn push(&mut self, item: PreparedUpload) -> Option<Vec<PreparedUpload>> {
        let size = item.upload.wire_size();
        let full = !self.current.is_empty()
            && (self.current.len() + 1 > self.max_files
                || self.current_bytes + size > self.max_bytes);
        let completed = full.then(|| self.take_current());
        self.current_bytes += size;
        self.current.push(item);
        completed
    }

    /// The trailing, partially filled batch.
    pub fn finish(mut self) -> Option<Vec<PreparedUpload>> {
        (!self.current.is_empty()).then(|| self.take_current())
    }

    fn take_current(&mut self) -> Vec<PreparedUpload> {
        self.current_bytes = 0;
        std::mem::take(&mut self.current)
    }
}
