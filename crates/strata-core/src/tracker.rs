//! Change tracker: merges raw file-system events into index work items.
//!
//! Event batches arrive twice per physical change. The pre-apply pass runs
//! while the old state is still visible and records which files need their
//! stored data invalidated; the post-apply pass walks the new state and
//! schedules re-extraction. Whatever the mix of raw events inside one
//! batch, a file ends up with at most one merged signal: either "needs
//! reindex" or "removed".
//!
//! Directory events expand recursively, but only through directories whose
//! children are already materialized. A directory whose children were
//! never examined is assumed to need no retroactive invalidation, since
//! nothing was indexed under it yet; this is an intentional precision/cost
//! trade-off, not an accident. Synthetic (mock) nodes are always expanded.

use crate::vfs::{ChangeEvent, ChangeKind, FileId, FileNode, FileProperty};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// The merged outcome of one or more event batches.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Files needing re-extraction against their new content
    pub modified: Vec<Arc<FileNode>>,

    /// Files whose stored data must be dropped
    pub removed: Vec<Arc<FileNode>>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Deduplicating merger of pre/post change notifications.
pub struct ChangeTracker {
    /// Directories whose contents never matter (storage root, log dirs)
    skip_prefixes: Vec<PathBuf>,

    scheduled: DashMap<FileId, Arc<FileNode>>,
    dropped: DashMap<FileId, Arc<FileNode>>,
}

impl ChangeTracker {
    pub fn new(skip_prefixes: Vec<PathBuf>) -> Self {
        ChangeTracker {
            skip_prefixes,
            scheduled: DashMap::new(),
            dropped: DashMap::new(),
        }
    }

    /// Pre-apply pass: the underlying mutation has not happened yet, so
    /// membership and descendants are resolved against the old state.
    pub fn before_events(&self, batch: &[ChangeEvent]) {
        for event in batch {
            if self.is_skipped(event.file.path()) {
                continue;
            }
            match &event.kind {
                ChangeKind::Deleted
                | ChangeKind::Moved { .. }
                | ChangeKind::PropertyChanged(FileProperty::Name) => {
                    self.expand(&event.file, &mut |file| self.mark_dropped(file));
                }
                ChangeKind::ContentChanged
                | ChangeKind::Created
                | ChangeKind::PropertyChanged(_) => {}
            }
        }
    }

    /// Post-apply pass: the mutation is visible; schedule re-extraction
    /// for everything that now exists.
    pub fn after_events(&self, batch: &[ChangeEvent]) {
        for event in batch {
            if self.is_skipped(event.file.path()) {
                continue;
            }
            match &event.kind {
                ChangeKind::Created | ChangeKind::ContentChanged | ChangeKind::Moved { .. } => {
                    self.expand(&event.file, &mut |file| self.schedule(file));
                }
                ChangeKind::PropertyChanged(FileProperty::Name)
                | ChangeKind::PropertyChanged(FileProperty::Encoding) => {
                    self.expand(&event.file, &mut |file| self.schedule(file));
                }
                ChangeKind::PropertyChanged(_) | ChangeKind::Deleted => {}
            }
        }
    }

    /// Direct request to reindex one file (the `requestReindex` entry
    /// point); bypasses event expansion.
    pub fn schedule_update(&self, file: Arc<FileNode>) {
        self.schedule(file);
    }

    /// Number of files with a pending signal.
    pub fn pending_count(&self) -> usize {
        self.scheduled.len() + self.dropped.len()
    }

    /// Take the merged change set, leaving the tracker empty.
    pub fn drain(&self) -> ChangeSet {
        let modified: Vec<_> = self
            .scheduled
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let removed: Vec<_> = self
            .dropped
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.scheduled.clear();
        self.dropped.clear();

        if !modified.is_empty() || !removed.is_empty() {
            debug!(
                modified = modified.len(),
                removed = removed.len(),
                "Drained change set"
            );
        }
        ChangeSet { modified, removed }
    }

    fn schedule(&self, file: Arc<FileNode>) {
        // A re-created or re-scheduled file supersedes a pending drop.
        self.dropped.remove(&file.id());
        trace!(file = %file, "Scheduled for reindex");
        self.scheduled.insert(file.id(), file);
    }

    fn mark_dropped(&self, file: Arc<FileNode>) {
        if self.scheduled.contains_key(&file.id()) {
            return;
        }
        trace!(file = %file, "Marked for invalidation");
        self.dropped.insert(file.id(), file);
    }

    /// Recursive expansion of a directory event. Traversal stops beneath
    /// any directory whose children were never materialized, unless the
    /// node is synthetic.
    fn expand(&self, node: &Arc<FileNode>, apply: &mut dyn FnMut(Arc<FileNode>)) {
        if !node.is_dir() {
            apply(node.clone());
            return;
        }
        if !node.children_loaded() && !node.is_mock() {
            return;
        }
        for child in node.children().unwrap_or_default() {
            if self.is_skipped(child.path()) {
                continue;
            }
            self.expand(&child, apply);
        }
    }

    fn is_skipped(&self, path: &Path) -> bool {
        self.skip_prefixes.iter().any(|p| path.starts_with(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::FileTree;

    fn tracker() -> ChangeTracker {
        ChangeTracker::new(vec![PathBuf::from("/p/.strata")])
    }

    #[test]
    fn test_duplicate_events_merge_to_one_signal() {
        let tree = FileTree::new();
        let tracker = tracker();
        let file = tree.file("/p/src/a.rs");

        tracker.after_events(&[
            ChangeEvent::content_changed(file.clone()),
            ChangeEvent::content_changed(file.clone()),
            ChangeEvent::created(file.clone()),
        ]);

        let set = tracker.drain();
        assert_eq!(set.modified.len(), 1);
        assert!(set.removed.is_empty());
    }

    #[test]
    fn test_unmaterialized_directory_produces_no_signals() {
        let tree = FileTree::new();
        let tracker = tracker();
        let dir = tree.dir("/p/src");
        // Children never loaded: nothing was indexed under it.

        tracker.after_events(&[ChangeEvent::content_changed(dir)]);
        assert!(tracker.drain().is_empty());
    }

    #[test]
    fn test_materialized_directory_expands_per_descendant() {
        let tree = FileTree::new();
        let tracker = tracker();

        let dir = tree.dir("/p/src");
        let sub = tree.dir("/p/src/sub");
        let a = tree.file("/p/src/a.rs");
        let b = tree.file("/p/src/sub/b.rs");
        sub.set_children(vec![b]);
        dir.set_children(vec![a, sub]);

        tracker.after_events(&[ChangeEvent::content_changed(dir)]);
        let set = tracker.drain();
        assert_eq!(set.modified.len(), 2);
    }

    #[test]
    fn test_mock_directory_is_always_expanded() {
        let tree = FileTree::new();
        let tracker = tracker();

        let dir = tree.mock_dir("/p/src");
        dir.set_children(vec![tree.file("/p/src/a.rs")]);

        // children_loaded is true here anyway; the mock flag matters for
        // nested synthetic dirs that were expanded without loading.
        let nested = tree.mock_dir("/p/src/nested");
        tracker.after_events(&[
            ChangeEvent::content_changed(dir),
            ChangeEvent::content_changed(nested),
        ]);
        assert_eq!(tracker.drain().modified.len(), 1);
    }

    #[test]
    fn test_only_name_and_encoding_properties_matter() {
        let tree = FileTree::new();
        let tracker = tracker();
        let file = tree.file("/p/src/a.rs");

        tracker.after_events(&[
            ChangeEvent::property_changed(file.clone(), FileProperty::Timestamp),
            ChangeEvent::property_changed(file.clone(), FileProperty::Permissions),
        ]);
        assert!(tracker.drain().is_empty());

        tracker.after_events(&[ChangeEvent::property_changed(
            file.clone(),
            FileProperty::Encoding,
        )]);
        assert_eq!(tracker.drain().modified.len(), 1);

        tracker.before_events(&[ChangeEvent::property_changed(file, FileProperty::Name)]);
        assert_eq!(tracker.drain().removed.len(), 1);
    }

    #[test]
    fn test_delete_then_recreate_yields_single_reindex() {
        let tree = FileTree::new();
        let tracker = tracker();
        let file = tree.file("/p/src/a.rs");

        tracker.before_events(&[ChangeEvent::deleted(file.clone())]);
        tracker.after_events(&[ChangeEvent::created(file.clone())]);

        let set = tracker.drain();
        assert_eq!(set.modified.len(), 1);
        assert!(set.removed.is_empty());
    }

    #[test]
    fn test_deleted_file_is_invalidated() {
        let tree = FileTree::new();
        let tracker = tracker();
        let file = tree.file("/p/src/a.rs");

        tracker.before_events(&[ChangeEvent::deleted(file)]);
        let set = tracker.drain();
        assert!(set.modified.is_empty());
        assert_eq!(set.removed.len(), 1);
    }

    #[test]
    fn test_storage_directory_is_skipped() {
        let tree = FileTree::new();
        let tracker = tracker();

        tracker.after_events(&[ChangeEvent::content_changed(
            tree.file("/p/.strata/words/words"),
        )]);
        assert!(tracker.drain().is_empty());
    }

    #[test]
    fn test_drain_clears_state() {
        let tree = FileTree::new();
        let tracker = tracker();
        tracker.schedule_update(tree.file("/p/src/a.rs"));

        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.drain().modified.len(), 1);
        assert!(tracker.drain().is_empty());
    }
}
