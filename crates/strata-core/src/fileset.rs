//! Indexable file set: which files belong to the indexable universe.
//!
//! The set is composed from pluggable [`RootProvider`] contributors and is
//! the union of directory roots (membership by ancestor path prefix) and
//! explicitly listed files (membership by node identity). The membership
//! snapshot is built on first use and healed lazily: every query checks
//! the cached roots' validity and rebuilds from the contributors when any
//! has gone invalid. Nothing pushes invalidations into the set.

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::vfs::{FileId, FileNode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Contributes roots to the indexable universe.
pub trait RootProvider: Send + Sync {
    /// Directory roots; every file underneath is considered indexable.
    fn directory_roots(&self) -> Vec<Arc<FileNode>>;

    /// Individually listed files outside any directory root.
    fn extra_files(&self) -> Vec<Arc<FileNode>> {
        Vec::new()
    }
}

/// A fixed list of roots, the common provider for configuration-supplied
/// content roots.
pub struct StaticRoots {
    dirs: Vec<Arc<FileNode>>,
    files: Vec<Arc<FileNode>>,
}

impl StaticRoots {
    pub fn new(dirs: Vec<Arc<FileNode>>) -> Self {
        StaticRoots {
            dirs,
            files: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: Vec<Arc<FileNode>>) -> Self {
        self.files = files;
        self
    }
}

impl RootProvider for StaticRoots {
    fn directory_roots(&self) -> Vec<Arc<FileNode>> {
        self.dirs.clone()
    }

    fn extra_files(&self) -> Vec<Arc<FileNode>> {
        self.files.clone()
    }
}

struct Snapshot {
    dirs: Vec<Arc<FileNode>>,
    files: HashMap<FileId, Arc<FileNode>>,
}

impl Snapshot {
    /// A snapshot is usable only while every root it was built from is
    /// still a live handle.
    fn is_intact(&self) -> bool {
        self.dirs.iter().all(|d| d.is_valid()) && self.files.values().all(|f| f.is_valid())
    }
}

/// Lazily rebuilt union of contributor roots.
pub struct IndexableFileSet {
    providers: RwLock<Vec<Arc<dyn RootProvider>>>,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl Default for IndexableFileSet {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexableFileSet {
    pub fn new() -> Self {
        IndexableFileSet {
            providers: RwLock::new(Vec::new()),
            snapshot: RwLock::new(None),
        }
    }

    /// Register another contributor; drops the cached snapshot.
    pub fn add_provider(&self, provider: Arc<dyn RootProvider>) {
        self.providers.write().push(provider);
        *self.snapshot.write() = None;
    }

    /// Is `file` part of the indexable universe?
    ///
    /// Directories are traversable but never content-indexed, so they
    /// report membership like files do; callers filter on
    /// [`FileNode::is_dir`] where it matters.
    pub fn is_in_set(&self, file: &FileNode) -> bool {
        let snapshot = self.current_snapshot();
        if snapshot.files.contains_key(&file.id()) {
            return true;
        }
        snapshot
            .dirs
            .iter()
            .any(|root| is_ancestor_or_self(root.path(), file.path()))
    }

    /// Depth-first traversal from `root`, visiting only in-set files and
    /// pruning a subtree as soon as the directory itself is excluded.
    ///
    /// A directory with unmaterialized children is treated as a leaf. The
    /// visitor returns `false` to stop early; a cancellation checkpoint
    /// runs per directory.
    pub fn iterate(
        &self,
        root: &Arc<FileNode>,
        cancel: &CancelToken,
        visitor: &mut dyn FnMut(&Arc<FileNode>) -> bool,
    ) -> Result<()> {
        let snapshot = self.current_snapshot();
        let mut stack = vec![root.clone()];

        while let Some(node) = stack.pop() {
            cancel.checkpoint()?;

            if !node.is_valid() {
                continue;
            }

            if node.is_dir() {
                // Prune unless the directory is inside the set, or sits
                // above one of the roots on the way down to it.
                let in_set = snapshot
                    .dirs
                    .iter()
                    .any(|r| is_ancestor_or_self(r.path(), node.path()));
                let above_root = snapshot
                    .dirs
                    .iter()
                    .any(|r| is_ancestor_or_self(node.path(), r.path()));
                if !in_set && !above_root {
                    continue;
                }
                if let Some(children) = node.children() {
                    stack.extend(children);
                }
            } else if self.membership(&snapshot, &node) && !visitor(&node) {
                return Ok(());
            }
        }
        Ok(())
    }

    fn membership(&self, snapshot: &Snapshot, file: &FileNode) -> bool {
        snapshot.files.contains_key(&file.id())
            || snapshot
                .dirs
                .iter()
                .any(|root| is_ancestor_or_self(root.path(), file.path()))
    }

    fn current_snapshot(&self) -> Arc<Snapshot> {
        if let Some(snapshot) = self.snapshot.read().as_ref() {
            if snapshot.is_intact() {
                return snapshot.clone();
            }
        }
        self.rebuild_snapshot()
    }

    fn rebuild_snapshot(&self) -> Arc<Snapshot> {
        let providers = self.providers.read();
        let mut dirs = Vec::new();
        let mut files = HashMap::new();
        for provider in providers.iter() {
            dirs.extend(
                provider
                    .directory_roots()
                    .into_iter()
                    .filter(|d| d.is_valid()),
            );
            for file in provider.extra_files() {
                if file.is_valid() {
                    files.insert(file.id(), file);
                }
            }
        }
        debug!(
            dirs = dirs.len(),
            files = files.len(),
            "Rebuilt indexable set snapshot"
        );
        let snapshot = Arc::new(Snapshot { dirs, files });
        *self.snapshot.write() = Some(snapshot.clone());
        snapshot
    }
}

fn is_ancestor_or_self(ancestor: &Path, path: &Path) -> bool {
    path.starts_with(ancestor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::FileTree;

    fn set_with_root(tree: &FileTree, root: &str) -> (IndexableFileSet, Arc<FileNode>) {
        let set = IndexableFileSet::new();
        let dir = tree.dir(root);
        set.add_provider(Arc::new(StaticRoots::new(vec![dir.clone()])));
        (set, dir)
    }

    #[test]
    fn test_prefix_membership() {
        let tree = FileTree::new();
        let (set, _root) = set_with_root(&tree, "/project/src");

        assert!(set.is_in_set(&tree.file("/project/src/main.rs")));
        assert!(set.is_in_set(&tree.file("/project/src/nested/mod.rs")));
        assert!(!set.is_in_set(&tree.file("/project/target/out.o")));
    }

    #[test]
    fn test_listed_file_matches_by_identity() {
        let tree = FileTree::new();
        let listed = tree.file("/outside/notes.txt");
        let set = IndexableFileSet::new();
        set.add_provider(Arc::new(
            StaticRoots::new(vec![]).with_files(vec![listed.clone()]),
        ));

        assert!(set.is_in_set(&listed));
        // Same path, different handle: identity does not match.
        assert!(!set.is_in_set(&tree.file("/outside/notes.txt")));
    }

    #[test]
    fn test_invalid_root_heals_snapshot() {
        let tree = FileTree::new();
        let (set, root) = set_with_root(&tree, "/project/src");

        let file = tree.file("/project/src/main.rs");
        assert!(set.is_in_set(&file));

        // Closing the root handle invalidates membership derived from it.
        root.invalidate();
        assert!(!set.is_in_set(&file));
    }

    #[test]
    fn test_iterate_visits_and_prunes() {
        let tree = FileTree::new();
        let (set, root) = set_with_root(&tree, "/p/src");

        let sub = tree.dir("/p/src/sub");
        let excluded = tree.dir("/p/target");
        let a = tree.file("/p/src/a.rs");
        let b = tree.file("/p/src/sub/b.rs");
        let skipped = tree.file("/p/target/c.o");
        sub.set_children(vec![b.clone()]);
        excluded.set_children(vec![skipped]);

        let top = tree.dir("/p");
        top.set_children(vec![root.clone(), excluded]);
        root.set_children(vec![a.clone(), sub]);

        let mut seen = Vec::new();
        set.iterate(&top, &CancelToken::new(), &mut |f| {
            seen.push(f.path().to_path_buf());
            true
        })
        .unwrap();

        seen.sort();
        assert_eq!(seen, vec![a.path().to_path_buf(), b.path().to_path_buf()]);
    }

    #[test]
    fn test_iterate_cancellation() {
        let tree = FileTree::new();
        let (set, root) = set_with_root(&tree, "/p/src");
        root.set_children(vec![tree.file("/p/src/a.rs")]);

        let token = CancelToken::new();
        token.cancel();
        let result = set.iterate(&root, &token, &mut |_| true);
        assert!(matches!(result, Err(crate::StrataError::Cancelled)));
    }
}
