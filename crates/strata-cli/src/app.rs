//! Application state management.

use crate::catalog::CatalogKind;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::{
    Config, FileNode, FileTree, IndexEngine, IndexHandle, StaticRoots, TargetId,
};
use tracing::info;

/// Shared application state: the engine plus the catalog index over one
/// workspace root.
pub struct App {
    /// Configuration
    pub config: Config,

    /// The index engine
    pub engine: IndexEngine,

    /// Handle to the built-in catalog index
    pub handle: IndexHandle<CatalogKind>,

    /// The target scoping this workspace's entries
    pub target: TargetId,

    /// Node allocator for the scanned tree
    pub tree: FileTree,

    /// Materialized root of the workspace tree
    pub root: Arc<FileNode>,

    /// Canonical workspace root path
    pub root_path: PathBuf,
}

impl App {
    /// Create a new application instance over `root_path`.
    pub fn new(config: Config, root_path: &Path) -> anyhow::Result<Self> {
        let root_path = root_path
            .canonicalize()
            .map_err(|e| anyhow::anyhow!("cannot resolve {}: {}", root_path.display(), e))?;

        let engine = IndexEngine::new(config.clone())?;
        let handle = engine.register_index(CatalogKind::new(root_path.clone()))?;

        let tree = FileTree::new();
        let skip = config.skip_prefixes()?;
        let root = scan_tree(&tree, &root_path, &skip)?;
        engine.register_indexable_set(Arc::new(StaticRoots::new(vec![root.clone()])));

        let target = engine.targets().register(root_path.display().to_string());

        info!(
            root = %root_path.display(),
            storage = %engine.storage_root().display(),
            "Application initialized"
        );

        Ok(App {
            config,
            engine,
            handle,
            target,
            tree,
            root,
            root_path,
        })
    }
}

/// Build a fully materialized node tree from disk, skipping excluded
/// prefixes and symlinks.
pub fn scan_tree(tree: &FileTree, path: &Path, skip: &[PathBuf]) -> anyhow::Result<Arc<FileNode>> {
    let root = tree.dir(path);
    let mut children = Vec::new();

    let mut entries: Vec<_> = fs::read_dir(path)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let entry_path = entry.path();
        if skip.iter().any(|p| entry_path.starts_with(p)) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            children.push(scan_tree(tree, &entry_path, skip)?);
        } else {
            children.push(tree.file(entry_path));
        }
    }

    root.set_children(children);
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_tree_materializes_children() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"b").unwrap();

        let tree = FileTree::new();
        let root = scan_tree(&tree, dir.path(), &[]).unwrap();
        assert!(root.children_loaded());

        let children = root.children().unwrap();
        assert_eq!(children.len(), 2);
        let sub = children.iter().find(|c| c.is_dir()).unwrap();
        assert_eq!(sub.children().unwrap().len(), 1);
    }

    #[test]
    fn test_scan_tree_skips_prefixes() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".strata")).unwrap();
        fs::write(dir.path().join(".strata/junk"), b"x").unwrap();
        fs::write(dir.path().join("kept.txt"), b"y").unwrap();

        let tree = FileTree::new();
        let root = scan_tree(&tree, dir.path(), &[dir.path().join(".strata")]).unwrap();
        let children = root.children().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name(), "kept.txt");
    }
}
