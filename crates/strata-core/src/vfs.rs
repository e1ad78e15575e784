//! File handles and change events supplied by the file-system layer.
//!
//! The engine never talks to the operating system directly: the
//! surrounding application owns the real file tree and hands the engine
//! [`FileNode`] handles plus batches of [`ChangeEvent`]s. A node carries
//! the two pieces of state the engine cares about beyond its path:
//!
//! - a validity flag, flipped by [`FileNode::invalidate`] when the
//!   underlying file disappears or its handle is closed;
//! - lazily materialized children: `None` means the directory's children
//!   were never examined, which bounds the cost of retroactive
//!   invalidation (see [`crate::tracker`]).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a file within one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl FileId {
    /// Create a new file ID
    pub fn new(id: u64) -> Self {
        FileId(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A handle to one file or directory in the externally-owned tree.
pub struct FileNode {
    id: FileId,
    path: PathBuf,
    is_dir: bool,
    mock: bool,
    valid: AtomicBool,
    children: RwLock<Option<Vec<Arc<FileNode>>>>,
}

impl FileNode {
    fn new(id: FileId, path: PathBuf, is_dir: bool, mock: bool) -> Arc<Self> {
        Arc::new(FileNode {
            id,
            path,
            is_dir,
            mock,
            valid: AtomicBool::new(true),
            children: RwLock::new(None),
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component, empty for a bare root.
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Synthetic nodes (tests, in-memory trees) are always fully expanded
    /// by directory-event traversal regardless of materialization.
    pub fn is_mock(&self) -> bool {
        self.mock
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the handle dead. Idempotent; cached sets that observe an
    /// invalid node heal themselves on the next query.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Have this directory's children ever been materialized?
    pub fn children_loaded(&self) -> bool {
        self.children.read().is_some()
    }

    /// Snapshot of the materialized children, `None` if never loaded.
    pub fn children(&self) -> Option<Vec<Arc<FileNode>>> {
        self.children.read().clone()
    }

    /// Install the materialized child list (file-system layer only).
    pub fn set_children(&self, children: Vec<Arc<FileNode>>) {
        *self.children.write() = Some(children);
    }
}

impl fmt::Debug for FileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileNode")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("is_dir", &self.is_dir)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl fmt::Display for FileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Allocates node ids and builds trees; the file-system layer (or a test)
/// is responsible for wiring parent/child structure.
#[derive(Debug, Default)]
pub struct FileTree {
    next_id: AtomicU64,
}

impl FileTree {
    pub fn new() -> Self {
        FileTree {
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate(&self) -> FileId {
        FileId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a plain file node.
    pub fn file(&self, path: impl Into<PathBuf>) -> Arc<FileNode> {
        FileNode::new(self.allocate(), path.into(), false, false)
    }

    /// Create a directory node with unmaterialized children.
    pub fn dir(&self, path: impl Into<PathBuf>) -> Arc<FileNode> {
        FileNode::new(self.allocate(), path.into(), true, false)
    }

    /// Create a synthetic (mock) file node.
    pub fn mock_file(&self, path: impl Into<PathBuf>) -> Arc<FileNode> {
        FileNode::new(self.allocate(), path.into(), false, true)
    }

    /// Create a synthetic (mock) directory node.
    pub fn mock_dir(&self, path: impl Into<PathBuf>) -> Arc<FileNode> {
        FileNode::new(self.allocate(), path.into(), true, true)
    }
}

/// File properties whose changes the tracker may care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileProperty {
    /// Renames can change file-type classification
    Name,

    /// Encoding changes alter decoded content
    Encoding,

    /// Modification timestamps; not significant for indexing
    Timestamp,

    /// Permission bits; not significant for indexing
    Permissions,
}

/// The kind of change that occurred to a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// File contents were modified
    ContentChanged,

    /// A new file or directory was created
    Created,

    /// A file or directory was deleted
    Deleted,

    /// A file or directory was moved; carries the previous path
    Moved { from: PathBuf },

    /// A property changed; only name and encoding are significant
    PropertyChanged(FileProperty),
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::ContentChanged => write!(f, "content_changed"),
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Deleted => write!(f, "deleted"),
            ChangeKind::Moved { .. } => write!(f, "moved"),
            ChangeKind::PropertyChanged(p) => write!(f, "property_changed({:?})", p),
        }
    }
}

/// A single file-system change notification.
///
/// Each physical change is delivered twice: once before the mutation is
/// applied (old state still visible) and once after.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// The kind of change
    pub kind: ChangeKind,

    /// The affected node
    pub file: Arc<FileNode>,
}

impl ChangeEvent {
    pub fn content_changed(file: Arc<FileNode>) -> Self {
        ChangeEvent {
            kind: ChangeKind::ContentChanged,
            file,
        }
    }

    pub fn created(file: Arc<FileNode>) -> Self {
        ChangeEvent {
            kind: ChangeKind::Created,
            file,
        }
    }

    pub fn deleted(file: Arc<FileNode>) -> Self {
        ChangeEvent {
            kind: ChangeKind::Deleted,
            file,
        }
    }

    pub fn moved(file: Arc<FileNode>, from: impl Into<PathBuf>) -> Self {
        ChangeEvent {
            kind: ChangeKind::Moved { from: from.into() },
            file,
        }
    }

    pub fn property_changed(file: Arc<FileNode>, property: FileProperty) -> Self {
        ChangeEvent {
            kind: ChangeKind::PropertyChanged(property),
            file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_basics() {
        let tree = FileTree::new();
        let file = tree.file("/src/main.rs");

        assert!(!file.is_dir());
        assert_eq!(file.name(), "main.rs");
        assert!(file.is_valid());

        file.invalidate();
        assert!(!file.is_valid());
    }

    #[test]
    fn test_children_materialization() {
        let tree = FileTree::new();
        let dir = tree.dir("/src");
        assert!(!dir.children_loaded());
        assert!(dir.children().is_none());

        let child = tree.file("/src/lib.rs");
        dir.set_children(vec![child.clone()]);
        assert!(dir.children_loaded());
        assert_eq!(dir.children().unwrap()[0].id(), child.id());
    }

    #[test]
    fn test_ids_are_distinct() {
        let tree = FileTree::new();
        let a = tree.file("/a");
        let b = tree.file("/b");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_change_event_helpers() {
        let tree = FileTree::new();
        let file = tree.file("/src/old.rs");

        let event = ChangeEvent::moved(file.clone(), "/src/new.rs");
        assert!(matches!(event.kind, ChangeKind::Moved { .. }));

        let event = ChangeEvent::property_changed(file, FileProperty::Encoding);
        assert_eq!(
            event.kind,
            ChangeKind::PropertyChanged(FileProperty::Encoding)
        );
    }
}
