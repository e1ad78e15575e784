//! The built-in catalog index: one entry per file, keyed by its
//! workspace-relative path, storing a content digest.
//!
//! Source state fingerprints the input cheaply (length + mtime), the
//! output state records what was produced (crc32 + length). A file whose
//! fingerprint matches the stored entry is never re-read.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use strata_core::{
    HashedKey, IndexKind, KeyDescriptor, ProcessOutcome, ProcessRequest, Result, StrataError,
    WorkItem,
};
use tracing::warn;

/// Cheap input fingerprint: size and modification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub len: u64,
    pub mtime_ms: u64,
}

/// What the catalog produces per file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub crc32: u32,
    pub len: u64,
}

/// Catalog extraction logic rooted at one directory.
pub struct CatalogKind {
    root: PathBuf,
}

impl CatalogKind {
    /// Bump when the digest format changes; forces a full rebuild.
    pub const VERSION: u32 = 1;

    pub fn new(root: PathBuf) -> Self {
        CatalogKind { root }
    }

    fn relative_key(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative.to_string_lossy().replace('\\', "/")
    }
}

impl IndexKind for CatalogKind {
    type Key = String;
    type SourceState = SourceFingerprint;
    type OutputState = FileDigest;

    fn name(&self) -> &str {
        "catalog"
    }

    fn version(&self) -> u32 {
        Self::VERSION
    }

    fn key_descriptor(&self) -> Arc<dyn KeyDescriptor<String>> {
        Arc::new(HashedKey)
    }

    fn key_of(&self, item: &WorkItem) -> String {
        self.relative_key(item.file.path())
    }

    fn source_state(&self, item: &WorkItem) -> Result<SourceFingerprint> {
        let metadata = fs::metadata(item.file.path()).map_err(|e| StrataError::Extraction {
            path: item.file.path().to_path_buf(),
            reason: e.to_string(),
        })?;
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(SourceFingerprint {
            len: metadata.len(),
            mtime_ms,
        })
    }

    fn output_up_to_date(&self, _item: &WorkItem, _stored: &FileDigest) -> bool {
        // The digest lives only in the store; it cannot rot independently
        // of its source fingerprint.
        true
    }

    fn process(&self, request: ProcessRequest<'_, Self>) -> Result<ProcessOutcome<Self>> {
        let mut outcome = ProcessOutcome::default();
        for (i, pending) in request.to_process.iter().enumerate() {
            let path = pending.item.file.path();
            match fs::read(path) {
                Ok(bytes) => {
                    outcome.processed.push((
                        i,
                        FileDigest {
                            crc32: crc32fast::hash(&bytes),
                            len: bytes.len() as u64,
                        },
                    ));
                }
                Err(e) => {
                    // Unreadable files stay out of the catalog; the next
                    // cycle retries them.
                    warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{FileTree, TargetId};
    use tempfile::TempDir;

    fn item(tree: &FileTree, path: &Path) -> WorkItem {
        WorkItem {
            file: tree.file(path),
            target: TargetId(1),
        }
    }

    #[test]
    fn test_relative_keys() {
        let kind = CatalogKind::new(PathBuf::from("/work/project"));
        let tree = FileTree::new();
        let work = item(&tree, Path::new("/work/project/src/main.rs"));
        assert_eq!(kind.key_of(&work), "src/main.rs");
    }

    #[test]
    fn test_fingerprint_and_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"hello strata").unwrap();

        let kind = CatalogKind::new(dir.path().to_path_buf());
        let tree = FileTree::new();
        let work = item(&tree, &path);

        let fingerprint = kind.source_state(&work).unwrap();
        assert_eq!(fingerprint.len, 12);

        let pending = strata_core::update::PendingItem {
            key: kind.key_of(&work),
            source: fingerprint,
            item: work,
        };
        let outcome = kind
            .process(ProcessRequest {
                to_process: std::slice::from_ref(&pending),
                to_remove: &[],
            })
            .unwrap();
        assert_eq!(outcome.processed.len(), 1);
        assert_eq!(outcome.processed[0].1.crc32, crc32fast::hash(b"hello strata"));
    }

    #[test]
    fn test_missing_file_fails_fingerprinting() {
        let kind = CatalogKind::new(PathBuf::from("/nowhere"));
        let tree = FileTree::new();
        let work = item(&tree, Path::new("/nowhere/ghost.rs"));
        assert!(kind.source_state(&work).is_err());
    }
}
