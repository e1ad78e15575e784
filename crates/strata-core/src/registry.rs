//! Identity registry mapping index names to small stable integer ids.
//!
//! The registry is the shared identity space for every index in a storage
//! root. Ids are issued sequentially starting at 1 and persisted to a
//! sequential name table (`indices.enum`, one name per line, line number =
//! numeric id) so they survive process restarts. Within one registry file
//! an id is never reused.
//!
//! If the table cannot be read it is cleared and rewritten empty: every
//! previously-issued id becomes unrecoverable and dependent indexes detect
//! this through their own version markers on next open.

use crate::error::{Result, StrataError};
use crate::types::IndexId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the shared registry file inside the storage root.
pub const REGISTRY_FILE: &str = "indices.enum";

/// Hard cap on distinct index names per registry.
pub const MAX_INDEX_COUNT: u16 = i16::MAX as u16;

/// Persistent name → id table.
///
/// All operations are internally synchronized; the registry is shared by
/// reference from the engine context.
pub struct IndexRegistry {
    path: PathBuf,
    inner: Mutex<RegistryState>,
}

struct RegistryState {
    by_name: HashMap<String, u16>,
    names: Vec<Arc<str>>,
    file: File,
    was_reset: bool,
}

impl IndexRegistry {
    /// Open (or create) the registry backed by `<root>/indices.enum`.
    ///
    /// An unreadable table is truncated and rewritten empty; the condition
    /// is reported through [`IndexRegistry::was_reset`] rather than as an
    /// error, since recovery is automatic.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let path = root.join(REGISTRY_FILE);

        let mut was_reset = false;
        let names: Vec<Arc<str>> = match read_name_table(&path) {
            Ok(names) => names,
            Err(reason) => {
                warn!(
                    path = %path.display(),
                    reason = %reason,
                    "Registry table unreadable, resetting; all dependent indexes will rebuild"
                );
                // Truncate to a valid empty table. Every issued id is gone.
                fs::write(&path, b"")?;
                was_reset = true;
                Vec::new()
            }
        };

        let by_name = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), (i + 1) as u16))
            .collect();

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        debug!(path = %path.display(), names = names.len(), "Registry opened");

        Ok(IndexRegistry {
            path,
            inner: Mutex::new(RegistryState {
                by_name,
                names,
                file,
                was_reset,
            }),
        })
    }

    /// Return the id previously issued for `name`, or allocate the next
    /// one and persist it immediately.
    ///
    /// Registering more than [`MAX_INDEX_COUNT`] distinct names is a fatal
    /// configuration error.
    pub fn create(&self, name: &str) -> Result<IndexId> {
        let mut state = self.inner.lock();

        if let Some(&id) = state.by_name.get(name) {
            let interned = state.names[(id - 1) as usize].clone();
            return Ok(IndexId::new(interned, id));
        }

        if state.names.len() >= MAX_INDEX_COUNT as usize {
            return Err(StrataError::TooManyIndexes {
                max: MAX_INDEX_COUNT,
            });
        }

        let id = (state.names.len() + 1) as u16;
        state.file.write_all(name.as_bytes())?;
        state.file.write_all(b"\n")?;
        state.file.flush()?;

        let interned: Arc<str> = Arc::from(name);
        state.names.push(interned.clone());
        state.by_name.insert(name.to_string(), id);

        debug!(name = %name, id = id, "Registered index name");
        Ok(IndexId::new(interned, id))
    }

    /// Pure in-memory lookup of an id issued this run or read from disk.
    pub fn find_by_id(&self, id: u16) -> Option<IndexId> {
        let state = self.inner.lock();
        state
            .names
            .get((id as usize).checked_sub(1)?)
            .map(|name| IndexId::new(name.clone(), id))
    }

    /// Number of names in the table.
    pub fn len(&self) -> usize {
        self.inner.lock().names.len()
    }

    /// True if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the table was found unreadable at open and rewritten empty.
    ///
    /// Dependent indexes do not need to consult this: their version
    /// markers live next to their own storage and mismatch independently.
    pub fn was_reset(&self) -> bool {
        self.inner.lock().was_reset
    }

    /// Path of the backing table file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read the sequential name table, validating that every line is a
/// non-empty name.
fn read_name_table(path: &Path) -> std::result::Result<Vec<Arc<str>>, String> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let contents = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut names = Vec::new();
    for line in contents.lines() {
        if line.is_empty() {
            return Err("blank name line".to_string());
        }
        names.push(Arc::from(line));
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_same_name_same_id() {
        let dir = TempDir::new().unwrap();
        let registry = IndexRegistry::open(dir.path()).unwrap();

        let a = registry.create("words").unwrap();
        let b = registry.create("words").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_u16(), 1);

        let c = registry.create("symbols").unwrap();
        assert_eq!(c.as_u16(), 2);
    }

    #[test]
    fn test_find_by_id_returns_exact_name() {
        let dir = TempDir::new().unwrap();
        let registry = IndexRegistry::open(dir.path()).unwrap();

        for name in ["alpha", "beta", "gamma"] {
            let id = registry.create(name).unwrap();
            let found = registry.find_by_id(id.as_u16()).unwrap();
            assert_eq!(found.name(), name);
        }
        assert!(registry.find_by_id(0).is_none());
        assert!(registry.find_by_id(42).is_none());
    }

    #[test]
    fn test_ids_survive_reopen() {
        let dir = TempDir::new().unwrap();

        let first = {
            let registry = IndexRegistry::open(dir.path()).unwrap();
            registry.create("words").unwrap();
            registry.create("symbols").unwrap()
        };

        let registry = IndexRegistry::open(dir.path()).unwrap();
        assert!(!registry.was_reset());
        assert_eq!(registry.create("symbols").unwrap(), first);
        assert_eq!(registry.create("words").unwrap().as_u16(), 1);
        assert_eq!(registry.create("trigrams").unwrap().as_u16(), 3);
    }

    #[test]
    fn test_corrupted_table_resets() {
        let dir = TempDir::new().unwrap();
        {
            let registry = IndexRegistry::open(dir.path()).unwrap();
            registry.create("words").unwrap();
        }

        // A blank interior line makes the table unreadable.
        fs::write(dir.path().join(REGISTRY_FILE), "words\n\nsymbols\n").unwrap();

        let registry = IndexRegistry::open(dir.path()).unwrap();
        assert!(registry.was_reset());
        assert!(registry.is_empty());

        // Renumbering starts from scratch.
        assert_eq!(registry.create("symbols").unwrap().as_u16(), 1);
    }

    #[test]
    fn test_id_limit() {
        let dir = TempDir::new().unwrap();
        let registry = IndexRegistry::open(dir.path()).unwrap();

        let mut seen = std::collections::HashSet::new();
        for i in 0..MAX_INDEX_COUNT as u32 {
            let id = registry.create(&format!("index-{}", i)).unwrap();
            assert!(seen.insert(id.as_u16()));
        }
        assert_eq!(seen.len(), MAX_INDEX_COUNT as usize);

        let err = registry.create("one-too-many").unwrap_err();
        assert!(matches!(err, StrataError::TooManyIndexes { .. }));

        // Existing names are still resolvable at the limit.
        assert_eq!(registry.create("index-0").unwrap().as_u16(), 1);
    }
}
