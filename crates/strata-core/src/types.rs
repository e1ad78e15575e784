//! Core data types for Strata.
//!
//! This module defines the fundamental data structures used throughout the
//! indexing engine. These types are designed to be:
//!
//! - **Serializable**: For persistence to disk
//! - **Platform-agnostic**: No OS-specific details leak into these types
//! - **Cheap to copy**: Identity types are small integers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity of a registered index: a human-readable name paired with the
/// small integer id issued by the registry.
///
/// For a given registry file, `name -> numeric id` is a bijection; ids are
/// assigned sequentially starting at 1 and never reused. Equality and
/// hashing are defined by the numeric id alone, so an `IndexId` is safe to
/// use as a map key even when names are re-interned across restarts.
#[derive(Debug, Clone)]
pub struct IndexId {
    name: Arc<str>,
    id: u16,
}

impl IndexId {
    pub(crate) fn new(name: impl Into<Arc<str>>, id: u16) -> Self {
        IndexId {
            name: name.into(),
            id,
        }
    }

    /// The registered name of the index.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The numeric id, unique within the registry that issued it.
    pub fn as_u16(&self) -> u16 {
        self.id
    }
}

impl PartialEq for IndexId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for IndexId {}

impl Hash for IndexId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Identifier for an index target: a partition of indexed items such as a
/// module or a log instance. Targets scope obsolete-entry collection and
/// diffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(pub u32);

impl TargetId {
    /// Create a new target id
    pub fn new(id: u32) -> Self {
        TargetId(id)
    }

    /// Get the raw id value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted `(source-state, output-state)` pair for one `(target, key)`.
///
/// `source` fingerprints the input the entry was computed from; `output`
/// fingerprints (or describes) what was produced. An entry is up to date
/// iff both still match the live input and artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry<S, O> {
    /// Fingerprint of the input at the time the entry was committed
    pub source: S,

    /// Fingerprint/descriptor of the produced output
    pub output: O,
}

impl<S, O> StoredEntry<S, O> {
    pub fn new(source: S, output: O) -> Self {
        StoredEntry { source, output }
    }
}

/// Which targets a query ranges over.
#[derive(Debug, Clone)]
pub enum TargetScope {
    /// Every target known to the store
    All,

    /// An explicit list of targets
    Targets(Vec<TargetId>),
}

impl TargetScope {
    /// Check whether the scope covers the given target.
    pub fn contains(&self, target: TargetId) -> bool {
        match self {
            TargetScope::All => true,
            TargetScope::Targets(ids) => ids.contains(&target),
        }
    }
}

/// How a caller wants index reads gated against dumb mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Fail with [`crate::StrataError::DumbMode`] unless the coordinator
    /// is smart. This is the consistent default.
    RequireSmart,

    /// Explicitly accept possibly stale data for a bounded operation.
    TolerateStale,
}

/// Statistics about a registered index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    /// Number of stored entries
    pub entry_count: u64,

    /// Number of targets with at least one entry
    pub target_count: u32,

    /// When the index was last committed to
    pub last_updated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_index_id_identity_is_numeric() {
        let a = IndexId::new("words", 3);
        let b = IndexId::new("words", 3);
        let c = IndexId::new("words", 4);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(format!("{}", a), "words#3");
    }

    #[test]
    fn test_target_scope() {
        let scope = TargetScope::Targets(vec![TargetId(1), TargetId(7)]);
        assert!(scope.contains(TargetId(7)));
        assert!(!scope.contains(TargetId(2)));
        assert!(TargetScope::All.contains(TargetId(99)));
    }
}
