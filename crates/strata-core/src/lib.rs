//! # Strata Core Library
//!
//! This crate provides the incremental file-indexing engine behind the
//! Strata tool: a stable identity space for named indexes, change
//! tracking against a live file tree, crash-safe persistent key-value
//! storage for derived data, and a dumb/smart coordinator that serializes
//! background rebuild work against concurrent reads.
//!
//! ## Architecture
//!
//! - **Types** (`types`): identity and state types shared across the engine
//! - **Registry** (`registry`): persistent index-name → id table
//! - **Vfs** (`vfs`): file handles and change events supplied externally
//! - **Fileset** (`fileset`): the indexable universe and its traversal
//! - **Tracker** (`tracker`): merges raw change events into work items
//! - **Storage** (`storage`): append-log persistence per index
//! - **Update** (`update`): the per-(index, target) diff/apply/commit cycle
//! - **Coordinator** (`coordinator`): dumb/smart state machine and worker
//! - **Engine** (`engine`): the context object tying it all together
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_core::{Config, IndexEngine, ReadPolicy, TargetScope};
//!
//! let engine = IndexEngine::new(Config::default())?;
//! let handle = engine.register_index(MyIndexKind::new())?;
//!
//! engine.wait_for_smart()?;
//! let values = engine.get_values(
//!     &handle,
//!     &key,
//!     &TargetScope::All,
//!     ReadPolicy::RequireSmart,
//! )?;
//! ```

pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod fileset;
pub mod registry;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod update;
pub mod vfs;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use config::Config;
pub use coordinator::{ClosureTask, DumbTask, Mode, ModeCoordinator, ModeEvent, TaskHandle};
pub use engine::{IndexEngine, IndexHandle};
pub use error::{Result, StrataError};
pub use fileset::{IndexableFileSet, RootProvider, StaticRoots};
pub use registry::{IndexRegistry, MAX_INDEX_COUNT};
pub use storage::{HashedKey, IndexStorage, KeyDescriptor};
pub use tracker::{ChangeSet, ChangeTracker};
pub use types::{IndexId, IndexStats, ReadPolicy, StoredEntry, TargetId, TargetScope};
pub use update::{
    IndexKind, NoRefresh, ProcessOutcome, ProcessRequest, Refresher, TargetItems, TargetRegistry,
    UpdateMode, UpdateOutcome, Updater, WorkItem,
};
pub use vfs::{ChangeEvent, ChangeKind, FileId, FileNode, FileProperty, FileTree};
