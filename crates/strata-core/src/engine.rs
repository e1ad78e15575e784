//! The engine context: one object owning the registry, the coordinator,
//! the change tracker and the registered-index table.
//!
//! There is no global state; the application constructs one `IndexEngine`
//! at startup and passes it by reference to everything that needs index
//! access. Extraction logic is registered explicitly through
//! [`IndexEngine::register_index`], which returns a typed [`IndexHandle`]
//! used for queries and updates; lifecycle operations address indexes by
//! their [`IndexId`].
//!
//! Index reads are gated on the dumb/smart state: callers either require
//! [`Mode::Smart`](crate::coordinator::Mode::Smart) (the default) or opt
//! into stale data with [`ReadPolicy::TolerateStale`].

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::coordinator::{DumbTask, ModeCoordinator, ModeEvent, TaskHandle};
use crate::error::{Result, StrataError};
use crate::fileset::{IndexableFileSet, RootProvider};
use crate::registry::IndexRegistry;
use crate::storage::{AnyStorage, IndexStorage};
use crate::tracker::{ChangeSet, ChangeTracker};
use crate::types::{IndexId, IndexStats, ReadPolicy, TargetScope};
use crate::update::{
    IndexKind, Refresher, TargetItems, TargetRegistry, UpdateMode, UpdateOutcome, Updater,
};
use crate::vfs::{ChangeEvent, FileNode};
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

struct RegisteredIndex {
    id: IndexId,
    storage: Arc<dyn AnyStorage>,
    needs_rebuild: Arc<AtomicBool>,
    last_updated: Arc<Mutex<Option<DateTime<Utc>>>>,
}

/// Typed access to one registered index.
///
/// The handle pins the key and state types at registration, so queries
/// and updates need no downcasting.
pub struct IndexHandle<D: IndexKind> {
    id: IndexId,
    kind: Arc<D>,
    storage: Arc<IndexStorage<D::Key, D::SourceState, D::OutputState>>,
    needs_rebuild: Arc<AtomicBool>,
    last_updated: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl<D: IndexKind> Clone for IndexHandle<D> {
    fn clone(&self) -> Self {
        IndexHandle {
            id: self.id.clone(),
            kind: self.kind.clone(),
            storage: self.storage.clone(),
            needs_rebuild: self.needs_rebuild.clone(),
            last_updated: self.last_updated.clone(),
        }
    }
}

impl<D: IndexKind> IndexHandle<D> {
    pub fn id(&self) -> &IndexId {
        &self.id
    }

    pub fn kind(&self) -> &D {
        &self.kind
    }
}

/// The engine context object.
pub struct IndexEngine {
    config: Config,
    storage_root: PathBuf,
    registry: IndexRegistry,
    coordinator: Arc<ModeCoordinator>,
    tracker: ChangeTracker,
    targets: TargetRegistry,
    file_set: IndexableFileSet,
    indexes: RwLock<HashMap<u16, RegisteredIndex>>,
}

impl IndexEngine {
    /// Construct the engine: opens the identity registry under the
    /// configured storage root and starts the background worker.
    pub fn new(config: Config) -> Result<Self> {
        let storage_root = config.storage_dir()?;
        let registry = IndexRegistry::open(&storage_root)?;
        if registry.was_reset() {
            warn!("Identity registry was reset; all indexes will rebuild");
        }
        let tracker = ChangeTracker::new(config.skip_prefixes()?);

        info!(storage = %storage_root.display(), "Index engine initialized");

        Ok(IndexEngine {
            config,
            storage_root,
            registry,
            coordinator: Arc::new(ModeCoordinator::new()),
            tracker,
            targets: TargetRegistry::new(),
            file_set: IndexableFileSet::new(),
            indexes: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.targets
    }

    pub fn file_set(&self) -> &IndexableFileSet {
        &self.file_set
    }

    pub fn coordinator(&self) -> &ModeCoordinator {
        &self.coordinator
    }

    // === Registration ===

    /// Register extraction logic and open its storage.
    ///
    /// A version-marker mismatch wipes the store before any data is read;
    /// corruption wipes and retries once. Either way the index comes up
    /// flagged for a full rebuild.
    pub fn register_index<D: IndexKind>(&self, kind: D) -> Result<IndexHandle<D>> {
        let id = self.registry.create(kind.name())?;
        let storage = Arc::new(IndexStorage::open(
            &self.storage_root,
            kind.name(),
            kind.version(),
            kind.key_descriptor(),
        )?);

        let needs_rebuild = Arc::new(AtomicBool::new(storage.was_wiped()));
        let last_updated = Arc::new(Mutex::new(None));

        self.indexes.write().insert(
            id.as_u16(),
            RegisteredIndex {
                id: id.clone(),
                storage: storage.clone(),
                needs_rebuild: needs_rebuild.clone(),
                last_updated: last_updated.clone(),
            },
        );

        info!(
            index = %id,
            version = kind.version(),
            rebuild = needs_rebuild.load(Ordering::Acquire),
            "Index registered"
        );

        Ok(IndexHandle {
            id,
            kind: Arc::new(kind),
            storage,
            needs_rebuild,
            last_updated,
        })
    }

    /// Contribute roots to the indexable universe.
    pub fn register_indexable_set(&self, provider: Arc<dyn RootProvider>) {
        self.file_set.add_provider(provider);
    }

    // === Queries ===

    fn check_read(&self, policy: ReadPolicy) -> Result<()> {
        if policy == ReadPolicy::TolerateStale || self.coordinator.is_smart() {
            Ok(())
        } else {
            Err(StrataError::DumbMode)
        }
    }

    /// Output states stored for `key` across `scope`.
    pub fn get_values<D: IndexKind>(
        &self,
        handle: &IndexHandle<D>,
        key: &D::Key,
        scope: &TargetScope,
        policy: ReadPolicy,
    ) -> Result<Vec<D::OutputState>> {
        self.check_read(policy)?;
        Ok(handle.storage.values(key, scope))
    }

    /// Files whose entries include `key`, within `scope`.
    pub fn get_containing_files<D: IndexKind>(
        &self,
        handle: &IndexHandle<D>,
        key: &D::Key,
        scope: &TargetScope,
        policy: ReadPolicy,
    ) -> Result<Vec<PathBuf>> {
        self.check_read(policy)?;
        Ok(handle.storage.containing_files(key, scope))
    }

    /// Visit every stored key; the visitor returns `false` to stop.
    /// Returns whether the iteration ran to completion.
    pub fn process_all_keys<D: IndexKind>(
        &self,
        handle: &IndexHandle<D>,
        policy: ReadPolicy,
        visitor: &mut dyn FnMut(&D::Key) -> bool,
    ) -> Result<bool> {
        self.check_read(policy)?;
        for key in handle.storage.all_keys() {
            if !visitor(&key) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Stats for a registered index.
    pub fn stats(&self, id: &IndexId) -> Option<IndexStats> {
        let indexes = self.indexes.read();
        let registered = indexes.get(&id.as_u16())?;
        let stats = IndexStats {
            entry_count: registered.storage.entry_count() as u64,
            target_count: registered.storage.target_count() as u32,
            last_updated: *registered.last_updated.lock(),
        };
        Some(stats)
    }

    /// Names and stats of every registered index.
    pub fn all_stats(&self) -> Vec<(IndexId, IndexStats)> {
        let indexes = self.indexes.read();
        let mut all: Vec<_> = indexes
            .values()
            .map(|r| {
                (
                    r.id.clone(),
                    IndexStats {
                        entry_count: r.storage.entry_count() as u64,
                        target_count: r.storage.target_count() as u32,
                        last_updated: *r.last_updated.lock(),
                    },
                )
            })
            .collect();
        all.sort_by_key(|(id, _)| id.as_u16());
        all
    }

    // === Lifecycle ===

    /// Flag an index so its next update cycle starts from a wiped store.
    pub fn request_rebuild(&self, id: &IndexId) -> Result<()> {
        let indexes = self.indexes.read();
        let registered = indexes
            .get(&id.as_u16())
            .ok_or(StrataError::UnknownIndex { id: id.as_u16() })?;
        registered.needs_rebuild.store(true, Ordering::Release);
        info!(index = %id, "Full rebuild requested");
        Ok(())
    }

    /// Is a full rebuild pending for this index?
    pub fn needs_rebuild(&self, id: &IndexId) -> bool {
        self.indexes
            .read()
            .get(&id.as_u16())
            .map(|r| r.needs_rebuild.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Ask for one file to be re-extracted on the next update cycle.
    pub fn request_reindex(&self, file: Arc<FileNode>) {
        self.tracker.schedule_update(file);
    }

    /// Pre-apply half of a change notification batch.
    pub fn notify_before(&self, batch: &[ChangeEvent]) {
        self.tracker.before_events(batch);
    }

    /// Post-apply half of a change notification batch.
    pub fn notify_after(&self, batch: &[ChangeEvent]) {
        self.tracker.after_events(batch);
    }

    /// Number of files with pending change signals.
    pub fn pending_changes(&self) -> usize {
        self.tracker.pending_count()
    }

    /// Take the merged change set, dropping files that left the indexable
    /// universe from the "modified" side (their stored keys still get
    /// removed through the diff).
    pub fn drain_changes(&self) -> ChangeSet {
        let mut changes = self.tracker.drain();
        changes.modified.retain(|f| self.file_set.is_in_set(f));
        changes
    }

    // === Updates ===

    /// Collect the in-set items under `root` for one target.
    pub fn collect_target_items(
        &self,
        target: crate::types::TargetId,
        root: &Arc<FileNode>,
        cancel: &CancelToken,
    ) -> Result<TargetItems> {
        let mut files = Vec::new();
        self.file_set.iterate(root, cancel, &mut |file| {
            files.push(file.clone());
            true
        })?;
        Ok(TargetItems { target, files })
    }

    /// Run one full update cycle for `handle`.
    ///
    /// A pending rebuild wipes the store first (in `Apply` mode) so the
    /// cycle reprocesses everything. Failures that poison the stored data
    /// re-flag the index for rebuild before propagating.
    pub fn update_index<D: IndexKind>(
        &self,
        handle: &IndexHandle<D>,
        live: &[TargetItems],
        mode: UpdateMode,
        refresher: &dyn Refresher,
        cancel: &CancelToken,
    ) -> Result<UpdateOutcome> {
        if handle.needs_rebuild.load(Ordering::Acquire) {
            if mode == UpdateMode::CheckOnly {
                return Err(StrataError::Cancelled);
            }
            handle.storage.wipe()?;
            handle.needs_rebuild.store(false, Ordering::Release);
        }

        let updater = Updater::new(
            handle.kind.as_ref(),
            &handle.storage,
            &self.targets,
            refresher,
            cancel,
        );
        let outcome = updater.run(live, mode);
        self.finish_update(handle, outcome)
    }

    /// Apply a drained change set incrementally.
    pub fn apply_changes<D: IndexKind>(
        &self,
        handle: &IndexHandle<D>,
        target: crate::types::TargetId,
        changes: &ChangeSet,
        refresher: &dyn Refresher,
        cancel: &CancelToken,
    ) -> Result<UpdateOutcome> {
        if handle.needs_rebuild.load(Ordering::Acquire) {
            // Stale data underneath; incremental application would only
            // paper over it.
            return Err(StrataError::Cancelled);
        }
        let updater = Updater::new(
            handle.kind.as_ref(),
            &handle.storage,
            &self.targets,
            refresher,
            cancel,
        );
        let outcome = updater.run_incremental(target, changes);
        self.finish_update(handle, outcome)
    }

    fn finish_update<D: IndexKind>(
        &self,
        handle: &IndexHandle<D>,
        outcome: Result<UpdateOutcome>,
    ) -> Result<UpdateOutcome> {
        match outcome {
            Ok(outcome) => {
                *handle.last_updated.lock() = Some(Utc::now());
                Ok(outcome)
            }
            Err(e) => {
                if e.requires_rebuild() {
                    warn!(index = %handle.id, error = %e, "Update failed, forcing rebuild");
                    handle.needs_rebuild.store(true, Ordering::Release);
                }
                Err(e)
            }
        }
    }

    // === Scheduling ===

    /// Queue a background task; see
    /// [`ModeCoordinator::queue_task`](crate::coordinator::ModeCoordinator::queue_task).
    pub fn queue_task(&self, task: Box<dyn DumbTask>) -> Result<Option<TaskHandle>> {
        self.coordinator.queue_task(task)
    }

    /// Run `callback` once the engine is smart.
    pub fn run_when_smart(&self, callback: impl FnOnce() + Send + 'static) {
        self.coordinator.run_when_smart(callback);
    }

    /// Block until all queued index work has finished.
    pub fn wait_for_smart(&self) -> Result<()> {
        self.coordinator.wait_for_smart()
    }

    /// Subscribe to dumb-mode enter/exit events.
    pub fn subscribe(&self) -> Receiver<ModeEvent> {
        self.coordinator.subscribe()
    }

    pub fn is_dumb(&self) -> bool {
        self.coordinator.is_dumb()
    }

    /// Flush all index stores and stop the background worker. Pending
    /// tasks are dropped without running.
    pub fn shutdown(&self) {
        for registered in self.indexes.read().values() {
            if let Err(e) = registered.storage.flush() {
                warn!(index = %registered.id, error = %e, "Flush failed during shutdown");
            }
        }
        self.coordinator.dispose();
    }
}

impl Drop for IndexEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileset::StaticRoots;
    use crate::storage::{HashedKey, KeyDescriptor};
    use crate::update::{ProcessOutcome, ProcessRequest, WorkItem};
    use crate::vfs::FileTree;
    use std::collections::HashMap as StdHashMap;
    use tempfile::TempDir;

    /// Map-driven extraction logic, same shape as the updater tests but
    /// wired through the engine.
    struct MapKind {
        version: u32,
        sources: Mutex<StdHashMap<PathBuf, u64>>,
    }

    impl MapKind {
        fn new(version: u32) -> Self {
            MapKind {
                version,
                sources: Mutex::new(StdHashMap::new()),
            }
        }

        fn set_source(&self, path: &Path, v: u64) {
            self.sources.lock().insert(path.to_path_buf(), v);
        }
    }

    impl IndexKind for MapKind {
        type Key = String;
        type SourceState = u64;
        type OutputState = String;

        fn name(&self) -> &str {
            "map"
        }

        fn version(&self) -> u32 {
            self.version
        }

        fn key_descriptor(&self) -> Arc<dyn KeyDescriptor<String>> {
            Arc::new(HashedKey)
        }

        fn key_of(&self, item: &WorkItem) -> String {
            item.file.path().to_string_lossy().into_owned()
        }

        fn source_state(&self, item: &WorkItem) -> Result<u64> {
            self.sources
                .lock()
                .get(item.file.path())
                .copied()
                .ok_or_else(|| StrataError::Extraction {
                    path: item.file.path().to_path_buf(),
                    reason: "missing".to_string(),
                })
        }

        fn output_up_to_date(&self, _item: &WorkItem, _stored: &String) -> bool {
            true
        }

        fn process(&self, request: ProcessRequest<'_, Self>) -> Result<ProcessOutcome<Self>> {
            let mut outcome = ProcessOutcome::default();
            for (i, pending) in request.to_process.iter().enumerate() {
                outcome.processed.push((i, format!("out-{}", pending.source)));
            }
            Ok(outcome)
        }
    }

    struct Fixture {
        _dir: TempDir,
        engine: IndexEngine,
        tree: FileTree,
        root: Arc<FileNode>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = Config::default();
            config.general.storage_path = Some(dir.path().to_path_buf());
            let engine = IndexEngine::new(config).unwrap();

            let tree = FileTree::new();
            let root = tree.dir("/p/src");
            engine.register_indexable_set(Arc::new(StaticRoots::new(vec![root.clone()])));

            Fixture {
                _dir: dir,
                engine,
                tree,
                root,
            }
        }

        fn add_file(&self, kind: &MapKind, path: &str, source: u64) -> Arc<FileNode> {
            let file = self.tree.file(path);
            kind.set_source(file.path(), source);
            let mut children = self.root.children().unwrap_or_default();
            children.push(file.clone());
            self.root.set_children(children);
            file
        }
    }

    #[test]
    fn test_end_to_end_build_and_query() {
        let fx = Fixture::new();
        let kind = MapKind::new(1);
        fx.add_file(&kind, "/p/src/a.rs", 7);
        fx.add_file(&kind, "/p/src/b.rs", 9);

        let handle = fx.engine.register_index(kind).unwrap();
        let target = fx.engine.targets().register("src");

        let cancel = CancelToken::new();
        let items = fx
            .engine
            .collect_target_items(target, &fx.root, &cancel)
            .unwrap();
        assert_eq!(items.files.len(), 2);

        let outcome = fx
            .engine
            .update_index(
                &handle,
                &[items],
                UpdateMode::Apply,
                &crate::update::NoRefresh,
                &cancel,
            )
            .unwrap();
        assert_eq!(outcome.processed, 2);

        let values = fx
            .engine
            .get_values(
                &handle,
                &"/p/src/a.rs".to_string(),
                &TargetScope::All,
                ReadPolicy::RequireSmart,
            )
            .unwrap();
        assert_eq!(values, vec!["out-7".to_string()]);

        let files = fx
            .engine
            .get_containing_files(
                &handle,
                &"/p/src/b.rs".to_string(),
                &TargetScope::All,
                ReadPolicy::RequireSmart,
            )
            .unwrap();
        assert_eq!(files, vec![PathBuf::from("/p/src/b.rs")]);

        let mut keys = Vec::new();
        let completed = fx
            .engine
            .process_all_keys(&handle, ReadPolicy::RequireSmart, &mut |k| {
                keys.push(k.clone());
                true
            })
            .unwrap();
        assert!(completed);
        assert_eq!(keys.len(), 2);

        let stats = fx.engine.stats(handle.id()).unwrap();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.target_count, 1);
        assert!(stats.last_updated.is_some());
    }

    #[test]
    fn test_reads_gated_by_dumb_mode() {
        let fx = Fixture::new();
        let handle = fx.engine.register_index(MapKind::new(1)).unwrap();

        let (release, gate) = crossbeam_channel::bounded::<()>(1);
        fx.engine
            .queue_task(Box::new(crate::coordinator::ClosureTask::new(
                "pin",
                move |cancel| {
                    while !cancel.is_cancelled()
                        && gate.recv_timeout(std::time::Duration::from_millis(10)).is_err()
                    {}
                    Ok(())
                },
            )))
            .unwrap();

        let key = "k".to_string();
        let err = fx
            .engine
            .get_values(&handle, &key, &TargetScope::All, ReadPolicy::RequireSmart)
            .unwrap_err();
        assert!(matches!(err, StrataError::DumbMode));

        // Explicit opt-in reads stale data instead.
        let values = fx
            .engine
            .get_values(&handle, &key, &TargetScope::All, ReadPolicy::TolerateStale)
            .unwrap();
        assert!(values.is_empty());

        release.send(()).unwrap();
        fx.engine.wait_for_smart().unwrap();
        fx.engine
            .get_values(&handle, &key, &TargetScope::All, ReadPolicy::RequireSmart)
            .unwrap();
    }

    #[test]
    fn test_rebuild_request_wipes_and_reprocesses() {
        let fx = Fixture::new();
        let kind = MapKind::new(1);
        fx.add_file(&kind, "/p/src/a.rs", 1);
        let handle = fx.engine.register_index(kind).unwrap();
        let target = fx.engine.targets().register("src");
        let cancel = CancelToken::new();

        let items = || {
            fx.engine
                .collect_target_items(target, &fx.root, &cancel)
                .unwrap()
        };
        fx.engine
            .update_index(
                &handle,
                &[items()],
                UpdateMode::Apply,
                &crate::update::NoRefresh,
                &cancel,
            )
            .unwrap();

        fx.engine.request_rebuild(handle.id()).unwrap();
        assert!(fx.engine.needs_rebuild(handle.id()));

        // Status probes report dirty while a rebuild is pending.
        let err = fx
            .engine
            .update_index(
                &handle,
                &[items()],
                UpdateMode::CheckOnly,
                &crate::update::NoRefresh,
                &cancel,
            )
            .unwrap_err();
        assert!(err.is_cancelled());

        let outcome = fx
            .engine
            .update_index(
                &handle,
                &[items()],
                UpdateMode::Apply,
                &crate::update::NoRefresh,
                &cancel,
            )
            .unwrap();
        assert_eq!(outcome.processed, 1);
        assert!(!fx.engine.needs_rebuild(handle.id()));
    }

    #[test]
    fn test_version_bump_flags_rebuild_on_register() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.general.storage_path = Some(dir.path().to_path_buf());

        {
            let engine = IndexEngine::new(config.clone()).unwrap();
            let kind = MapKind::new(1);
            let tree = FileTree::new();
            let file = tree.file("/x");
            kind.set_source(file.path(), 1);
            let handle = engine.register_index(kind).unwrap();
            let target = engine.targets().register("t");
            let cancel = CancelToken::new();
            engine
                .update_index(
                    &handle,
                    &[TargetItems {
                        target,
                        files: vec![file],
                    }],
                    UpdateMode::Apply,
                    &crate::update::NoRefresh,
                    &cancel,
                )
                .unwrap();
            assert!(!engine.needs_rebuild(handle.id()));
            engine.shutdown();
        }

        let engine = IndexEngine::new(config).unwrap();
        let handle = engine.register_index(MapKind::new(2)).unwrap();
        assert!(engine.needs_rebuild(handle.id()));
        assert_eq!(engine.stats(handle.id()).unwrap().entry_count, 0);
    }

    #[test]
    fn test_change_tracking_through_engine() {
        let fx = Fixture::new();
        let kind = MapKind::new(1);
        let file = fx.add_file(&kind, "/p/src/a.rs", 1);
        let handle = fx.engine.register_index(kind).unwrap();
        let target = fx.engine.targets().register("src");
        let cancel = CancelToken::new();

        let items = fx
            .engine
            .collect_target_items(target, &fx.root, &cancel)
            .unwrap();
        fx.engine
            .update_index(
                &handle,
                &[items],
                UpdateMode::Apply,
                &crate::update::NoRefresh,
                &cancel,
            )
            .unwrap();

        handle.kind().set_source(file.path(), 2);
        fx.engine
            .notify_after(&[ChangeEvent::content_changed(file.clone())]);
        assert_eq!(fx.engine.pending_changes(), 1);

        let changes = fx.engine.drain_changes();
        let outcome = fx
            .engine
            .apply_changes(
                &handle,
                target,
                &changes,
                &crate::update::NoRefresh,
                &cancel,
            )
            .unwrap();
        assert_eq!(outcome.processed, 1);

        let values = fx
            .engine
            .get_values(
                &handle,
                &"/p/src/a.rs".to_string(),
                &TargetScope::All,
                ReadPolicy::RequireSmart,
            )
            .unwrap();
        assert_eq!(values, vec!["out-2".to_string()]);
    }

    #[test]
    fn test_out_of_set_changes_are_filtered() {
        let fx = Fixture::new();
        let handle = fx.engine.register_index(MapKind::new(1)).unwrap();
        let _ = &handle;

        fx.engine.notify_after(&[ChangeEvent::content_changed(
            fx.tree.file("/elsewhere/z.rs"),
        )]);
        let changes = fx.engine.drain_changes();
        assert!(changes.modified.is_empty());
    }
}
