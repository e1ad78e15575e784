//! Per-(index, target) update orchestration.
//!
//! One processing cycle compares the live item set against the persisted
//! `(source, output)` pairs and drives the externally supplied extraction
//! logic:
//!
//! 1. collect targets that exist in storage but not in the live registry;
//! 2. remove them, handing the full obsolete-entry list to the kind for
//!    bookkeeping first (read lock on the target registry held so the
//!    live list cannot shift underneath);
//! 3. diff live items: key and stored-entry lookup under the read lock,
//!    input fingerprints computed outside any lock, in parallel;
//! 4. hand the "to process" and "to remove" sets to the kind;
//! 5. commit: delete removed keys, run filesystem refreshes, persist the
//!    fresh `(source, output)` pairs. Each key-write is independently
//!    durable; a mid-commit I/O failure leaves earlier writes intact and
//!    surfaces as an error requiring a rebuild.

use crate::cancel::CancelToken;
use crate::error::{Result, StrataError};
use crate::storage::{IndexStorage, KeyDescriptor};
use crate::types::TargetId;
use crate::vfs::FileNode;
use parking_lot::{RwLock, RwLockReadGuard};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// One unit of indexable work: a file within a target.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub file: Arc<FileNode>,
    pub target: TargetId,
}

/// The pluggable extraction logic for one index, registered explicitly
/// with the engine. Key equality/hash, fingerprinting and the actual
/// processing all live behind this trait; serialization of key and states
/// rides on serde + bincode like every other persisted record.
pub trait IndexKind: Send + Sync + 'static {
    type Key: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type SourceState: Serialize + DeserializeOwned + PartialEq + Clone + Send + Sync + 'static;
    type OutputState: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Registered index name; also names the storage directory.
    fn name(&self) -> &str;

    /// Bumping this wipes the on-disk data and forces a full rebuild.
    fn version(&self) -> u32;

    /// Equality/hash strategy for stored keys.
    fn key_descriptor(&self) -> Arc<dyn KeyDescriptor<Self::Key>>;

    /// The key an item contributes. Cheap; called under the target lock.
    fn key_of(&self, item: &WorkItem) -> Self::Key;

    /// Fingerprint the item's current input. May be slow; never called
    /// while a lock is held.
    fn source_state(&self, item: &WorkItem) -> Result<Self::SourceState>;

    /// Is the stored output descriptor still valid for the item's current
    /// artifact?
    fn output_up_to_date(&self, item: &WorkItem, stored: &Self::OutputState) -> bool;

    /// Run external processing over the diffed sets.
    fn process(&self, request: ProcessRequest<'_, Self>) -> Result<ProcessOutcome<Self>>;

    /// Bookkeeping hook before a vanished target's entries are deleted
    /// (e.g., removing generated artifacts).
    fn discard(&self, target: TargetId, entries: &[(Self::Key, Self::OutputState)]) -> Result<()> {
        let _ = (target, entries);
        Ok(())
    }
}

/// An item the diff pass decided to reprocess, with its fingerprint
/// already computed.
pub struct PendingItem<D: IndexKind + ?Sized> {
    pub item: WorkItem,
    pub key: D::Key,
    pub source: D::SourceState,
}

/// Input to [`IndexKind::process`].
pub struct ProcessRequest<'a, D: IndexKind + ?Sized> {
    pub to_process: &'a [PendingItem<D>],
    pub to_remove: &'a [(TargetId, D::Key)],
}

/// What external processing reports back.
pub struct ProcessOutcome<D: IndexKind + ?Sized> {
    /// Fully processed items: index into `to_process` plus the fresh
    /// output state to persist.
    pub processed: Vec<(usize, D::OutputState)>,

    /// Files the caller should refresh in its file-system layer
    pub files_to_refresh: Vec<PathBuf>,

    /// Directories the caller should refresh
    pub dirs_to_refresh: Vec<PathBuf>,
}

impl<D: IndexKind + ?Sized> Default for ProcessOutcome<D> {
    fn default() -> Self {
        ProcessOutcome {
            processed: Vec::new(),
            files_to_refresh: Vec::new(),
            dirs_to_refresh: Vec::new(),
        }
    }
}

/// Applies the refresh side effects collected by a processing cycle.
pub trait Refresher: Send + Sync {
    fn refresh_files(&self, files: &[PathBuf]);
    fn refresh_dirs(&self, dirs: &[PathBuf]);
}

/// Refresher that does nothing; for engines whose file-system layer has
/// no refresh notion.
pub struct NoRefresh;

impl Refresher for NoRefresh {
    fn refresh_files(&self, _files: &[PathBuf]) {}
    fn refresh_dirs(&self, _dirs: &[PathBuf]) {}
}

/// The live set of targets. Storage entries whose target vanished from
/// this registry are collected as obsolete on the next cycle.
pub struct TargetRegistry {
    map: RwLock<HashMap<TargetId, String>>,
    next_id: AtomicU32,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetRegistry {
    pub fn new() -> Self {
        TargetRegistry {
            map: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Register a target and get its id.
    pub fn register(&self, name: impl Into<String>) -> TargetId {
        let id = TargetId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.map.write().insert(id, name.into());
        id
    }

    /// Drop a target from the live set; its stored entries become
    /// obsolete.
    pub fn remove(&self, target: TargetId) {
        self.map.write().remove(&target);
    }

    pub fn contains(&self, target: TargetId) -> bool {
        self.map.read().contains_key(&target)
    }

    pub fn name_of(&self, target: TargetId) -> Option<String> {
        self.map.read().get(&target).cloned()
    }

    pub fn ids(&self) -> Vec<TargetId> {
        let mut ids: Vec<_> = self.map.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Shared lock over the live set, held across obsolete collection and
    /// diffing so the list cannot change underneath them.
    pub fn guard(&self) -> RwLockReadGuard<'_, HashMap<TargetId, String>> {
        self.map.read()
    }
}

/// Whether a cycle applies its findings or only reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Process and commit.
    Apply,

    /// Abort with a cancellation signal as soon as any work is found;
    /// nothing is applied.
    CheckOnly,
}

/// Counters from one completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub processed: usize,
    pub removed: usize,
    pub obsolete_targets: usize,
}

/// The items of one target for a cycle.
pub struct TargetItems {
    pub target: TargetId,
    pub files: Vec<Arc<FileNode>>,
}

/// Orchestrates one processing cycle for a single index.
pub struct Updater<'a, D: IndexKind> {
    kind: &'a D,
    store: &'a IndexStorage<D::Key, D::SourceState, D::OutputState>,
    targets: &'a TargetRegistry,
    refresher: &'a dyn Refresher,
    cancel: &'a CancelToken,
}

struct Candidate<D: IndexKind> {
    item: WorkItem,
    key: D::Key,
    stored: Option<crate::types::StoredEntry<D::SourceState, D::OutputState>>,
}

impl<'a, D: IndexKind> Updater<'a, D> {
    pub fn new(
        kind: &'a D,
        store: &'a IndexStorage<D::Key, D::SourceState, D::OutputState>,
        targets: &'a TargetRegistry,
        refresher: &'a dyn Refresher,
        cancel: &'a CancelToken,
    ) -> Self {
        Updater {
            kind,
            store,
            targets,
            refresher,
            cancel,
        }
    }

    /// Run one full processing cycle over `live`.
    ///
    /// Any I/O failure aborts the whole run and propagates; the caller is
    /// expected to request a rebuild before trusting further reads.
    /// Cancellation aborts without committing partial diff decisions.
    pub fn run(&self, live: &[TargetItems], mode: UpdateMode) -> Result<UpdateOutcome> {
        let mut outcome = UpdateOutcome::default();

        let obsolete = self.collect_obsolete(live);

        if mode == UpdateMode::Apply {
            self.remove_obsolete(&obsolete, &mut outcome)?;
        }

        let (candidates, to_remove) = self.collect_candidates(live)?;
        let to_process = self.diff(candidates)?;

        if mode == UpdateMode::CheckOnly {
            if !obsolete.is_empty() || !to_process.is_empty() || !to_remove.is_empty() {
                return Err(StrataError::Cancelled);
            }
            return Ok(outcome);
        }

        self.process_and_commit(to_process, to_remove, &mut outcome)?;

        debug!(
            index = %self.kind.name(),
            processed = outcome.processed,
            removed = outcome.removed,
            obsolete_targets = outcome.obsolete_targets,
            "Update cycle finished"
        );
        Ok(outcome)
    }

    /// Apply a merged change set to one target: stored keys of removed
    /// files are dropped, modified files are re-diffed and reprocessed.
    /// This is the incremental counterpart of [`Updater::run`], driven by
    /// the change tracker instead of a full item walk.
    pub fn run_incremental(
        &self,
        target: TargetId,
        changes: &crate::tracker::ChangeSet,
    ) -> Result<UpdateOutcome> {
        let mut outcome = UpdateOutcome::default();
        let descriptor = self.kind.key_descriptor();

        let mut to_remove: Vec<(TargetId, D::Key)> = Vec::new();
        for file in &changes.removed {
            self.cancel.checkpoint()?;
            for key in self.store.keys_of_file(target, file.path()) {
                to_remove.push((target, key));
            }
        }

        let candidates = {
            let guard = self.targets.guard();
            if !guard.contains_key(&target) {
                return Ok(outcome);
            }
            let mut candidates = Vec::new();
            for file in &changes.modified {
                self.cancel.checkpoint()?;
                if !file.is_valid() {
                    continue;
                }
                let item = WorkItem {
                    file: file.clone(),
                    target,
                };
                let key = self.kind.key_of(&item);
                // Keys this file produced earlier but no longer does.
                for old_key in self.store.keys_of_file(target, file.path()) {
                    if !descriptor.key_eq(&old_key, &key) {
                        to_remove.push((target, old_key));
                    }
                }
                let stored = self.store.get(target, &key);
                candidates.push(Candidate { item, key, stored });
            }
            candidates
        };

        let to_process = self.diff(candidates)?;
        self.process_and_commit(to_process, to_remove, &mut outcome)?;
        Ok(outcome)
    }

    /// Status probe: true if a cycle would find nothing to do.
    pub fn is_up_to_date(&self, live: &[TargetItems]) -> Result<bool> {
        match self.run(live, UpdateMode::CheckOnly) {
            Ok(_) => Ok(true),
            Err(e) if e.is_cancelled() && !self.cancel.is_cancelled() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn collect_obsolete(&self, live: &[TargetItems]) -> Vec<TargetId> {
        let guard = self.targets.guard();
        let selected: HashSet<TargetId> = live.iter().map(|t| t.target).collect();
        self.store
            .targets()
            .into_iter()
            .filter(|t| !guard.contains_key(t) && !selected.contains(t))
            .collect()
    }

    fn remove_obsolete(&self, obsolete: &[TargetId], outcome: &mut UpdateOutcome) -> Result<()> {
        if obsolete.is_empty() {
            return Ok(());
        }
        let _guard = self.targets.guard();
        for &target in obsolete {
            self.cancel.checkpoint()?;
            let pairs: Vec<(D::Key, D::OutputState)> = self
                .store
                .entries_of(target)
                .into_iter()
                .map(|(key, entry)| (key, entry.output))
                .collect();
            self.kind.discard(target, &pairs)?;
            for (key, _) in &pairs {
                self.store.remove(target, key)?;
                outcome.removed += 1;
            }
            outcome.obsolete_targets += 1;
            debug!(index = %self.kind.name(), target = %target, entries = pairs.len(), "Removed obsolete target");
        }
        Ok(())
    }

    /// Gather keys and stored entries under the target read lock, plus
    /// stored keys no longer produced by any current item.
    #[allow(clippy::type_complexity)]
    fn collect_candidates(
        &self,
        live: &[TargetItems],
    ) -> Result<(Vec<Candidate<D>>, Vec<(TargetId, D::Key)>)> {
        let descriptor = self.kind.key_descriptor();
        let guard = self.targets.guard();

        let mut candidates = Vec::new();
        let mut to_remove = Vec::new();

        for target_items in live {
            if !guard.contains_key(&target_items.target) {
                continue;
            }
            let mut produced: Vec<D::Key> = Vec::new();
            for file in &target_items.files {
                self.cancel.checkpoint()?;
                if !file.is_valid() {
                    continue;
                }
                let item = WorkItem {
                    file: file.clone(),
                    target: target_items.target,
                };
                let key = self.kind.key_of(&item);
                let stored = self.store.get(target_items.target, &key);
                produced.push(key.clone());
                candidates.push(Candidate { item, key, stored });
            }

            self.store
                .for_each_key_of(target_items.target, &mut |stored_key| {
                    if !produced.iter().any(|p| descriptor.key_eq(p, stored_key)) {
                        to_remove.push((target_items.target, stored_key.clone()));
                    }
                    true
                });
        }
        Ok((candidates, to_remove))
    }

    /// Fingerprint candidates without holding any lock and keep the stale
    /// ones. A per-file extraction failure is logged and skipped; only
    /// cancellation aborts the pass.
    fn diff(&self, candidates: Vec<Candidate<D>>) -> Result<Vec<PendingItem<D>>> {
        let fingerprints: Vec<Option<D::SourceState>> = candidates
            .par_iter()
            .map(|candidate| {
                self.cancel.checkpoint()?;
                match self.kind.source_state(&candidate.item) {
                    Ok(state) => Ok(Some(state)),
                    Err(e) if e.is_cancelled() => Err(e),
                    Err(e) => {
                        warn!(
                            index = %self.kind.name(),
                            file = %candidate.item.file,
                            error = %e,
                            "Fingerprinting failed, skipping file"
                        );
                        Ok(None)
                    }
                }
            })
            .collect::<Result<_>>()?;

        let mut to_process = Vec::new();
        for (candidate, fingerprint) in candidates.into_iter().zip(fingerprints) {
            let Some(source) = fingerprint else { continue };
            let stale = match &candidate.stored {
                None => true,
                Some(entry) => {
                    entry.source != source
                        || !self.kind.output_up_to_date(&candidate.item, &entry.output)
                }
            };
            if stale {
                to_process.push(PendingItem {
                    item: candidate.item,
                    key: candidate.key,
                    source,
                });
            }
        }
        Ok(to_process)
    }

    fn process_and_commit(
        &self,
        to_process: Vec<PendingItem<D>>,
        to_remove: Vec<(TargetId, D::Key)>,
        outcome: &mut UpdateOutcome,
    ) -> Result<()> {
        if to_process.is_empty() && to_remove.is_empty() {
            return Ok(());
        }
        self.cancel.checkpoint()?;
        let result = self.kind.process(ProcessRequest {
            to_process: &to_process,
            to_remove: &to_remove,
        })?;
        self.commit(&to_process, &to_remove, result, outcome)
    }

    fn commit(
        &self,
        to_process: &[PendingItem<D>],
        to_remove: &[(TargetId, D::Key)],
        result: ProcessOutcome<D>,
        outcome: &mut UpdateOutcome,
    ) -> Result<()> {
        for (target, key) in to_remove {
            self.store.remove(*target, key)?;
            outcome.removed += 1;
        }

        self.refresher.refresh_files(&result.files_to_refresh);
        self.refresher.refresh_dirs(&result.dirs_to_refresh);

        for (index, output) in result.processed {
            let pending = match to_process.get(index) {
                Some(pending) => pending,
                None => {
                    return Err(StrataError::Internal(format!(
                        "processed item {} out of range",
                        index
                    )))
                }
            };
            self.store.put(
                pending.item.target,
                pending.item.file.path(),
                pending.key.clone(),
                pending.source.clone(),
                output,
            )?;
            outcome.processed += 1;
        }
        Ok(())
    }
}
