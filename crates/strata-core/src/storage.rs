//! Persistent key-value storage for one index.
//!
//! Each index owns a directory named after its lower-cased name, holding:
//!
//! ```text
//! <name>          main entry log: (target, key) -> (source, output)
//! <name>_inputs   forward index log: (target, file) -> keys
//! <name>.ver      index version marker (u32)
//! ```
//!
//! Both logs are append-only. A fixed header (magic + log format version)
//! is followed by length-prefixed records:
//!
//! ```text
//! [Record]
//!   - Payload length: u32 LE
//!   - CRC32 of payload: u32 LE
//!   - Payload: lz4-compressed bincode
//! ```
//!
//! Replay on open rebuilds the in-memory maps. A torn tail record (crash
//! mid-append) is detected by the length/checksum framing and the log is
//! truncated at the last intact record; anything deeper (bad magic, a
//! checksummed record that fails to decode) is corruption. Construction
//! failure due to corruption wipes the store and retries exactly once; a
//! second failure is fatal.
//!
//! `wipe()` closes the store, deletes every backing file by name prefix,
//! and only then reopens a fresh one. A missing backing file on open is
//! therefore a crash mid-wipe and is treated as already-wiped, never as
//! corrupt data.

use crate::error::{Result, StrataError};
use crate::types::{StoredEntry, TargetId, TargetScope};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic bytes at the start of every log file
pub const MAGIC: &[u8; 4] = b"STRI";
/// Current log format version
pub const LOG_FORMAT_VERSION: u32 = 1;

/// Pluggable equality/hash strategy for index keys.
///
/// Store lookups collide (and the later write wins) iff both the target
/// and the key match under this descriptor; nothing else about the key
/// participates in identity.
pub trait KeyDescriptor<K>: Send + Sync {
    fn key_eq(&self, a: &K, b: &K) -> bool;
    fn key_hash(&self, key: &K) -> u64;
}

/// Default descriptor delegating to the key's own `Hash`/`Eq`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashedKey;

impl<K: Hash + Eq> KeyDescriptor<K> for HashedKey {
    fn key_eq(&self, a: &K, b: &K) -> bool {
        a == b
    }

    fn key_hash(&self, key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }
}

/// Type-erased view of a store, used by the engine for lifecycle work.
pub trait AnyStorage: Send + Sync {
    fn wipe(&self) -> Result<()>;
    fn flush(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn entry_count(&self) -> usize;
    fn target_count(&self) -> usize;
    fn was_wiped(&self) -> bool;
}

#[derive(Debug, Serialize, Deserialize)]
enum MainRecord<K, S, O> {
    Put {
        target: u32,
        key: K,
        source: S,
        output: O,
    },
    Remove {
        target: u32,
        key: K,
    },
}

#[derive(Debug, Serialize, Deserialize)]
enum InputRecord<K> {
    Add {
        target: u32,
        file: PathBuf,
        key: K,
    },
    Remove {
        target: u32,
        file: PathBuf,
        key: K,
    },
}

struct Slot<K, S, O> {
    key: K,
    file: PathBuf,
    entry: StoredEntry<S, O>,
}

struct StoreInner<K, S, O> {
    buckets: HashMap<(u32, u64), Vec<Slot<K, S, O>>>,
    forward: HashMap<(u32, PathBuf), Vec<K>>,
    entry_count: usize,
    main: File,
    inputs: File,
}

enum State<K, S, O> {
    Open(StoreInner<K, S, O>),
    Closed,
}

/// Crash-safe on-disk map from `(target, key)` to `(source, output)` for
/// one index, plus the forward `(target, file) -> keys` direction.
pub struct IndexStorage<K, S, O> {
    name: String,
    dir: PathBuf,
    index_version: u32,
    descriptor: Arc<dyn KeyDescriptor<K>>,
    state: RwLock<State<K, S, O>>,
    wiped_at_open: AtomicBool,
}

impl<K, S, O> IndexStorage<K, S, O>
where
    K: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open (or create) the store for `name` under `root`, enforcing the
    /// index version marker.
    ///
    /// A marker mismatch wipes the backing files before any data is
    /// read: a forced full rebuild, not an error. Corrupt files trigger
    /// one automatic wipe-and-retry; a second failure is fatal.
    pub fn open(
        root: &Path,
        name: &str,
        index_version: u32,
        descriptor: Arc<dyn KeyDescriptor<K>>,
    ) -> Result<Self> {
        let lower = name.to_lowercase();
        let dir = root.join(&lower);
        fs::create_dir_all(&dir)?;

        let mut wiped = false;

        let marker_path = dir.join(format!("{}.ver", lower));
        let mut marker_intact = false;
        match read_marker(&marker_path) {
            Some(found) if found == index_version => marker_intact = true,
            Some(found) => {
                info!(
                    index = %name,
                    found = found,
                    expected = index_version,
                    "Index version changed, wiping storage"
                );
                delete_by_prefix(&dir, &lower)?;
                wiped = true;
            }
            None => {
                // No marker: either a first open or a crash mid-wipe.
                if delete_by_prefix(&dir, &lower)? > 0 {
                    wiped = true;
                }
            }
        }

        let main_path = dir.join(&lower);
        let inputs_path = dir.join(format!("{}_inputs", lower));
        if marker_intact && !(main_path.exists() && inputs_path.exists()) {
            // A wipe got interrupted before the marker went: whatever logs
            // survived are already-wiped leftovers, not corrupt data.
            if main_path.exists() || inputs_path.exists() {
                warn!(index = %name, "Backing file missing, treating store as wiped");
                delete_by_prefix(&dir, &lower)?;
            }
            wiped = true;
        }

        let inner = match Self::load(&dir, &lower, descriptor.as_ref()) {
            Ok(inner) => inner,
            Err(first)
                if matches!(
                    first,
                    StrataError::StoreCorrupted { .. } | StrataError::FormatVersionMismatch { .. }
                ) =>
            {
                warn!(index = %name, error = %first, "Store corrupted, wiping and retrying once");
                delete_by_prefix(&dir, &lower)?;
                wiped = true;
                Self::load(&dir, &lower, descriptor.as_ref()).map_err(|second| {
                    StrataError::StoreUnusable {
                        name: name.to_string(),
                        reason: second.to_string(),
                    }
                })?
            }
            Err(other) => return Err(other),
        };

        fs::write(&marker_path, index_version.to_le_bytes())?;

        debug!(index = %name, entries = inner.entry_count, wiped = wiped, "Store opened");

        Ok(IndexStorage {
            name: name.to_string(),
            dir,
            index_version,
            descriptor,
            state: RwLock::new(State::Open(inner)),
            wiped_at_open: AtomicBool::new(wiped),
        })
    }

    /// True if opening had to discard previous contents (version change,
    /// corruption, or interrupted wipe); the owning index needs a full
    /// rebuild.
    pub fn was_wiped(&self) -> bool {
        self.wiped_at_open.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch the stored entry for `(target, key)`.
    pub fn get(&self, target: TargetId, key: &K) -> Option<StoredEntry<S, O>> {
        let state = self.state.read();
        let inner = match &*state {
            State::Open(inner) => inner,
            State::Closed => return None,
        };
        let bucket = inner
            .buckets
            .get(&(target.as_u32(), self.descriptor.key_hash(key)))?;
        bucket
            .iter()
            .find(|slot| self.descriptor.key_eq(&slot.key, key))
            .map(|slot| slot.entry.clone())
    }

    /// Persist `(source, output)` for `(target, key)`, recording `file` as
    /// the originating input. The write is durable on return; a later put
    /// for a descriptor-equal key wins.
    pub fn put(
        &self,
        target: TargetId,
        file: &Path,
        key: K,
        source: S,
        output: O,
    ) -> Result<()> {
        let mut state = self.state.write();
        let inner = open_mut(&mut state, &self.name)?;

        let record = MainRecord::<K, S, O>::Put {
            target: target.as_u32(),
            key: key.clone(),
            source: source.clone(),
            output: output.clone(),
        };
        append_record(&mut inner.main, &bincode::serialize(&record)?)?;

        let hash = self.descriptor.key_hash(&key);
        let bucket = inner
            .buckets
            .entry((target.as_u32(), hash))
            .or_default();
        let entry = StoredEntry::new(source, output);

        let mut displaced_file = None;
        match bucket
            .iter_mut()
            .find(|slot| self.descriptor.key_eq(&slot.key, &key))
        {
            Some(slot) => {
                if slot.file != file {
                    displaced_file = Some(std::mem::replace(
                        &mut slot.file,
                        file.to_path_buf(),
                    ));
                }
                slot.entry = entry;
            }
            None => {
                bucket.push(Slot {
                    key: key.clone(),
                    file: file.to_path_buf(),
                    entry,
                });
                inner.entry_count += 1;
            }
        }

        if let Some(old_file) = displaced_file {
            remove_forward(inner, self.descriptor.as_ref(), target, &old_file, &key)?;
        }

        let fwd = inner
            .forward
            .entry((target.as_u32(), file.to_path_buf()))
            .or_default();
        if !fwd.iter().any(|k| self.descriptor.key_eq(k, &key)) {
            let input = InputRecord::Add {
                target: target.as_u32(),
                file: file.to_path_buf(),
                key: key.clone(),
            };
            append_record(&mut inner.inputs, &bincode::serialize(&input)?)?;
            fwd.push(key);
        }
        Ok(())
    }

    /// Delete the entry for `(target, key)`, if present.
    pub fn remove(&self, target: TargetId, key: &K) -> Result<()> {
        let mut state = self.state.write();
        let inner = open_mut(&mut state, &self.name)?;

        let hash = self.descriptor.key_hash(key);
        let Some(bucket) = inner.buckets.get_mut(&(target.as_u32(), hash)) else {
            return Ok(());
        };
        let Some(pos) = bucket
            .iter()
            .position(|slot| self.descriptor.key_eq(&slot.key, key))
        else {
            return Ok(());
        };

        let record = MainRecord::<K, S, O>::Remove {
            target: target.as_u32(),
            key: key.clone(),
        };
        append_record(&mut inner.main, &bincode::serialize(&record)?)?;

        let slot = bucket.swap_remove(pos);
        if bucket.is_empty() {
            inner.buckets.remove(&(target.as_u32(), hash));
        }
        inner.entry_count -= 1;

        remove_forward(inner, self.descriptor.as_ref(), target, &slot.file, key)
    }

    /// Invoke `predicate` for every key stored under `target`; stops when
    /// it returns `false`. Returns whether iteration ran to completion.
    pub fn for_each_key_of(&self, target: TargetId, predicate: &mut dyn FnMut(&K) -> bool) -> bool {
        let state = self.state.read();
        let inner = match &*state {
            State::Open(inner) => inner,
            State::Closed => return true,
        };
        for ((t, _), bucket) in inner.buckets.iter() {
            if *t != target.as_u32() {
                continue;
            }
            for slot in bucket {
                if !predicate(&slot.key) {
                    return false;
                }
            }
        }
        true
    }

    /// All `(key, entry)` pairs stored under `target`.
    pub fn entries_of(&self, target: TargetId) -> Vec<(K, StoredEntry<S, O>)> {
        let state = self.state.read();
        let inner = match &*state {
            State::Open(inner) => inner,
            State::Closed => return Vec::new(),
        };
        inner
            .buckets
            .iter()
            .filter(|((t, _), _)| *t == target.as_u32())
            .flat_map(|(_, bucket)| bucket.iter())
            .map(|slot| (slot.key.clone(), slot.entry.clone()))
            .collect()
    }

    /// Keys previously produced by `file` under `target` (the forward
    /// index direction).
    pub fn keys_of_file(&self, target: TargetId, file: &Path) -> Vec<K> {
        let state = self.state.read();
        let inner = match &*state {
            State::Open(inner) => inner,
            State::Closed => return Vec::new(),
        };
        inner
            .forward
            .get(&(target.as_u32(), file.to_path_buf()))
            .cloned()
            .unwrap_or_default()
    }

    /// Files whose stored entries include `key`, within `scope`.
    pub fn containing_files(&self, key: &K, scope: &TargetScope) -> Vec<PathBuf> {
        let state = self.state.read();
        let inner = match &*state {
            State::Open(inner) => inner,
            State::Closed => return Vec::new(),
        };
        let mut files: Vec<PathBuf> = inner
            .forward
            .iter()
            .filter(|((t, _), keys)| {
                scope.contains(TargetId(*t))
                    && keys.iter().any(|k| self.descriptor.key_eq(k, key))
            })
            .map(|((_, file), _)| file.clone())
            .collect();
        files.sort();
        files.dedup();
        files
    }

    /// Output states stored for `key` across `scope`.
    pub fn values(&self, key: &K, scope: &TargetScope) -> Vec<O> {
        let state = self.state.read();
        let inner = match &*state {
            State::Open(inner) => inner,
            State::Closed => return Vec::new(),
        };
        let hash = self.descriptor.key_hash(key);
        inner
            .buckets
            .iter()
            .filter(|((t, h), _)| *h == hash && scope.contains(TargetId(*t)))
            .flat_map(|(_, bucket)| bucket.iter())
            .filter(|slot| self.descriptor.key_eq(&slot.key, key))
            .map(|slot| slot.entry.output.clone())
            .collect()
    }

    /// Every key in the store, deduplicated under the descriptor.
    pub fn all_keys(&self) -> Vec<K> {
        let state = self.state.read();
        let inner = match &*state {
            State::Open(inner) => inner,
            State::Closed => return Vec::new(),
        };
        let mut seen: HashMap<u64, Vec<K>> = HashMap::new();
        let mut keys = Vec::new();
        for bucket in inner.buckets.values() {
            for slot in bucket {
                let hash = self.descriptor.key_hash(&slot.key);
                let group = seen.entry(hash).or_default();
                if !group.iter().any(|k| self.descriptor.key_eq(k, &slot.key)) {
                    group.push(slot.key.clone());
                    keys.push(slot.key.clone());
                }
            }
        }
        keys
    }

    /// Targets with at least one stored entry.
    pub fn targets(&self) -> Vec<TargetId> {
        let state = self.state.read();
        let inner = match &*state {
            State::Open(inner) => inner,
            State::Closed => return Vec::new(),
        };
        let mut targets: Vec<TargetId> = inner
            .buckets
            .keys()
            .map(|(t, _)| TargetId(*t))
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    pub fn len(&self) -> usize {
        match &*self.state.read() {
            State::Open(inner) => inner.entry_count,
            State::Closed => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically (from the caller's point of view) replace the store with
    /// an empty one: close, delete every backing file by prefix, reopen.
    pub fn wipe(&self) -> Result<()> {
        let mut state = self.state.write();
        // Close first so file handles are released before deletion.
        *state = State::Closed;

        let lower = self.name.to_lowercase();
        delete_by_prefix(&self.dir, &lower)?;

        let inner = Self::load(&self.dir, &lower, self.descriptor.as_ref())?;
        fs::write(
            self.dir.join(format!("{}.ver", lower)),
            self.index_version.to_le_bytes(),
        )?;
        info!(index = %self.name, "Store wiped");
        *state = State::Open(inner);
        Ok(())
    }

    /// Flush buffered log writes.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.write();
        if let State::Open(inner) = &mut *state {
            inner.main.flush()?;
            inner.inputs.flush()?;
        }
        Ok(())
    }

    /// Flush and detach from the backing files; all subsequent reads see
    /// an empty store and writes fail.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if let State::Open(inner) = &mut *state {
            inner.main.flush()?;
            inner.inputs.flush()?;
        }
        *state = State::Closed;
        Ok(())
    }

    fn load(
        dir: &Path,
        lower: &str,
        descriptor: &dyn KeyDescriptor<K>,
    ) -> Result<StoreInner<K, S, O>> {
        let main_path = dir.join(lower);
        let inputs_path = dir.join(format!("{}_inputs", lower));

        let main_payloads = replay_log(&main_path, lower)?;
        let input_payloads = replay_log(&inputs_path, lower)?;

        let mut buckets: HashMap<(u32, u64), Vec<Slot<K, S, O>>> = HashMap::new();
        let mut forward: HashMap<(u32, PathBuf), Vec<K>> = HashMap::new();
        let mut entry_count = 0usize;

        // Forward records first so Put replay can find owning files.
        for payload in &input_payloads {
            let record: InputRecord<K> = bincode::deserialize(payload)
                .map_err(|e| StrataError::corrupted(lower, format!("forward record: {}", e)))?;
            match record {
                InputRecord::Add { target, file, key } => {
                    let keys = forward.entry((target, file)).or_default();
                    if !keys.iter().any(|k| descriptor.key_eq(k, &key)) {
                        keys.push(key);
                    }
                }
                InputRecord::Remove { target, file, key } => {
                    if let Some(keys) = forward.get_mut(&(target, file.clone())) {
                        keys.retain(|k| !descriptor.key_eq(k, &key));
                        if keys.is_empty() {
                            forward.remove(&(target, file));
                        }
                    }
                }
            }
        }

        for payload in &main_payloads {
            let record: MainRecord<K, S, O> = bincode::deserialize(payload)
                .map_err(|e| StrataError::corrupted(lower, format!("entry record: {}", e)))?;
            match record {
                MainRecord::Put {
                    target,
                    key,
                    source,
                    output,
                } => {
                    let file = forward
                        .iter()
                        .find(|((t, _), keys)| {
                            *t == target && keys.iter().any(|k| descriptor.key_eq(k, &key))
                        })
                        .map(|((_, file), _)| file.clone())
                        .unwrap_or_default();
                    let bucket = buckets
                        .entry((target, descriptor.key_hash(&key)))
                        .or_default();
                    let entry = StoredEntry::new(source, output);
                    match bucket.iter_mut().find(|slot| descriptor.key_eq(&slot.key, &key)) {
                        Some(slot) => {
                            slot.entry = entry;
                            slot.file = file;
                        }
                        None => {
                            bucket.push(Slot { key, file, entry });
                            entry_count += 1;
                        }
                    }
                }
                MainRecord::Remove { target, key } => {
                    let hash = descriptor.key_hash(&key);
                    if let Some(bucket) = buckets.get_mut(&(target, hash)) {
                        if let Some(pos) =
                            bucket.iter().position(|slot| descriptor.key_eq(&slot.key, &key))
                        {
                            bucket.swap_remove(pos);
                            entry_count -= 1;
                        }
                        if bucket.is_empty() {
                            buckets.remove(&(target, hash));
                        }
                    }
                }
            }
        }

        let main = open_log(&main_path)?;
        let inputs = open_log(&inputs_path)?;

        Ok(StoreInner {
            buckets,
            forward,
            entry_count,
            main,
            inputs,
        })
    }
}

impl<K, S, O> AnyStorage for IndexStorage<K, S, O>
where
    K: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn wipe(&self) -> Result<()> {
        IndexStorage::wipe(self)
    }

    fn flush(&self) -> Result<()> {
        IndexStorage::flush(self)
    }

    fn close(&self) -> Result<()> {
        IndexStorage::close(self)
    }

    fn entry_count(&self) -> usize {
        self.len()
    }

    fn target_count(&self) -> usize {
        self.targets().len()
    }

    fn was_wiped(&self) -> bool {
        IndexStorage::was_wiped(self)
    }
}

fn open_mut<'a, K, S, O>(
    state: &'a mut State<K, S, O>,
    name: &str,
) -> Result<&'a mut StoreInner<K, S, O>> {
    match state {
        State::Open(inner) => Ok(inner),
        State::Closed => Err(StrataError::Internal(format!(
            "store '{}' is closed",
            name
        ))),
    }
}

fn remove_forward<K, S, O>(
    inner: &mut StoreInner<K, S, O>,
    descriptor: &dyn KeyDescriptor<K>,
    target: TargetId,
    file: &Path,
    key: &K,
) -> Result<()>
where
    K: Serialize + Clone,
{
    let slot_key = (target.as_u32(), file.to_path_buf());
    let Some(keys) = inner.forward.get_mut(&slot_key) else {
        return Ok(());
    };
    let before = keys.len();
    keys.retain(|k| !descriptor.key_eq(k, key));
    if keys.len() == before {
        return Ok(());
    }
    if keys.is_empty() {
        inner.forward.remove(&slot_key);
    }
    let record = InputRecord::Remove {
        target: target.as_u32(),
        file: file.to_path_buf(),
        key: key.clone(),
    };
    append_record(&mut inner.inputs, &bincode::serialize(&record)?)
}

/// Open a log for appending, writing the header if the file is new.
fn open_log(path: &Path) -> Result<File> {
    let is_new = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if is_new {
        file.write_all(MAGIC)?;
        file.write_all(&LOG_FORMAT_VERSION.to_le_bytes())?;
        file.flush()?;
    }
    Ok(file)
}

/// Append one length-prefixed, checksummed, lz4-compressed record.
fn append_record(file: &mut File, payload: &[u8]) -> Result<()> {
    let compressed = lz4_flex::compress_prepend_size(payload);
    let crc = crc32fast::hash(&compressed);
    file.write_all(&(compressed.len() as u32).to_le_bytes())?;
    file.write_all(&crc.to_le_bytes())?;
    file.write_all(&compressed)?;
    file.flush()?;
    Ok(())
}

/// Replay a log file, returning the decompressed record payloads.
///
/// A torn tail (truncated frame or checksum mismatch at the end) is
/// recovered by truncating the file back to the last intact record; a
/// record that checksums correctly but fails to decompress is corruption.
fn replay_log(path: &Path, name: &str) -> Result<Vec<Vec<u8>>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    if data.len() < 8 {
        return Err(StrataError::corrupted(name, "log shorter than header"));
    }
    if &data[0..4] != MAGIC {
        return Err(StrataError::corrupted(name, "invalid magic bytes"));
    }
    let format = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if format != LOG_FORMAT_VERSION {
        return Err(StrataError::FormatVersionMismatch {
            found: format,
            expected: LOG_FORMAT_VERSION,
        });
    }

    let mut payloads = Vec::new();
    let mut cursor = 8usize;
    let mut intact_end = cursor;

    while cursor < data.len() {
        if cursor + 8 > data.len() {
            break; // torn frame header
        }
        let len = u32::from_le_bytes([
            data[cursor],
            data[cursor + 1],
            data[cursor + 2],
            data[cursor + 3],
        ]) as usize;
        let crc = u32::from_le_bytes([
            data[cursor + 4],
            data[cursor + 5],
            data[cursor + 6],
            data[cursor + 7],
        ]);
        let body_start = cursor + 8;
        if body_start + len > data.len() {
            break; // torn record body
        }
        let body = &data[body_start..body_start + len];
        if crc32fast::hash(body) != crc {
            break; // torn write detected by checksum
        }
        let payload = lz4_flex::decompress_size_prepended(body)
            .map_err(|e| StrataError::corrupted(name, format!("decompression failed: {}", e)))?;
        payloads.push(payload);
        cursor = body_start + len;
        intact_end = cursor;
    }

    if intact_end < data.len() {
        warn!(
            path = %path.display(),
            dropped = data.len() - intact_end,
            "Truncating torn log tail"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(intact_end as u64)?;
    }

    Ok(payloads)
}

fn read_marker(path: &Path) -> Option<u32> {
    let bytes = fs::read(path).ok()?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

/// Delete every file in `dir` whose name starts with `prefix`; returns how
/// many were removed.
fn delete_by_prefix(dir: &Path, prefix: &str) -> Result<usize> {
    let mut removed = 0;
    if !dir.exists() {
        return Ok(0);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(prefix) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}
