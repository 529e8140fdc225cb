//! Validation result store
//!
//! `CacheStore` keeps results in memory behind a single mutex and mirrors
//! them to disk through the background writer in [`persist`]. The lock is
//! never held across disk I/O: operations that need the disk queue work while
//! holding the lock (so writes and removals stay ordered) and do the I/O
//! after releasing it.
//!
//! Lookups check, in order, the content hash, the entry age, and the
//! validator version. Memory is bounded by `max_size_bytes`; when a write
//! pushes the total over budget, resident entries are dropped oldest
//! `created_at` first. Dropped entries that have a persisted copy stay known
//! to the invalidation index and are read back on the next lookup.
//!
//! [`persist`]: crate::cache::persist

use crate::cache::entry::{CacheEntry, EntryHeader, Metadata, Staleness};
use crate::cache::index::InvalidationIndex;
use crate::cache::key::{CacheKey, ContentHash};
use crate::cache::persist::{ColdRead, DiskStore, PersistOp};
use crate::cache::stats::{CacheStats, MaintenanceReport};
use crate::config::{CacheConfig, Config, ConfigManager, PathMatch};
use crate::error::{ModcheckError, ModcheckResult};
use crate::package::PackageId;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Values the cache can hold.
///
/// `clone()` must yield an independent copy: callers are free to mutate what
/// a lookup returns.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Store settings resolved from configuration
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Directory for persisted entries, `None` for memory-only
    pub dir: Option<PathBuf>,
    /// Maximum entry age
    pub max_age: Option<Duration>,
    /// In-memory byte budget
    pub max_size_bytes: u64,
    /// On-disk byte budget (0 = unbounded)
    pub max_disk_bytes: u64,
    /// Gzip persisted entries
    pub compress: bool,
    /// Bound on a cold read
    pub disk_read_timeout: Duration,
    /// Path comparison for invalidation
    pub path_match: PathMatch,
}

impl StoreOptions {
    /// Resolve options, including the cache directory, from configuration
    pub fn from_config(config: &Config) -> Self {
        let mut options = Self::from_cache_config(&config.cache);
        if config.cache.persistent {
            options.dir = Some(ConfigManager::cache_dir(config));
        }
        options
    }

    /// Memory-only options with the given budget
    pub fn memory_only(max_size_bytes: u64) -> Self {
        Self {
            max_size_bytes,
            ..Self::default()
        }
    }

    /// Persist entries under `dir`
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Override the maximum entry age
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    fn from_cache_config(cache: &CacheConfig) -> Self {
        Self {
            dir: cache.dir.clone().filter(|_| cache.persistent),
            max_age: cache.max_age(),
            max_size_bytes: cache.max_size_bytes,
            max_disk_bytes: cache.max_disk_bytes,
            compress: cache.compress,
            disk_read_timeout: cache.disk_read_timeout(),
            path_match: cache.path_match,
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        let cache = CacheConfig {
            persistent: false,
            ..CacheConfig::default()
        };
        Self::from_cache_config(&cache)
    }
}

struct Slot<R> {
    header: EntryHeader,
    seq: u64,
    /// `None` while only the persisted copy exists
    result: Option<R>,
    on_disk: bool,
}

impl<R> Slot<R> {
    fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.header.created_at, self.seq)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    invalidations: u64,
    writes: u64,
    evictions: u64,
    disk_reads: u64,
}

struct Inner<R> {
    slots: HashMap<CacheKey, Slot<R>>,
    index: InvalidationIndex,
    /// Resident entries by creation, oldest first
    resident: BTreeMap<(DateTime<Utc>, u64), CacheKey>,
    memory_bytes: u64,
    next_seq: u64,
    counters: Counters,
}

impl<R> Inner<R> {
    fn new(mode: PathMatch) -> Self {
        Self {
            slots: HashMap::new(),
            index: InvalidationIndex::new(mode),
            resident: BTreeMap::new(),
            memory_bytes: 0,
            next_seq: 0,
            counters: Counters::default(),
        }
    }

    /// Add a slot for a key that is not present
    fn insert(&mut self, header: EntryHeader, result: Option<R>, on_disk: bool) {
        let key = header.key.clone();
        let seq = self.next_seq;
        self.next_seq += 1;

        self.index.insert(&key, &header.metadata);
        let slot = Slot {
            header,
            seq,
            result,
            on_disk,
        };
        if slot.result.is_some() {
            self.resident.insert(slot.order_key(), key.clone());
            self.memory_bytes += slot.header.size_bytes;
        }
        self.slots.insert(key, slot);
    }

    /// Remove a slot and every trace of it in the index and accounting
    fn detach(&mut self, key: &CacheKey) -> Option<Slot<R>> {
        let slot = self.slots.remove(key)?;
        self.index.remove(key);
        if slot.result.is_some() {
            self.resident.remove(&slot.order_key());
            self.memory_bytes -= slot.header.size_bytes;
        }
        Some(slot)
    }

    /// Load a result into a slot that only had a persisted copy
    fn admit(&mut self, key: &CacheKey, result: R) {
        if let Some(slot) = self.slots.get_mut(key) {
            if slot.result.is_none() {
                slot.result = Some(result);
                self.memory_bytes += slot.header.size_bytes;
                self.resident.insert(slot.order_key(), key.clone());
            }
        }
    }

    /// Drop resident entries, oldest first, until within `budget`
    fn evict(&mut self, budget: u64) {
        while self.memory_bytes > budget {
            let Some((_, key)) = self.resident.pop_first() else {
                break;
            };
            let Some(slot) = self.slots.get_mut(&key) else {
                continue;
            };

            slot.result = None;
            self.memory_bytes -= slot.header.size_bytes;
            self.counters.evictions += 1;

            if !slot.on_disk {
                self.slots.remove(&key);
                self.index.remove(&key);
            }
            debug!("Evicted {} from memory", key);
        }
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.resident.clear();
        self.memory_bytes = 0;
        self.counters = Counters::default();
    }
}

enum Lookup<R> {
    Hit(R),
    Miss,
    Cold {
        path: PathBuf,
        created_at: DateTime<Utc>,
    },
}

/// Concurrency-safe store of validation results
pub struct CacheStore<R> {
    inner: Mutex<Inner<R>>,
    options: StoreOptions,
    validator_version: String,
    disk: Option<DiskStore>,
}

impl<R: CacheValue> CacheStore<R> {
    /// Create a store that never touches disk (`options.dir` is ignored)
    pub fn memory_only(options: StoreOptions, validator_version: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Inner::new(options.path_match)),
            options: StoreOptions { dir: None, ..options },
            validator_version: validator_version.into(),
            disk: None,
        }
    }

    /// Open a store, loading persisted entries when `options.dir` is set.
    ///
    /// Fails with [`ModcheckError::CacheDirUnusable`] when the directory
    /// cannot be created or written; callers may fall back to
    /// [`CacheStore::memory_only`].
    pub async fn open(
        options: StoreOptions,
        validator_version: impl Into<String>,
    ) -> ModcheckResult<Self> {
        let Some(dir) = options.dir.clone() else {
            return Ok(Self::memory_only(options, validator_version));
        };

        let disk = DiskStore::open(&dir, options.compress).await?;
        let store = Self {
            inner: Mutex::new(Inner::new(options.path_match)),
            options,
            validator_version: validator_version.into(),
            disk: Some(disk),
        };

        let report = store.run_maintenance(true).await;
        info!(
            "Loaded {} cached entries from {} ({} removed)",
            store.lock().slots.len(),
            dir.display(),
            report.removed()
        );
        Ok(store)
    }

    /// Version tag entries must carry to be served
    pub fn validator_version(&self) -> &str {
        &self.validator_version
    }

    /// Whether entries are persisted
    pub fn is_persistent(&self) -> bool {
        self.disk.is_some()
    }

    /// Directory of persisted entries
    pub fn dir(&self) -> Option<&Path> {
        self.disk.as_ref().map(DiskStore::dir)
    }

    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the result for `key` computed from inputs hashing to `hash`.
    ///
    /// Returns an owned copy. A persisted entry that cannot be read within
    /// the configured timeout, or cannot be decoded, is a miss.
    pub async fn get(&self, key: &CacheKey, hash: &ContentHash) -> Option<R> {
        let lookup = {
            let mut inner = self.lock();
            let lookup = self.lookup_locked(&mut inner, key, hash);
            match &lookup {
                Lookup::Hit(_) => inner.counters.hits += 1,
                Lookup::Miss => inner.counters.misses += 1,
                Lookup::Cold { .. } => {}
            }
            lookup
        };

        match lookup {
            Lookup::Hit(result) => Some(result),
            Lookup::Miss => None,
            Lookup::Cold { path, created_at } => self.cold_read(key, hash, &path, created_at).await,
        }
    }

    fn lookup_locked(&self, inner: &mut Inner<R>, key: &CacheKey, hash: &ContentHash) -> Lookup<R> {
        let Some(slot) = inner.slots.get(key) else {
            return Lookup::Miss;
        };

        let now = Utc::now();
        match slot
            .header
            .check(hash, now, self.options.max_age, &self.validator_version)
        {
            Ok(()) => {}
            // The entry may still be valid for its own hash; a new `set`
            // replaces it.
            Err(Staleness::HashMismatch) => return Lookup::Miss,
            Err(reason) => {
                debug!("Dropping stale entry {}: {:?}", key, reason);
                let on_disk = slot.on_disk;
                inner.detach(key);
                if on_disk {
                    self.schedule_remove(key);
                }
                return Lookup::Miss;
            }
        }

        match (&slot.result, slot.on_disk, &self.disk) {
            (Some(result), _, _) => Lookup::Hit(result.clone()),
            (None, true, Some(disk)) => Lookup::Cold {
                path: disk.path_for(key),
                created_at: slot.header.created_at,
            },
            _ => Lookup::Miss,
        }
    }

    async fn cold_read(
        &self,
        key: &CacheKey,
        hash: &ContentHash,
        path: &Path,
        created_at: DateTime<Utc>,
    ) -> Option<R> {
        let read = match &self.disk {
            Some(disk) => disk.read::<R>(path, self.options.disk_read_timeout).await,
            None => ColdRead::Unavailable,
        };

        let mut inner = self.lock();
        inner.counters.disk_reads += 1;

        // Only the slot we read for may be answered or dropped; anything else
        // means an invalidation or a newer write happened meanwhile.
        let same_slot = inner
            .slots
            .get(key)
            .is_some_and(|slot| slot.header.created_at == created_at);

        match read {
            ColdRead::Loaded(header, result)
                if same_slot
                    && header.key == *key
                    && header.hash == *hash
                    && header.created_at == created_at =>
            {
                inner.admit(key, result.clone());
                inner.evict(self.options.max_size_bytes);
                inner.counters.hits += 1;
                Some(result)
            }
            ColdRead::Loaded(..) | ColdRead::Unavailable => {
                inner.counters.misses += 1;
                None
            }
            ColdRead::Invalid => {
                if same_slot {
                    debug!("Persisted copy of {} unreadable, dropping entry", key);
                    inner.detach(key);
                    self.schedule_remove(key);
                }
                inner.counters.misses += 1;
                None
            }
        }
    }

    /// Store `result` for `key` computed from inputs hashing to `hash`.
    ///
    /// The copy is visible to lookups as soon as this returns; persisting
    /// happens in the background and its failures are only logged. An entry
    /// larger than the whole memory budget is only persisted.
    pub fn set(
        &self,
        key: &CacheKey,
        hash: &ContentHash,
        result: &R,
        metadata: Metadata,
    ) -> ModcheckResult<()> {
        let payload = serde_json::to_vec(result).map_err(|e| ModcheckError::CacheEncode {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let size_bytes = metadata.size_bytes().unwrap_or(payload.len() as u64);

        let header = EntryHeader {
            key: key.clone(),
            hash: hash.clone(),
            created_at: Utc::now(),
            validator_version: self.validator_version.clone(),
            metadata,
            size_bytes,
        };

        let encoded = match &self.disk {
            Some(disk) => match disk.encode(&header, result) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("Not persisting {}: {}", key, e);
                    None
                }
            },
            None => None,
        };

        let fits = size_bytes <= self.options.max_size_bytes;
        let mut inner = self.lock();

        if let Some(previous) = inner.detach(key) {
            if previous.on_disk && encoded.is_none() {
                self.schedule_remove(key);
            }
        }

        inner.counters.writes += 1;
        if !fits && encoded.is_none() {
            debug!(
                "Entry {} ({} bytes) exceeds the memory budget, not cached",
                key, size_bytes
            );
            return Ok(());
        }

        let on_disk = encoded.is_some();
        inner.insert(header, fits.then(|| result.clone()), on_disk);
        inner.evict(self.options.max_size_bytes);

        // Queued under the lock so it cannot overtake a later removal
        if let (Some(disk), Some(bytes)) = (&self.disk, encoded) {
            disk.schedule_write(key, bytes);
        }

        Ok(())
    }

    /// Remove every entry whose files match `changed_files` or whose
    /// dependencies include one of `changed_deps`. Returns how many were
    /// removed.
    pub fn invalidate(&self, changed_files: &[PathBuf], changed_deps: &[PackageId]) -> usize {
        let mut inner = self.lock();
        let affected = inner.index.affected(changed_files, changed_deps);

        for key in &affected {
            if let Some(slot) = inner.detach(key) {
                if slot.on_disk {
                    self.schedule_remove(key);
                }
            }
        }

        inner.counters.invalidations += affected.len() as u64;
        if !affected.is_empty() {
            info!(
                "Invalidated {} entries ({} files, {} packages changed)",
                affected.len(),
                changed_files.len(),
                changed_deps.len()
            );
        }
        affected.len()
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut inner = self.lock();
        match inner.detach(key) {
            Some(slot) => {
                if slot.on_disk {
                    self.schedule_remove(key);
                }
                inner.counters.invalidations += 1;
                true
            }
            None => false,
        }
    }

    /// Whether an entry (resident or persisted) exists for `key`
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().slots.contains_key(key)
    }

    /// Resident entry for `key` with its provenance, without validity
    /// checks or touching statistics
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry<R>> {
        let inner = self.lock();
        let slot = inner.slots.get(key)?;
        let result = slot.result.clone()?;
        Some(CacheEntry {
            header: slot.header.clone(),
            result,
        })
    }

    /// Remove all entries, in memory and on disk, and reset statistics
    pub async fn clear(&self) -> ModcheckResult<()> {
        let pending = {
            let mut inner = self.lock();
            inner.clear();
            match &self.disk {
                Some(disk) => {
                    disk.reset_failures();
                    let (reply, done) = oneshot::channel();
                    disk.submit(PersistOp::Clear { reply })?;
                    Some(done)
                }
                None => None,
            }
        };

        if let Some(done) = pending {
            let removed = done.await.map_err(|_| ModcheckError::CacheWriterStopped)??;
            info!("Cleared cache ({} files removed)", removed);
        } else {
            info!("Cleared in-memory cache");
        }
        Ok(())
    }

    /// Counters and occupancy
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let c = &inner.counters;
        CacheStats {
            hits: c.hits,
            misses: c.misses,
            invalidations: c.invalidations,
            writes: c.writes,
            evictions: c.evictions,
            disk_reads: c.disk_reads,
            persist_failures: self.disk.as_ref().map_or(0, DiskStore::failures),
            entry_count: inner.slots.len(),
            resident_entries: inner.resident.len(),
            disk_entries: inner.slots.values().filter(|s| s.on_disk).count(),
            memory_bytes: inner.memory_bytes,
            max_size_bytes: self.options.max_size_bytes,
            hit_rate: CacheStats::rate(c.hits, c.misses),
            persistent: self.disk.is_some(),
        }
    }

    /// Wait for queued background writes to land
    pub async fn flush(&self) -> ModcheckResult<()> {
        match &self.disk {
            Some(disk) => disk.flush().await,
            None => Ok(()),
        }
    }

    /// Tidy the cache directory: drop unreadable, expired, mismatched and
    /// orphaned files, then enforce the disk budget oldest-first.
    ///
    /// Never fails; problems are logged and picked up again next time.
    pub async fn maintain(&self) -> MaintenanceReport {
        self.run_maintenance(false).await
    }

    /// `adopt` registers persisted entries this process has not seen, which
    /// is only safe before any invalidation ran.
    async fn run_maintenance(&self, adopt: bool) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let Some(disk) = &self.disk else {
            return report;
        };

        if let Err(e) = disk.flush().await {
            warn!("Cache maintenance skipped: {}", e);
            return report;
        }
        let scan = match disk.scan().await {
            Ok(scan) => scan,
            Err(e) => {
                warn!("Cache maintenance skipped: {}", e);
                return report;
            }
        };

        report.scanned = scan.entries.len() + scan.corrupt.len();
        let now = Utc::now();
        let mut inner = self.lock();

        for path in scan.corrupt {
            disk.schedule_remove_path(path);
            report.removed_corrupt += 1;
        }

        let mut kept = Vec::new();
        for entry in scan.entries {
            let header = &entry.header;
            let slot_created = inner.slots.get(&header.key).map(|s| s.header.created_at);

            let stale = header.is_expired(now, self.options.max_age)
                || header.validator_version != self.validator_version;

            match slot_created {
                // A newer write for this key is queued and will overwrite the file
                Some(created) if created != header.created_at => continue,
                Some(_) if stale => {
                    inner.detach(&header.key);
                    disk.schedule_remove_path(entry.path);
                    report.removed_stale += 1;
                }
                Some(_) => {
                    if let Some(slot) = inner.slots.get_mut(&header.key) {
                        slot.on_disk = true;
                    }
                    kept.push(entry);
                }
                None if stale => {
                    disk.schedule_remove_path(entry.path);
                    report.removed_stale += 1;
                }
                None if adopt => {
                    inner.insert(entry.header.clone(), None, true);
                    kept.push(entry);
                }
                None => {
                    debug!("Removing orphaned cache file {}", entry.path.display());
                    disk.schedule_remove_path(entry.path);
                    report.removed_stale += 1;
                }
            }
        }

        let mut disk_bytes: u64 = kept.iter().map(|e| e.file_bytes).sum();
        if self.options.max_disk_bytes > 0 && disk_bytes > self.options.max_disk_bytes {
            kept.sort_by_key(|e| e.header.created_at);
            for entry in &kept {
                if disk_bytes <= self.options.max_disk_bytes {
                    break;
                }
                let key = &entry.header.key;
                let resident = inner
                    .slots
                    .get(key)
                    .is_some_and(|slot| slot.result.is_some());
                if resident {
                    if let Some(slot) = inner.slots.get_mut(key) {
                        slot.on_disk = false;
                    }
                } else {
                    inner.detach(key);
                }
                disk.schedule_remove_path(entry.path.clone());
                disk_bytes -= entry.file_bytes;
                report.removed_for_budget += 1;
            }
        }

        report.disk_bytes = disk_bytes;
        if report.removed() > 0 {
            debug!(
                "Cache maintenance removed {} files ({} corrupt, {} stale, {} over budget)",
                report.removed(),
                report.removed_corrupt,
                report.removed_stale,
                report.removed_for_budget
            );
        }
        report
    }

    fn schedule_remove(&self, key: &CacheKey) {
        if let Some(disk) = &self.disk {
            disk.schedule_remove(key);
        }
    }
}
