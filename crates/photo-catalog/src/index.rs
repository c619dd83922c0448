//! In-memory, mutable view over one directory's catalog.
//!
//! Records live in per-shard slots so dirtiness is tracked at the same
//! granularity the store persists at. A flush rewrites only dirty shards and
//! then the manifest.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hasher::ContentHash;
use crate::manifest::CatalogManifest;
use crate::record::PhotoRecord;
use crate::shard::{CatalogShard, ShardIndex, SHARD_COUNT};
use crate::store::{CatalogShardStore, LoadedCatalog};

#[derive(Debug, Default, Clone)]
struct ShardSlot {
    records: Vec<PhotoRecord>,
    positions: HashMap<ContentHash, usize>,
    dirty: bool,
    /// Bumped on every mutation; lets a flush that raced a mutation leave the
    /// slot dirty.
    generation: u64,
}

impl ShardSlot {
    fn from_records(records: Vec<PhotoRecord>) -> Self {
        let mut slot = ShardSlot::default();
        for record in records {
            slot.upsert(record);
        }
        slot
    }

    fn upsert(&mut self, record: PhotoRecord) -> Option<PhotoRecord> {
        match self.positions.get(&record.content_hash) {
            Some(&pos) => Some(std::mem::replace(&mut self.records[pos], record)),
            None => {
                self.positions
                    .insert(record.content_hash.clone(), self.records.len());
                self.records.push(record);
                None
            }
        }
    }

    fn remove(&mut self, hash: &ContentHash) -> Option<PhotoRecord> {
        let pos = self.positions.remove(hash)?;
        let record = self.records.remove(pos);
        for later in self.positions.values_mut() {
            if *later > pos {
                *later -= 1;
            }
        }
        Some(record)
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }
}

/// Work captured from the index for one flush.
#[derive(Debug, Clone)]
pub struct FlushPlan {
    manifest: CatalogManifest,
    shards: Vec<CatalogShard>,
    generations: Vec<(ShardIndex, u64)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub shards_written: usize,
    pub manifest_written: bool,
}

/// One file reported by the directory enumeration collaborator.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// What the caller learned about a file's contents while hashing it.
#[derive(Debug, Clone)]
pub struct FileDetails {
    pub content_hash: ContentHash,
    pub captured_at: Option<DateTime<Utc>>,
    pub pixel_width: Option<u32>,
    pub pixel_height: Option<u32>,
}

impl FileDetails {
    pub fn new(content_hash: ContentHash) -> Self {
        Self {
            content_hash,
            captured_at: None,
            pixel_width: None,
            pixel_height: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub scanned: usize,
    pub unchanged: usize,
    pub hashed: usize,
    pub added: usize,
    pub updated: usize,
    /// Files whose content matched a record already claimed by another file.
    pub duplicates: usize,
    pub removed: usize,
    pub failed: usize,
}

pub struct DirectoryCatalogIndex {
    store: CatalogShardStore,
    manifest: CatalogManifest,
    slots: Vec<ShardSlot>,
    /// The manifest has never been written (fresh catalog).
    manifest_pending: bool,
    /// Shards that failed verification. They are never written until
    /// rebuilt, so the manifest keeps vouching for the damaged file.
    corrupted: BTreeMap<ShardIndex, Error>,
    /// Files whose content is already owned by another file's record, by
    /// relative name.
    duplicates: HashMap<String, DuplicateFile>,
}

/// What the last reconcile saw of a file that duplicates another's content.
#[derive(Debug, Clone)]
struct DuplicateFile {
    size_bytes: u64,
    modified_at: Option<i64>,
    content_hash: ContentHash,
}

impl DuplicateFile {
    fn new(entry: &DirectoryEntry, content_hash: ContentHash) -> Self {
        Self {
            size_bytes: entry.size_bytes,
            modified_at: entry.modified_at.map(|t| t.timestamp()),
            content_hash,
        }
    }

    fn matches(&self, entry: &DirectoryEntry) -> bool {
        self.size_bytes == entry.size_bytes
            && self.modified_at == entry.modified_at.map(|t| t.timestamp())
    }
}

impl DirectoryCatalogIndex {
    /// Load an existing catalog. Fails with `NotFound` if the directory has
    /// none, and with `UnsupportedVersion` for a format this build does not
    /// read. Corrupted shards are isolated, not fatal.
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let store = CatalogShardStore::new(directory);
        let loaded = store.load().await?;
        Ok(Self::from_loaded(store, loaded))
    }

    /// Load the catalog, or start an empty one with a fresh directory UUID if
    /// none exists. The new manifest is persisted by the first flush.
    pub async fn open_or_create(directory: impl Into<PathBuf>) -> Result<Self> {
        let store = CatalogShardStore::new(directory);
        match store.load().await {
            Ok(loaded) => Ok(Self::from_loaded(store, loaded)),
            Err(Error::NotFound(_)) => {
                info!("Creating new catalog for {}", store.directory().display());
                Ok(Self::create(store))
            }
            Err(e) => Err(e),
        }
    }

    pub fn create(store: CatalogShardStore) -> Self {
        Self {
            store,
            manifest: CatalogManifest::new(),
            slots: vec![ShardSlot::default(); SHARD_COUNT],
            manifest_pending: true,
            corrupted: BTreeMap::new(),
            duplicates: HashMap::new(),
        }
    }

    pub fn from_loaded(store: CatalogShardStore, loaded: LoadedCatalog) -> Self {
        let mut slots = vec![ShardSlot::default(); SHARD_COUNT];
        for shard in loaded.shards {
            slots[shard.index.as_usize()] = ShardSlot::from_records(shard.records);
        }

        let mut corrupted = BTreeMap::new();
        for fault in loaded.corrupted {
            warn!(
                "Shard {} of {} needs rebuilding: {}",
                fault.index,
                store.directory().display(),
                fault.error
            );
            corrupted.insert(fault.index, fault.error);
        }

        Self {
            store,
            manifest: loaded.manifest,
            slots,
            manifest_pending: false,
            corrupted,
            duplicates: HashMap::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        self.store.directory()
    }

    pub fn manifest(&self) -> &CatalogManifest {
        &self.manifest
    }

    pub fn lookup(&self, hash: &ContentHash) -> Option<&PhotoRecord> {
        let slot = &self.slots[hash.shard().as_usize()];
        slot.positions.get(hash).map(|&pos| &slot.records[pos])
    }

    /// Every record, in shard order then insertion order within a shard.
    pub fn all_records(&self) -> impl Iterator<Item = &PhotoRecord> + '_ {
        self.slots.iter().flat_map(|slot| slot.records.iter())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().map(|slot| slot.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace the record with this content hash. Returns the record
    /// it replaced.
    pub fn upsert(&mut self, record: PhotoRecord) -> Option<PhotoRecord> {
        let slot = &mut self.slots[record.content_hash.shard().as_usize()];
        slot.touch();
        slot.upsert(record)
    }

    pub fn remove(&mut self, hash: &ContentHash) -> Option<PhotoRecord> {
        let slot = &mut self.slots[hash.shard().as_usize()];
        let removed = slot.remove(hash);
        if removed.is_some() {
            slot.touch();
        }
        removed
    }

    /// Whether a flush would write anything. Mutations to a corrupted shard
    /// are held in memory until it is rebuilt.
    pub fn is_dirty(&self) -> bool {
        self.manifest_pending || self.writable_shards().next().is_some()
    }

    fn writable_shards(&self) -> impl Iterator<Item = (ShardIndex, &ShardSlot)> + '_ {
        ShardIndex::all()
            .zip(&self.slots)
            .filter(|(index, slot)| slot.dirty && !self.corrupted.contains_key(index))
    }

    /// Shards that failed verification at load and have not been rebuilt.
    pub fn corrupted_shards(&self) -> impl Iterator<Item = (ShardIndex, &Error)> + '_ {
        self.corrupted.iter().map(|(index, error)| (*index, error))
    }

    /// Replace a shard's records wholesale, e.g. after rescanning the files
    /// that route to a corrupted shard.
    pub fn rebuild_shard(&mut self, index: ShardIndex, records: Vec<PhotoRecord>) -> Result<()> {
        if let Some(stray) = records.iter().find(|r| r.content_hash.shard() != index) {
            return Err(Error::InvalidRecord(format!(
                "record {} does not belong to shard {}",
                stray.content_hash, index
            )));
        }
        let slot = &mut self.slots[index.as_usize()];
        let generation = slot.generation;
        *slot = ShardSlot::from_records(records);
        slot.generation = generation;
        slot.touch();
        self.corrupted.remove(&index);
        Ok(())
    }

    /// Snapshot what a flush would write, or `None` if nothing changed.
    pub fn prepare_flush(&self) -> Option<FlushPlan> {
        if !self.is_dirty() {
            return None;
        }

        let mut shards = Vec::new();
        let mut generations = Vec::new();
        for (index, slot) in self.writable_shards() {
            shards.push(CatalogShard {
                index,
                records: slot.records.clone(),
            });
            generations.push((index, slot.generation));
        }

        Some(FlushPlan {
            manifest: self.manifest.clone(),
            shards,
            generations,
        })
    }

    /// Adopt the manifest a successful write of `plan` produced. Slots mutated
    /// since the plan was taken stay dirty.
    pub fn commit_flush(&mut self, plan: FlushPlan, committed: CatalogManifest) -> FlushSummary {
        for (index, generation) in &plan.generations {
            let slot = &mut self.slots[index.as_usize()];
            if slot.generation == *generation {
                slot.dirty = false;
            }
        }
        self.manifest = committed;
        self.manifest_pending = false;

        FlushSummary {
            shards_written: plan.shards.len(),
            manifest_written: true,
        }
    }

    /// Persist dirty shards, then the manifest. A second call with no
    /// intervening mutation does no I/O. On failure the index is unchanged and
    /// the same flush can be retried.
    pub async fn flush(&mut self) -> Result<FlushSummary> {
        let Some(plan) = self.prepare_flush() else {
            return Ok(FlushSummary::default());
        };
        let committed = self.store.write(&plan.manifest, &plan.shards).await?;
        let summary = self.commit_flush(plan, committed);
        debug!(
            "Flushed {} shards for {}",
            summary.shards_written,
            self.directory().display()
        );
        Ok(summary)
    }

    /// Flush an index shared with readers. Readers keep access while shard
    /// files are written; the write lock is held only to commit.
    pub async fn flush_shared(index: &tokio::sync::RwLock<Self>) -> Result<FlushSummary> {
        let (store, plan) = {
            let guard = index.read().await;
            match guard.prepare_flush() {
                Some(plan) => (guard.store.clone(), plan),
                None => return Ok(FlushSummary::default()),
            }
        };
        let committed = store.write(&plan.manifest, &plan.shards).await?;
        Ok(index.write().await.commit_flush(plan, committed))
    }

    fn relative_name(&self, path: &Path) -> String {
        let relative = path.strip_prefix(self.directory()).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Bring the index in line with a directory listing.
    ///
    /// Files whose name, size and modification time match a record, or match
    /// a duplicate seen by the previous reconcile, are not reopened.
    /// Everything else goes through `inspect` (in parallel). Records no
    /// enumerated file backs any more are dropped, and shards that were
    /// corrupted at load are rewritten from the scan.
    pub fn reconcile<F>(&mut self, entries: &[DirectoryEntry], inspect: F) -> ReconcileSummary
    where
        F: Fn(&Path) -> std::io::Result<FileDetails> + Sync,
    {
        let mut summary = ReconcileSummary {
            scanned: entries.len(),
            ..Default::default()
        };

        let known: HashMap<&str, &PhotoRecord> = self
            .all_records()
            .map(|record| (record.filename.as_str(), record))
            .collect();

        let mut seen: HashSet<ContentHash> = HashSet::new();
        let mut pending = Vec::new();
        let mut aliases = Vec::new();
        for entry in entries {
            let filename = self.relative_name(&entry.path);
            let unchanged = known.get(filename.as_str()).filter(|record| {
                record.size_bytes == entry.size_bytes
                    && record.modified_at.map(|t| t.timestamp())
                        == entry.modified_at.map(|t| t.timestamp())
            });
            if let Some(record) = unchanged {
                summary.unchanged += 1;
                seen.insert(record.content_hash.clone());
                continue;
            }
            let alias = self
                .duplicates
                .get(&filename)
                .filter(|dup| dup.matches(entry))
                .map(|dup| dup.content_hash.clone());
            match alias {
                Some(hash) => aliases.push((entry, filename, hash)),
                None => pending.push((entry, filename)),
            }
        }

        let mut duplicates = HashMap::new();
        for (entry, filename, hash) in aliases {
            if seen.contains(&hash) {
                summary.unchanged += 1;
                summary.duplicates += 1;
                duplicates.insert(filename, DuplicateFile::new(entry, hash));
            } else {
                // The owning file changed or is gone.
                pending.push((entry, filename));
            }
        }

        let inspected: Vec<_> = pending
            .par_iter()
            .map(|(entry, filename)| (*entry, filename, inspect(&entry.path)))
            .collect();

        let mut updates = Vec::new();
        for (entry, filename, result) in inspected {
            match result {
                Ok(details) => {
                    summary.hashed += 1;
                    if !seen.insert(details.content_hash.clone()) {
                        summary.duplicates += 1;
                        duplicates.insert(
                            filename.clone(),
                            DuplicateFile::new(entry, details.content_hash),
                        );
                        continue;
                    }
                    updates.push(PhotoRecord {
                        content_hash: details.content_hash,
                        filename: filename.clone(),
                        size_bytes: entry.size_bytes,
                        captured_at: details.captured_at,
                        modified_at: entry.modified_at,
                        pixel_width: details.pixel_width,
                        pixel_height: details.pixel_height,
                    });
                }
                Err(e) => {
                    warn!("Failed to inspect {}: {}", entry.path.display(), e);
                    summary.failed += 1;
                    // Keep whatever we knew about it.
                    if let Some(record) = known.get(filename.as_str()) {
                        seen.insert(record.content_hash.clone());
                    }
                }
            }
        }

        self.duplicates = duplicates;

        let stale: Vec<ContentHash> = self
            .all_records()
            .map(|record| record.content_hash.clone())
            .filter(|hash| !seen.contains(hash))
            .collect();

        for record in updates {
            if self.lookup(&record.content_hash) == Some(&record) {
                continue;
            }
            match self.upsert(record) {
                Some(_) => summary.updated += 1,
                None => summary.added += 1,
            }
        }
        for hash in &stale {
            if self.remove(hash).is_some() {
                summary.removed += 1;
            }
        }

        let corrupted: Vec<ShardIndex> = self.corrupted.keys().copied().collect();
        for index in corrupted {
            self.slots[index.as_usize()].touch();
            self.corrupted.remove(&index);
        }

        info!(
            "Reconciled {}: {} scanned, {} added, {} updated, {} removed, {} failed",
            self.directory().display(),
            summary.scanned,
            summary.added,
            summary.updated,
            summary.removed,
            summary.failed
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::{hash_bytes, hash_file};
    use crate::manifest::CATALOG_DIR;
    use std::fs;

    fn record(body: &str) -> PhotoRecord {
        PhotoRecord::new(hash_bytes(body.as_bytes()), format!("{}.jpg", body), body.len() as u64)
    }

    fn list(dir: &Path) -> Vec<DirectoryEntry> {
        let mut entries: Vec<DirectoryEntry> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().unwrap().is_file())
            .map(|e| {
                let meta = e.metadata().unwrap();
                DirectoryEntry {
                    path: e.path(),
                    size_bytes: meta.len(),
                    modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    fn inspect(path: &Path) -> std::io::Result<FileDetails> {
        hash_file(path).map(FileDetails::new)
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            DirectoryCatalogIndex::open(tmp.path()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upsert_lookup_flush_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        let uuid = index.manifest().directory_uuid;

        let bodies: Vec<String> = (0..64).map(|i| format!("photo-{}", i)).collect();
        for body in &bodies {
            assert!(index.upsert(record(body)).is_none());
        }
        assert_eq!(index.len(), 64);
        index.flush().await.unwrap();

        let reopened = DirectoryCatalogIndex::open(tmp.path()).await.unwrap();
        assert_eq!(reopened.manifest().directory_uuid, uuid);
        assert_eq!(reopened.len(), 64);
        for body in &bodies {
            assert_eq!(reopened.lookup(&hash_bytes(body.as_bytes())), Some(&record(body)));
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        index.upsert(record("a"));

        let mut renamed = record("a");
        renamed.filename = "renamed.jpg".to_string();
        let previous = index.upsert(renamed.clone()).unwrap();

        assert_eq!(previous.filename, "a.jpg");
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup(&renamed.content_hash), Some(&renamed));
    }

    #[tokio::test]
    async fn test_all_records_in_shard_order() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        for i in 0..40 {
            index.upsert(record(&format!("r{}", i)));
        }
        let shards: Vec<ShardIndex> = index.all_records().map(|r| r.content_hash.shard()).collect();
        let mut sorted = shards.clone();
        sorted.sort();
        assert_eq!(shards, sorted);
    }

    #[tokio::test]
    async fn test_remove_keeps_positions_consistent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        let records: Vec<PhotoRecord> = (0..50).map(|i| record(&format!("x{}", i))).collect();
        for r in &records {
            index.upsert(r.clone());
        }
        for r in records.iter().step_by(3) {
            assert!(index.remove(&r.content_hash).is_some());
        }
        for (i, r) in records.iter().enumerate() {
            let expected = if i % 3 == 0 { None } else { Some(r) };
            assert_eq!(index.lookup(&r.content_hash), expected);
        }
        assert!(index.remove(&records[0].content_hash).is_none());
    }

    #[tokio::test]
    async fn test_empty_catalog_flush_persists_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        assert!(index.is_dirty());

        let summary = index.flush().await.unwrap();
        assert_eq!(summary.shards_written, 0);
        assert!(summary.manifest_written);

        let reopened = DirectoryCatalogIndex::open(tmp.path()).await.unwrap();
        assert!(reopened.is_empty());
    }

    #[tokio::test]
    async fn test_second_flush_does_no_io() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        index.upsert(record("a"));
        index.flush().await.unwrap();
        assert!(!index.is_dirty());

        // Would be recreated by any write.
        fs::remove_dir_all(tmp.path().join(CATALOG_DIR)).unwrap();

        assert_eq!(index.flush().await.unwrap(), FlushSummary::default());
        assert!(!tmp.path().join(CATALOG_DIR).exists());
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_dirty_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        index.upsert(record("a"));
        let manifest_before = index.manifest().clone();

        // A plain file where the catalog directory should go.
        fs::write(tmp.path().join(CATALOG_DIR), b"in the way").unwrap();
        assert!(index.flush().await.is_err());
        assert!(index.is_dirty());
        assert_eq!(index.manifest(), &manifest_before);
        assert_eq!(index.len(), 1);

        fs::remove_file(tmp.path().join(CATALOG_DIR)).unwrap();
        let summary = index.flush().await.unwrap();
        assert_eq!(summary.shards_written, 1);
        assert!(!index.is_dirty());
    }

    #[tokio::test]
    async fn test_corrupted_shard_is_isolated_and_rebuilt() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        let records: Vec<PhotoRecord> = (0..48).map(|i| record(&format!("c{}", i))).collect();
        for r in &records {
            index.upsert(r.clone());
        }
        index.flush().await.unwrap();

        let victim = records[0].content_hash.shard();
        let path = tmp.path().join(CATALOG_DIR).join(victim.file_name());
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let mut reopened = DirectoryCatalogIndex::open(tmp.path()).await.unwrap();
        let corrupted: Vec<ShardIndex> = reopened.corrupted_shards().map(|(i, _)| i).collect();
        assert_eq!(corrupted, vec![victim]);
        for r in &records {
            let expected = (r.content_hash.shard() != victim).then_some(r);
            assert_eq!(reopened.lookup(&r.content_hash), expected);
        }

        let lost: Vec<PhotoRecord> = records
            .iter()
            .filter(|r| r.content_hash.shard() == victim)
            .cloned()
            .collect();
        reopened.rebuild_shard(victim, lost).unwrap();
        assert_eq!(reopened.corrupted_shards().count(), 0);
        let summary = reopened.flush().await.unwrap();
        assert_eq!(summary.shards_written, 1);

        let healed = DirectoryCatalogIndex::open(tmp.path()).await.unwrap();
        assert_eq!(healed.corrupted_shards().count(), 0);
        assert_eq!(healed.len(), records.len());
    }

    #[tokio::test]
    async fn test_corrupted_shard_is_not_overwritten_by_upsert() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        let records: Vec<PhotoRecord> = (0..48).map(|i| record(&format!("u{}", i))).collect();
        for r in &records {
            index.upsert(r.clone());
        }
        index.flush().await.unwrap();

        let victim = records[0].content_hash.shard();
        let path = tmp.path().join(CATALOG_DIR).join(victim.file_name());
        fs::write(&path, b"garbage").unwrap();

        let mut reopened = DirectoryCatalogIndex::open(tmp.path()).await.unwrap();
        let newcomer = (0..)
            .map(|i| record(&format!("new{}", i)))
            .find(|r| r.content_hash.shard() == victim)
            .unwrap();
        reopened.upsert(newcomer.clone());
        assert!(reopened.lookup(&newcomer.content_hash).is_some());
        assert!(!reopened.is_dirty());
        assert_eq!(reopened.flush().await.unwrap().shards_written, 0);

        let other = (0..)
            .map(|i| record(&format!("other{}", i)))
            .find(|r| r.content_hash.shard() != victim)
            .unwrap();
        reopened.upsert(other.clone());
        assert_eq!(reopened.flush().await.unwrap().shards_written, 1);
        assert_eq!(fs::read(&path).unwrap(), b"garbage");

        let again = DirectoryCatalogIndex::open(tmp.path()).await.unwrap();
        let corrupted: Vec<ShardIndex> = again.corrupted_shards().map(|(i, _)| i).collect();
        assert_eq!(corrupted, vec![victim]);
        assert!(again.lookup(&other.content_hash).is_some());
        assert!(again.lookup(&newcomer.content_hash).is_none());
    }

    #[tokio::test]
    async fn test_rebuild_rejects_misrouted_records() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        let r = record("a");
        let wrong = ShardIndex::all().find(|s| *s != r.content_hash.shard()).unwrap();
        assert!(index.rebuild_shard(wrong, vec![r]).is_err());
    }

    #[tokio::test]
    async fn test_reconcile_dedupes_identical_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.jpg"), [1u8; 10]).unwrap();
        fs::write(tmp.path().join("b.jpg"), [2u8; 20]).unwrap();
        fs::write(tmp.path().join("c.jpg"), [1u8; 10]).unwrap();

        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        let summary = index.reconcile(&list(tmp.path()), inspect);

        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.added, 2);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(index.len(), 2);
        let dup = index.lookup(&hash_bytes(&[1u8; 10])).unwrap();
        assert_eq!(dup.filename, "a.jpg");
        assert_eq!(dup.size_bytes, 10);
    }

    #[tokio::test]
    async fn test_reconcile_does_not_rehash_known_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.jpg"), [1u8; 10]).unwrap();
        fs::write(tmp.path().join("b.jpg"), [2u8; 20]).unwrap();
        fs::write(tmp.path().join("c.jpg"), [1u8; 10]).unwrap();

        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        index.reconcile(&list(tmp.path()), inspect);

        let summary = index.reconcile(&list(tmp.path()), |path: &Path| {
            panic!("unchanged file {} should not be reopened", path.display())
        });
        assert_eq!(summary.unchanged, 3);
        assert_eq!(summary.hashed, 0);
        assert_eq!(summary.duplicates, 1);

        // Once the owner is gone the duplicate takes over the record.
        fs::remove_file(tmp.path().join("a.jpg")).unwrap();
        let summary = index.reconcile(&list(tmp.path()), inspect);
        assert_eq!(summary.hashed, 1);
        assert_eq!(summary.removed, 0);
        assert_eq!(index.len(), 2);
        let owner = index.lookup(&hash_bytes(&[1u8; 10])).unwrap();
        assert_eq!(owner.filename, "c.jpg");
    }

    #[tokio::test]
    async fn test_reconcile_skips_unchanged_and_drops_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("keep.jpg"), b"keep").unwrap();
        fs::write(tmp.path().join("gone.jpg"), b"gone").unwrap();

        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        index.reconcile(&list(tmp.path()), inspect);
        index.flush().await.unwrap();

        fs::remove_file(tmp.path().join("gone.jpg")).unwrap();
        let summary = index.reconcile(&list(tmp.path()), |path: &Path| {
            panic!("unchanged file {} should not be reopened", path.display())
        });

        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.removed, 1);
        assert_eq!(index.len(), 1);
        assert!(index.lookup(&hash_bytes(b"keep")).is_some());
        assert!(index.is_dirty());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_records_of_unreadable_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.jpg"), b"first").unwrap();
        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        index.reconcile(&list(tmp.path()), inspect);

        fs::write(tmp.path().join("a.jpg"), b"second version").unwrap();
        let summary = index.reconcile(&list(tmp.path()), |_: &Path| {
            Err(std::io::Error::other("device busy"))
        });

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.removed, 0);
        assert!(index.lookup(&hash_bytes(b"first")).is_some());
    }

    #[tokio::test]
    async fn test_reconcile_rewrites_corrupted_shards() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..20 {
            fs::write(tmp.path().join(format!("{}.jpg", i)), format!("image {}", i)).unwrap();
        }
        let mut index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        index.reconcile(&list(tmp.path()), inspect);
        index.flush().await.unwrap();

        let victim = index.all_records().next().unwrap().content_hash.shard();
        fs::write(tmp.path().join(CATALOG_DIR).join(victim.file_name()), b"garbage").unwrap();

        let mut reopened = DirectoryCatalogIndex::open(tmp.path()).await.unwrap();
        assert_eq!(reopened.corrupted_shards().count(), 1);
        let summary = reopened.reconcile(&list(tmp.path()), inspect);
        assert!(summary.added > 0);
        assert_eq!(reopened.corrupted_shards().count(), 0);
        reopened.flush().await.unwrap();

        let healed = DirectoryCatalogIndex::open(tmp.path()).await.unwrap();
        assert_eq!(healed.corrupted_shards().count(), 0);
        assert_eq!(healed.len(), 20);
    }

    #[tokio::test]
    async fn test_flush_shared_keeps_concurrent_mutation_dirty() {
        let tmp = tempfile::tempdir().unwrap();
        let index = DirectoryCatalogIndex::open_or_create(tmp.path()).await.unwrap();
        let shared = tokio::sync::RwLock::new(index);
        shared.write().await.upsert(record("a"));

        let plan = shared.read().await.prepare_flush().unwrap();
        // Mutation lands between planning and commit.
        shared.write().await.upsert(record("a-changed-later"));
        let store = CatalogShardStore::new(tmp.path());
        let committed = store.write(&plan.manifest, &plan.shards).await.unwrap();
        shared.write().await.commit_flush(plan, committed);
        assert!(shared.read().await.is_dirty());

        DirectoryCatalogIndex::flush_shared(&shared).await.unwrap();
        assert!(!shared.read().await.is_dirty());
        let reopened = DirectoryCatalogIndex::open(tmp.path()).await.unwrap();
        assert_eq!(reopened.len(), 2);
    }
}
