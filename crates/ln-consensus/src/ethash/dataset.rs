//! Verification caches and mining datasets.
//!
//! Both are generated per epoch from a seed chain.  Caches are small and
//! enough to verify a seal by recomputing the dataset items a hash touches;
//! datasets are the fully expanded item table used while mining.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ln_types::Hash;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::ConsensusError;

/// Blocks per epoch.
pub const EPOCH_LENGTH: u64 = 30_000;

/// Revision embedded in on-disk file names.
const ALGORITHM_REVISION: u32 = 1;

const CACHE_ITEMS: usize = 1 << 12;
const DATASET_ITEMS: usize = 1 << 16;
const TEST_CACHE_ITEMS: usize = 1 << 6;
const TEST_DATASET_ITEMS: usize = 1 << 8;

/// Seed for the epoch containing `block`: the zero hash rehashed once per
/// elapsed epoch.
pub fn seed_hash(block: u64) -> Hash {
    let mut seed = Hash::zero();
    for _ in 0..block / EPOCH_LENGTH {
        seed = Hash::digest(seed.as_bytes());
    }
    seed
}

fn dataset_item(cache: &[Hash], index: usize) -> Hash {
    let len = cache.len();
    let mut hasher = Sha256::new();
    hasher.update(cache[index % len].0);
    hasher.update(cache[index.wrapping_mul(7).wrapping_add(3) % len].0);
    hasher.update((index as u64).to_be_bytes());
    Hash(hasher.finalize().into())
}

/// Verification cache for one epoch.
#[derive(Debug)]
pub struct Cache {
    pub epoch: u64,
    items: Vec<Hash>,
    dataset_size: usize,
}

impl Cache {
    fn generate(epoch: u64, items: usize, dataset_size: usize) -> Self {
        let mut out = Vec::with_capacity(items);
        let mut cur = Hash::digest(seed_hash(epoch * EPOCH_LENGTH).as_bytes());
        for _ in 0..items {
            out.push(cur);
            cur = Hash::digest(cur.as_bytes());
        }
        Self {
            epoch,
            items: out,
            dataset_size,
        }
    }

    /// Number of items in the dataset this cache expands to.
    pub fn dataset_size(&self) -> usize {
        self.dataset_size
    }

    /// Compute a single dataset item on the fly.
    pub fn item(&self, index: usize) -> Hash {
        dataset_item(&self.items, index)
    }
}

/// Full mining dataset for one epoch.
#[derive(Debug)]
pub struct Dataset {
    pub epoch: u64,
    items: Vec<Hash>,
}

impl Dataset {
    fn expand(cache: &Cache) -> Self {
        let items = (0..cache.dataset_size)
            .map(|i| dataset_item(&cache.items, i))
            .collect();
        Self {
            epoch: cache.epoch,
            items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item(&self, index: usize) -> Hash {
        self.items[index % self.items.len()]
    }
}

/// In-memory LRU of per-epoch items, optionally backed by files on disk.
struct EpochStore<T> {
    prefix: &'static str,
    dir: Option<PathBuf>,
    in_mem: usize,
    on_disk: usize,
    entries: Mutex<VecDeque<(u64, Arc<T>)>>,
}

impl<T> EpochStore<T> {
    fn new(prefix: &'static str, dir: Option<PathBuf>, in_mem: usize, on_disk: usize) -> Self {
        Self {
            prefix,
            dir,
            in_mem: in_mem.max(1),
            on_disk,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn lookup(&self, epoch: u64) -> Option<Arc<T>> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|(e, _)| *e == epoch)?;
        let entry = entries.remove(pos)?;
        let item = entry.1.clone();
        entries.push_back(entry);
        Some(item)
    }

    fn insert(&self, epoch: u64, item: Arc<T>) {
        let mut entries = self.entries.lock();
        if entries.iter().any(|(e, _)| *e == epoch) {
            return;
        }
        entries.push_back((epoch, item));
        while entries.len() > self.in_mem {
            if let Some((evicted, _)) = entries.pop_front() {
                debug!(kind = self.prefix, epoch = evicted, "Evicted ethash epoch from memory");
            }
        }
    }

    fn path(&self, epoch: u64) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        if self.on_disk == 0 {
            return None;
        }
        let seed = seed_hash(epoch * EPOCH_LENGTH);
        Some(dir.join(format!(
            "{}-R{}-{}",
            self.prefix,
            ALGORITHM_REVISION,
            hex::encode(&seed.0[..8])
        )))
    }

    /// Remove the file that just fell out of the on-disk window.
    fn prune(&self, epoch: u64) {
        if epoch < self.on_disk as u64 {
            return;
        }
        if let Some(stale) = self.path(epoch - self.on_disk as u64) {
            if stale.exists() {
                if let Err(err) = fs::remove_file(&stale) {
                    warn!(path = %stale.display(), %err, "Failed to remove stale ethash file");
                }
            }
        }
    }
}

fn read_items(path: &Path) -> Option<Vec<Hash>> {
    let bytes = fs::read(path).ok()?;
    if bytes.is_empty() || bytes.len() % 32 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks(32)
            .map(|chunk| {
                let mut out = [0u8; 32];
                out.copy_from_slice(chunk);
                Hash(out)
            })
            .collect(),
    )
}

fn write_items(path: &Path, items: &[Hash]) -> Result<(), ConsensusError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut bytes = Vec::with_capacity(items.len() * 32);
    for item in items {
        bytes.extend_from_slice(item.as_bytes());
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Options for a [`DatasetCache`].
#[derive(Debug, Clone, Default)]
pub struct DatasetCacheConfig {
    pub cache_dir: Option<PathBuf>,
    pub caches_in_mem: usize,
    pub caches_on_disk: usize,
    pub dataset_dir: Option<PathBuf>,
    pub datasets_in_mem: usize,
    pub datasets_on_disk: usize,
    /// Use the shrunk item counts.
    pub test: bool,
}

/// Per-epoch caches and datasets, generated lazily.
///
/// Engines in shared mode hold clones of one `Arc<DatasetCache>` so the
/// expensive generation happens once per process.
pub struct DatasetCache {
    caches: EpochStore<Cache>,
    datasets: EpochStore<Dataset>,
    cache_items: usize,
    dataset_items: usize,
    generated: AtomicUsize,
}

impl DatasetCache {
    pub fn new(config: DatasetCacheConfig) -> Self {
        let (cache_items, dataset_items) = if config.test {
            (TEST_CACHE_ITEMS, TEST_DATASET_ITEMS)
        } else {
            (CACHE_ITEMS, DATASET_ITEMS)
        };
        Self {
            caches: EpochStore::new(
                "cache",
                config.cache_dir,
                config.caches_in_mem,
                config.caches_on_disk,
            ),
            datasets: EpochStore::new(
                "full",
                config.dataset_dir,
                config.datasets_in_mem,
                config.datasets_on_disk,
            ),
            cache_items,
            dataset_items,
            generated: AtomicUsize::new(0),
        }
    }

    /// Memory-only cache with test-sized items, meant to be shared.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new(DatasetCacheConfig {
            caches_in_mem: 1,
            datasets_in_mem: 1,
            test: true,
            ..DatasetCacheConfig::default()
        }))
    }

    /// How many caches and datasets have been generated (not loaded).
    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::Relaxed)
    }

    /// Verification cache for the epoch containing `block`.
    pub fn cache(&self, block: u64) -> Result<Arc<Cache>, ConsensusError> {
        let epoch = block / EPOCH_LENGTH;
        if let Some(cache) = self.caches.lookup(epoch) {
            return Ok(cache);
        }
        let path = self.caches.path(epoch);
        let cache = match path.as_deref().and_then(read_items) {
            Some(items) if items.len() == self.cache_items => {
                debug!(epoch, "Loaded ethash cache from disk");
                Cache {
                    epoch,
                    items,
                    dataset_size: self.dataset_items,
                }
            }
            _ => {
                let cache = Cache::generate(epoch, self.cache_items, self.dataset_items);
                self.generated.fetch_add(1, Ordering::Relaxed);
                if let Some(path) = &path {
                    write_items(path, &cache.items)?;
                    self.caches.prune(epoch);
                }
                debug!(epoch, items = self.cache_items, "Generated ethash verification cache");
                cache
            }
        };
        let cache = Arc::new(cache);
        self.caches.insert(epoch, cache.clone());
        Ok(cache)
    }

    /// Mining dataset for the epoch containing `block`.
    pub fn dataset(&self, block: u64) -> Result<Arc<Dataset>, ConsensusError> {
        let epoch = block / EPOCH_LENGTH;
        if let Some(dataset) = self.datasets.lookup(epoch) {
            return Ok(dataset);
        }
        let path = self.datasets.path(epoch);
        let dataset = match path.as_deref().and_then(read_items) {
            Some(items) if items.len() == self.dataset_items => Dataset { epoch, items },
            _ => {
                let cache = self.cache(block)?;
                let dataset = Dataset::expand(&cache);
                self.generated.fetch_add(1, Ordering::Relaxed);
                if let Some(path) = &path {
                    write_items(path, &dataset.items)?;
                    self.datasets.prune(epoch);
                }
                info!(epoch, items = dataset.len(), "Generated ethash mining dataset");
                dataset
            }
        };
        let dataset = Arc::new(dataset);
        self.datasets.insert(epoch, dataset.clone());
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> DatasetCacheConfig {
        DatasetCacheConfig {
            cache_dir: Some(dir.join("caches")),
            caches_in_mem: 1,
            caches_on_disk: 2,
            dataset_dir: Some(dir.join("datasets")),
            datasets_in_mem: 1,
            datasets_on_disk: 1,
            test: true,
        }
    }

    #[test]
    fn dataset_items_match_cache_expansion() {
        let cache = DatasetCache::shared();
        let light = cache.cache(0).unwrap();
        let full = cache.dataset(0).unwrap();
        assert_eq!(full.len(), TEST_DATASET_ITEMS);
        for i in [0usize, 1, 17, TEST_DATASET_ITEMS - 1] {
            assert_eq!(light.item(i), full.item(i));
        }
    }

    #[test]
    fn repeated_lookups_reuse_generated_epoch() {
        let cache = DatasetCache::shared();
        cache.dataset(5).unwrap();
        let after_first = cache.generated();
        cache.dataset(10).unwrap();
        cache.cache(EPOCH_LENGTH - 1).unwrap();
        assert_eq!(cache.generated(), after_first);
    }

    #[test]
    fn datasets_are_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let first = DatasetCache::new(test_config(dir.path()));
        let generated = first.dataset(0).unwrap();
        assert!(fs::read_dir(dir.path().join("datasets")).unwrap().count() == 1);

        let second = DatasetCache::new(test_config(dir.path()));
        let loaded = second.dataset(0).unwrap();
        assert_eq!(second.generated(), 0);
        assert_eq!(loaded.item(3), generated.item(3));
    }

    #[test]
    fn old_epochs_are_pruned_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DatasetCache::new(test_config(dir.path()));
        cache.dataset(0).unwrap();
        cache.dataset(EPOCH_LENGTH).unwrap();
        let files = fs::read_dir(dir.path().join("datasets")).unwrap().count();
        assert_eq!(files, 1);
    }

    #[test]
    fn seed_changes_each_epoch() {
        assert_eq!(seed_hash(0), Hash::zero());
        assert_eq!(seed_hash(EPOCH_LENGTH - 1), Hash::zero());
        assert_ne!(seed_hash(EPOCH_LENGTH), Hash::zero());
    }
}
