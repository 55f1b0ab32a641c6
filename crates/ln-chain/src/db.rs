use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::ChainError;

/// Key-value store the chain persists into.
pub trait Database: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ChainError>;

    fn delete(&self, key: &[u8]) -> Result<(), ChainError>;

    fn has(&self, key: &[u8]) -> Result<bool, ChainError> {
        Ok(self.get(key)?.is_some())
    }

    /// All entries whose key starts with `prefix`, in key order.
    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError>;

    /// Release the store.  Every later call fails with
    /// [`ChainError::DatabaseClosed`], including a second `close`.
    fn close(&self) -> Result<(), ChainError>;
}

/// Ordered in-memory store.
#[derive(Default)]
pub struct MemoryDatabase {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
    closes: AtomicUsize,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `close` has been called.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_open(&self) -> Result<(), ChainError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChainError::DatabaseClosed);
        }
        Ok(())
    }
}

impl Database for MemoryDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        self.check_open()?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        self.check_open()?;
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), ChainError> {
        self.check_open()?;
        self.entries.write().remove(key);
        Ok(())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        self.check_open()?;
        Ok(self
            .entries
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn close(&self) -> Result<(), ChainError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ChainError::DatabaseClosed);
        }
        Ok(())
    }
}

/// Store persisted in a sled database directory.
///
/// `close` flushes and releases the directory, so the same path can be
/// reopened in-process once every handle has been closed.
pub struct SledDatabase {
    path: PathBuf,
    db: RwLock<Option<sled::Db>>,
}

impl SledDatabase {
    /// Open or create the store at `path` with a page cache of `cache_mb`
    /// megabytes.
    pub fn open(path: impl AsRef<Path>, cache_mb: usize) -> Result<Self, ChainError> {
        let path = path.as_ref().to_path_buf();
        let db = sled::Config::new()
            .path(&path)
            .cache_capacity((cache_mb as u64).saturating_mul(1024 * 1024))
            .open()?;
        debug!(path = %path.display(), cache_mb, "Opened sled store");
        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_db<T>(&self, f: impl FnOnce(&sled::Db) -> Result<T, ChainError>) -> Result<T, ChainError> {
        match self.db.read().as_ref() {
            Some(db) => f(db),
            None => Err(ChainError::DatabaseClosed),
        }
    }
}

impl Database for SledDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        self.with_db(|db| Ok(db.get(key)?.map(|v| v.to_vec())))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        self.with_db(|db| {
            db.insert(key, value)?;
            Ok(())
        })
    }

    fn delete(&self, key: &[u8]) -> Result<(), ChainError> {
        self.with_db(|db| {
            db.remove(key)?;
            Ok(())
        })
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        self.with_db(|db| {
            db.scan_prefix(prefix)
                .map(|item| -> Result<_, ChainError> {
                    let (k, v) = item?;
                    Ok((k.to_vec(), v.to_vec()))
                })
                .collect()
        })
    }

    fn close(&self) -> Result<(), ChainError> {
        let db = self.db.write().take().ok_or(ChainError::DatabaseClosed)?;
        db.flush()?;
        debug!(path = %self.path.display(), "Closed sled store");
        Ok(())
    }
}
