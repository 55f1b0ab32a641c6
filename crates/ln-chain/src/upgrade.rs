//! Background rewrite of legacy store entries.

use std::sync::Arc;

use ln_types::{Hash, Receipt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::schema::{read_header_number, write_receipts, LEGACY_RECEIPTS_PREFIX};
use crate::{ChainError, Database};

/// Entries converted between cancellation checks.
pub const UPGRADE_BATCH_SIZE: usize = 1000;

/// Handle to a running upgrade.  Dropping it cancels the task.
pub struct UpgradeHandle {
    token: CancellationToken,
    task: Option<JoinHandle<Result<usize, ChainError>>>,
}

impl UpgradeHandle {
    /// Cancel the upgrade and wait for it to exit.  Safe to call more than
    /// once.
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(converted)) => debug!(converted, "Database upgrade task exited"),
                Ok(Err(err)) => warn!(%err, "Database upgrade failed"),
                Err(err) => warn!(%err, "Database upgrade task panicked"),
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for UpgradeHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Move receipts stored under the legacy hash-only key into the
/// number-prefixed layout.  Returns `None` if there is nothing to convert.
pub fn upgrade_deduplicate_data(db: Arc<dyn Database>) -> Option<UpgradeHandle> {
    match db.iter_prefix(LEGACY_RECEIPTS_PREFIX) {
        Ok(entries) if !entries.is_empty() => {}
        Ok(_) => return None,
        Err(err) => {
            warn!(%err, "Failed to inspect database for legacy entries");
            return None;
        }
    }
    info!("Upgrading chain database to use sequential keys");

    let token = CancellationToken::new();
    let task = tokio::spawn(run(db, token.clone()));
    Some(UpgradeHandle {
        token,
        task: Some(task),
    })
}

async fn run(db: Arc<dyn Database>, token: CancellationToken) -> Result<usize, ChainError> {
    let mut converted = 0usize;
    loop {
        if token.is_cancelled() {
            warn!(converted, "Database deduplication aborted");
            return Ok(converted);
        }
        let batch = db.iter_prefix(LEGACY_RECEIPTS_PREFIX)?;
        if batch.is_empty() {
            info!(converted, "Database deduplication successful");
            return Ok(converted);
        }
        for (key, value) in batch.into_iter().take(UPGRADE_BATCH_SIZE) {
            let hash = Hash::from_slice(&key[LEGACY_RECEIPTS_PREFIX.len()..])
                .map_err(|e| ChainError::Upgrade(e.to_string()))?;
            if let Some(number) = read_header_number(db.as_ref(), &hash)? {
                let receipts: Vec<Receipt> = bincode::deserialize(&value)?;
                write_receipts(db.as_ref(), &hash, number, &receipts)?;
            }
            db.delete(&key)?;
            converted += 1;
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{read_receipts, write_header, write_legacy_receipts};
    use crate::MemoryDatabase;
    use ln_types::Header;

    #[tokio::test]
    async fn nothing_to_do_without_legacy_entries() {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        assert!(upgrade_deduplicate_data(db).is_none());
    }

    #[tokio::test]
    async fn legacy_receipts_are_moved() {
        let db = Arc::new(MemoryDatabase::new());
        let mut hashes = Vec::new();
        for n in 0..(UPGRADE_BATCH_SIZE as u64 + 5) {
            let header = Header {
                number: n,
                ..Header::default()
            };
            write_header(db.as_ref(), &header).unwrap();
            write_legacy_receipts(db.as_ref(), &header.hash(), &[]).unwrap();
            hashes.push((header.hash(), n));
        }
        let mut handle = upgrade_deduplicate_data(db.clone()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        handle.stop().await;

        assert!(db.iter_prefix(LEGACY_RECEIPTS_PREFIX).unwrap().is_empty());
        for (hash, n) in hashes {
            assert!(read_receipts(db.as_ref(), &hash, n).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let db = Arc::new(MemoryDatabase::new());
        write_legacy_receipts(db.as_ref(), &Hash::digest(b"x"), &[]).unwrap();
        let mut handle = upgrade_deduplicate_data(db).unwrap();
        handle.stop().await;
        handle.stop().await;
        assert!(handle.is_finished());
    }
}
