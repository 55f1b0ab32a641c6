use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use ln_types::Transaction;
use tracing::{info, warn};

use crate::TxPoolError;

/// Append-only file of local transactions, one `bincode` record each.
#[derive(Debug)]
pub struct TxJournal {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl TxJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Feed every journaled transaction to `add`.  A truncated trailing
    /// record is ignored.
    pub fn load(&mut self, mut add: impl FnMut(Transaction) -> Result<(), TxPoolError>) -> Result<(), TxPoolError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let mut reader = BufReader::new(file);
        let (mut total, mut dropped) = (0usize, 0usize);
        loop {
            let tx: Transaction = match bincode::deserialize_from(&mut reader) {
                Ok(tx) => tx,
                Err(err) => {
                    if !matches!(*err, bincode::ErrorKind::Io(ref io) if io.kind() == ErrorKind::UnexpectedEof) {
                        warn!(%err, "Stopping journal load on corrupt record");
                    }
                    break;
                }
            };
            total += 1;
            if add(tx).is_err() {
                dropped += 1;
            }
        }
        info!(transactions = total, dropped, "Loaded local transaction journal");
        Ok(())
    }

    /// Append one transaction.
    pub fn insert(&mut self, tx: &Transaction) -> Result<(), TxPoolError> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = self.writer.as_mut() {
            bincode::serialize_into(&mut *writer, tx)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Replace the journal with exactly `txs`.
    pub fn rotate(&mut self, txs: &[Transaction]) -> Result<(), TxPoolError> {
        self.writer = None;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("new");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for tx in txs {
                bincode::serialize_into(&mut writer, tx)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        info!(transactions = txs.len(), "Regenerated local transaction journal");
        Ok(())
    }

    pub fn close(&mut self) {
        self.writer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ln_types::{Address, U256};

    fn tx(nonce: u64) -> Transaction {
        Transaction::new(Address([1u8; 20]), nonce, None, U256::zero(), 21_000, U256::one(), Vec::new())
    }

    #[test]
    fn inserted_and_rotated_transactions_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = TxJournal::new(dir.path().join("transactions.rlp"));
        journal.insert(&tx(0)).unwrap();
        journal.insert(&tx(1)).unwrap();

        let mut loaded = Vec::new();
        TxJournal::new(journal.path()).load(|tx| {
            loaded.push(tx.nonce);
            Ok(())
        }).unwrap();
        assert_eq!(loaded, vec![0, 1]);

        journal.rotate(&[tx(5)]).unwrap();
        let mut loaded = Vec::new();
        TxJournal::new(journal.path()).load(|tx| {
            loaded.push(tx.nonce);
            Ok(())
        }).unwrap();
        assert_eq!(loaded, vec![5]);
    }

    #[test]
    fn missing_journal_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = TxJournal::new(dir.path().join("absent"));
        journal.load(|_| panic!("unexpected record")).unwrap();
    }
}
