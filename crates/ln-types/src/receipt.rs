use serde::{Deserialize, Serialize};

use crate::{Address, Bloom, Hash};

/// Receipt status for a successfully applied transaction.
pub const RECEIPT_STATUS_SUCCESSFUL: u8 = 1;

/// Receipt status for a failed transaction.
pub const RECEIPT_STATUS_FAILED: u8 = 0;

/// An event emitted while applying a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: Vec<u8>,

    // Derived fields, filled in once the containing block is known.
    pub block_number: u64,
    pub tx_hash: Hash,
    pub tx_index: u32,
    pub block_hash: Hash,
    pub index: u32,

    /// Set when the log was reverted by a chain reorganisation.
    pub removed: bool,
}

/// Outcome of applying one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub status: u8,
    pub cumulative_gas_used: u64,
    pub bloom: Bloom,
    pub logs: Vec<Log>,
    pub tx_hash: Hash,
    pub gas_used: u64,
}

impl Receipt {
    pub fn new(status: u8, cumulative_gas_used: u64, gas_used: u64, tx_hash: Hash, logs: Vec<Log>) -> Self {
        Self {
            status,
            cumulative_gas_used,
            bloom: Bloom::from_logs(&logs),
            logs,
            tx_hash,
            gas_used,
        }
    }

    /// Digest used as the leaf of the receipt root.
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(64 + self.bloom.0.len());
        buf.push(self.status);
        buf.extend_from_slice(&self.cumulative_gas_used.to_be_bytes());
        buf.extend_from_slice(&self.bloom.0);
        buf.extend_from_slice(self.tx_hash.as_bytes());
        for log in &self.logs {
            buf.extend_from_slice(log.address.as_bytes());
            for topic in &log.topics {
                buf.extend_from_slice(topic.as_bytes());
            }
            buf.extend_from_slice(&log.data);
        }
        Hash::digest(&buf)
    }
}
