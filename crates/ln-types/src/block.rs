use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::derive::derive_root;
use crate::primitives::u256_bytes;
use crate::{Address, Bloom, Hash, Receipt, Transaction, U256};

/// Block header.
///
/// `mix_digest` and `nonce` form the proof-of-work seal; proof-of-authority
/// chains carry their seal in the tail of `extra` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub parent_hash: Hash,
    pub coinbase: Address,
    pub state_root: Hash,
    pub tx_root: Hash,
    pub receipt_root: Hash,
    pub bloom: Bloom,
    pub difficulty: U256,
    /// Sequential block height (genesis = 0).
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Unix timestamp (seconds).
    pub time: u64,
    pub extra: Vec<u8>,
    pub mix_digest: Hash,
    pub nonce: u64,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            parent_hash: Hash::zero(),
            coinbase: Address::zero(),
            state_root: Hash::zero(),
            tx_root: Hash::zero(),
            receipt_root: Hash::zero(),
            bloom: Bloom::default(),
            difficulty: U256::zero(),
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            time: 0,
            extra: Vec::new(),
            mix_digest: Hash::zero(),
            nonce: 0,
        }
    }
}

impl Header {
    fn hash_fields(&self, hasher: &mut Sha256, extra: &[u8]) {
        hasher.update(self.parent_hash.0);
        hasher.update(self.coinbase.0);
        hasher.update(self.state_root.0);
        hasher.update(self.tx_root.0);
        hasher.update(self.receipt_root.0);
        hasher.update(self.bloom.0);
        hasher.update(u256_bytes(&self.difficulty));
        hasher.update(self.number.to_be_bytes());
        hasher.update(self.gas_limit.to_be_bytes());
        hasher.update(self.gas_used.to_be_bytes());
        hasher.update(self.time.to_be_bytes());
        hasher.update((extra.len() as u64).to_be_bytes());
        hasher.update(extra);
    }

    /// Block hash: SHA-256 over every header field.
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.hash_fields(&mut hasher, &self.extra);
        hasher.update(self.mix_digest.0);
        hasher.update(self.nonce.to_be_bytes());
        Hash(hasher.finalize().into())
    }

    /// Hash of the header without the proof-of-work seal fields.
    pub fn hash_no_nonce(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.hash_fields(&mut hasher, &self.extra);
        Hash(hasher.finalize().into())
    }

    /// Hash of the header with the last `seal_len` bytes of `extra` dropped.
    /// Used by engines that store their seal in the extra-data field.
    pub fn hash_without_extra_seal(&self, seal_len: usize) -> Hash {
        let cut = self.extra.len().saturating_sub(seal_len);
        let mut hasher = Sha256::new();
        self.hash_fields(&mut hasher, &self.extra[..cut]);
        hasher.update(self.mix_digest.0);
        hasher.update(self.nonce.to_be_bytes());
        Hash(hasher.finalize().into())
    }
}

/// A header plus the transactions it commits to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble a block, deriving the transaction root, receipt root and bloom
    /// from the supplied contents.
    pub fn new(mut header: Header, transactions: Vec<Transaction>, receipts: &[Receipt]) -> Self {
        let tx_hashes: Vec<Hash> = transactions.iter().map(Transaction::hash).collect();
        header.tx_root = derive_root(&tx_hashes);

        let receipt_hashes: Vec<Hash> = receipts.iter().map(Receipt::hash).collect();
        header.receipt_root = derive_root(&receipt_hashes);

        let mut bloom = Bloom::default();
        for receipt in receipts {
            bloom.accrue(&receipt.bloom);
        }
        header.bloom = bloom;

        Self {
            header,
            transactions,
        }
    }

    /// Block carrying only a header (light clients).
    pub fn with_header(header: Header) -> Self {
        Self {
            header,
            transactions: Vec::new(),
        }
    }

    /// Copy of this block with the seal fields of `header` applied.
    pub fn with_seal(&self, header: Header) -> Self {
        Self {
            header,
            transactions: self.transactions.clone(),
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    pub fn coinbase(&self) -> Address {
        self.header.coinbase
    }

    pub fn difficulty(&self) -> U256 {
        self.header.difficulty
    }

    pub fn transaction(&self, hash: &Hash) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.hash() == *hash)
    }
}
