//! Key layout and typed accessors over a [`Database`].
//!
//! Values are `bincode`-encoded.  Numbers in keys are big-endian so prefix
//! iteration walks them in order.

use ln_types::{Block, ChainConfig, Hash, Header, Receipt, Transaction, U256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{ChainError, Database};

/// Current schema version of the chain store.
pub const BLOCKCHAIN_VERSION: u64 = 3;

const HEADER_PREFIX: &[u8] = b"h";
const TD_SUFFIX: &[u8] = b"t";
const CANONICAL_SUFFIX: &[u8] = b"n";
const NUMBER_PREFIX: &[u8] = b"H";
const BODY_PREFIX: &[u8] = b"b";
const RECEIPTS_PREFIX: &[u8] = b"r";
const LOOKUP_PREFIX: &[u8] = b"l";
const STATE_PREFIX: &[u8] = b"s";
const BLOOM_BITS_PREFIX: &[u8] = b"B";
const CONFIG_PREFIX: &[u8] = b"ethereum-config-";

/// Receipts stored by block hash alone, as written by schema version 2.
pub const LEGACY_RECEIPTS_PREFIX: &[u8] = b"receipts-";

const HEAD_BLOCK_KEY: &[u8] = b"LastBlock";
const HEAD_HEADER_KEY: &[u8] = b"LastHeader";
const VERSION_KEY: &[u8] = b"BlockchainVersion";

fn key(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

fn get<T: DeserializeOwned>(db: &dyn Database, key: &[u8]) -> Result<Option<T>, ChainError> {
    match db.get(key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

fn put<T: Serialize>(db: &dyn Database, key: &[u8], value: &T) -> Result<(), ChainError> {
    db.put(key, &bincode::serialize(value)?)
}

pub fn read_canonical_hash(db: &dyn Database, number: u64) -> Result<Option<Hash>, ChainError> {
    get(db, &key(&[HEADER_PREFIX, &number.to_be_bytes(), CANONICAL_SUFFIX]))
}

pub fn write_canonical_hash(db: &dyn Database, hash: &Hash, number: u64) -> Result<(), ChainError> {
    put(db, &key(&[HEADER_PREFIX, &number.to_be_bytes(), CANONICAL_SUFFIX]), hash)
}

pub fn delete_canonical_hash(db: &dyn Database, number: u64) -> Result<(), ChainError> {
    db.delete(&key(&[HEADER_PREFIX, &number.to_be_bytes(), CANONICAL_SUFFIX]))
}

pub fn read_header_number(db: &dyn Database, hash: &Hash) -> Result<Option<u64>, ChainError> {
    get(db, &key(&[NUMBER_PREFIX, hash.as_bytes()]))
}

pub fn read_header(db: &dyn Database, hash: &Hash, number: u64) -> Result<Option<Header>, ChainError> {
    get(db, &key(&[HEADER_PREFIX, &number.to_be_bytes(), hash.as_bytes()]))
}

/// Store a header and its hash → number mapping.
pub fn write_header(db: &dyn Database, header: &Header) -> Result<(), ChainError> {
    let hash = header.hash();
    put(db, &key(&[NUMBER_PREFIX, hash.as_bytes()]), &header.number)?;
    put(
        db,
        &key(&[HEADER_PREFIX, &header.number.to_be_bytes(), hash.as_bytes()]),
        header,
    )
}

pub fn read_body(
    db: &dyn Database,
    hash: &Hash,
    number: u64,
) -> Result<Option<Vec<Transaction>>, ChainError> {
    get(db, &key(&[BODY_PREFIX, &number.to_be_bytes(), hash.as_bytes()]))
}

pub fn write_body(
    db: &dyn Database,
    hash: &Hash,
    number: u64,
    transactions: &[Transaction],
) -> Result<(), ChainError> {
    put(db, &key(&[BODY_PREFIX, &number.to_be_bytes(), hash.as_bytes()]), &transactions)
}

pub fn read_block(db: &dyn Database, hash: &Hash, number: u64) -> Result<Option<Block>, ChainError> {
    let Some(header) = read_header(db, hash, number)? else {
        return Ok(None);
    };
    let transactions = read_body(db, hash, number)?.unwrap_or_default();
    Ok(Some(Block {
        header,
        transactions,
    }))
}

pub fn write_block(db: &dyn Database, block: &Block) -> Result<(), ChainError> {
    write_header(db, &block.header)?;
    write_body(db, &block.hash(), block.number(), &block.transactions)
}

pub fn read_td(db: &dyn Database, hash: &Hash, number: u64) -> Result<Option<U256>, ChainError> {
    get(db, &key(&[HEADER_PREFIX, &number.to_be_bytes(), hash.as_bytes(), TD_SUFFIX]))
}

pub fn write_td(db: &dyn Database, hash: &Hash, number: u64, td: &U256) -> Result<(), ChainError> {
    put(
        db,
        &key(&[HEADER_PREFIX, &number.to_be_bytes(), hash.as_bytes(), TD_SUFFIX]),
        td,
    )
}

pub fn read_receipts(
    db: &dyn Database,
    hash: &Hash,
    number: u64,
) -> Result<Option<Vec<Receipt>>, ChainError> {
    get(db, &key(&[RECEIPTS_PREFIX, &number.to_be_bytes(), hash.as_bytes()]))
}

pub fn write_receipts(
    db: &dyn Database,
    hash: &Hash,
    number: u64,
    receipts: &[Receipt],
) -> Result<(), ChainError> {
    put(db, &key(&[RECEIPTS_PREFIX, &number.to_be_bytes(), hash.as_bytes()]), &receipts)
}

pub fn write_legacy_receipts(db: &dyn Database, hash: &Hash, receipts: &[Receipt]) -> Result<(), ChainError> {
    put(db, &key(&[LEGACY_RECEIPTS_PREFIX, hash.as_bytes()]), &receipts)
}

/// Position of a transaction in the canonical chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLookupEntry {
    pub block_hash: Hash,
    pub block_number: u64,
    pub index: u64,
}

pub fn write_tx_lookup_entries(db: &dyn Database, block: &Block) -> Result<(), ChainError> {
    let block_hash = block.hash();
    for (index, tx) in block.transactions.iter().enumerate() {
        let entry = TxLookupEntry {
            block_hash,
            block_number: block.number(),
            index: index as u64,
        };
        put(db, &key(&[LOOKUP_PREFIX, tx.hash().as_bytes()]), &entry)?;
    }
    Ok(())
}

pub fn delete_tx_lookup_entry(db: &dyn Database, tx_hash: &Hash) -> Result<(), ChainError> {
    db.delete(&key(&[LOOKUP_PREFIX, tx_hash.as_bytes()]))
}

pub fn read_tx_lookup_entry(db: &dyn Database, tx_hash: &Hash) -> Result<Option<TxLookupEntry>, ChainError> {
    get(db, &key(&[LOOKUP_PREFIX, tx_hash.as_bytes()]))
}

pub fn read_head_block_hash(db: &dyn Database) -> Result<Option<Hash>, ChainError> {
    get(db, HEAD_BLOCK_KEY)
}

pub fn write_head_block_hash(db: &dyn Database, hash: &Hash) -> Result<(), ChainError> {
    put(db, HEAD_BLOCK_KEY, hash)
}

pub fn read_head_header_hash(db: &dyn Database) -> Result<Option<Hash>, ChainError> {
    get(db, HEAD_HEADER_KEY)
}

pub fn write_head_header_hash(db: &dyn Database, hash: &Hash) -> Result<(), ChainError> {
    put(db, HEAD_HEADER_KEY, hash)
}

pub fn read_chain_config(db: &dyn Database, genesis: &Hash) -> Result<Option<ChainConfig>, ChainError> {
    get(db, &key(&[CONFIG_PREFIX, genesis.as_bytes()]))
}

pub fn write_chain_config(db: &dyn Database, genesis: &Hash, config: &ChainConfig) -> Result<(), ChainError> {
    put(db, &key(&[CONFIG_PREFIX, genesis.as_bytes()]), config)
}

/// Schema version recorded in the store, if any.
pub fn read_database_version(db: &dyn Database) -> Result<Option<u64>, ChainError> {
    get(db, VERSION_KEY)
}

pub fn write_database_version(db: &dyn Database, version: u64) -> Result<(), ChainError> {
    put(db, VERSION_KEY, &version)
}

pub(crate) fn read_state_blob(db: &dyn Database, root: &Hash) -> Result<Option<Vec<u8>>, ChainError> {
    db.get(&key(&[STATE_PREFIX, root.as_bytes()]))
}

pub(crate) fn write_state_blob(db: &dyn Database, root: &Hash, blob: &[u8]) -> Result<(), ChainError> {
    db.put(&key(&[STATE_PREFIX, root.as_bytes()]), blob)
}

/// Compressed bloom bit vector for `bit` over `section`, keyed by the
/// section's last block hash.
pub fn read_bloom_bits(
    db: &dyn Database,
    bit: u16,
    section: u64,
    head: &Hash,
) -> Result<Option<Vec<u8>>, ChainError> {
    db.get(&key(&[
        BLOOM_BITS_PREFIX,
        &bit.to_be_bytes(),
        &section.to_be_bytes(),
        head.as_bytes(),
    ]))
}

pub fn write_bloom_bits(
    db: &dyn Database,
    bit: u16,
    section: u64,
    head: &Hash,
    bits: &[u8],
) -> Result<(), ChainError> {
    db.put(
        &key(&[
            BLOOM_BITS_PREFIX,
            &bit.to_be_bytes(),
            &section.to_be_bytes(),
            head.as_bytes(),
        ]),
        bits,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDatabase;

    #[test]
    fn block_roundtrips_through_header_and_body() {
        let db = MemoryDatabase::new();
        let block = Block::new(
            Header {
                number: 7,
                ..Header::default()
            },
            Vec::new(),
            &[],
        );
        write_block(&db, &block).unwrap();
        assert_eq!(read_header_number(&db, &block.hash()).unwrap(), Some(7));
        assert_eq!(read_block(&db, &block.hash(), 7).unwrap(), Some(block.clone()));
        assert!(read_block(&db, &block.hash(), 8).unwrap().is_none());
    }

    #[test]
    fn canonical_hashes_can_be_removed() {
        let db = MemoryDatabase::new();
        let hash = Hash::digest(b"b");
        write_canonical_hash(&db, &hash, 3).unwrap();
        assert_eq!(read_canonical_hash(&db, 3).unwrap(), Some(hash));
        delete_canonical_hash(&db, 3).unwrap();
        assert!(read_canonical_hash(&db, 3).unwrap().is_none());
    }

    #[test]
    fn version_is_absent_until_written() {
        let db = MemoryDatabase::new();
        assert!(read_database_version(&db).unwrap().is_none());
        write_database_version(&db, BLOCKCHAIN_VERSION).unwrap();
        assert_eq!(read_database_version(&db).unwrap(), Some(BLOCKCHAIN_VERSION));
    }
}
