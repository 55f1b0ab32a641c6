use ln_types::{ConfigCompatError, Hash};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("database closed")]
    DatabaseClosed,

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("database contains incompatible genesis (have {stored}, new {new})")]
    GenesisMismatch { stored: Hash, new: Hash },

    #[error("genesis has no chain configuration")]
    NoGenesisConfig,

    #[error("{0}")]
    Compat(#[from] ConfigCompatError),

    #[error("missing block {0}")]
    MissingBlock(Hash),

    #[error("missing state {0}")]
    MissingState(Hash),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("consensus error: {0}")]
    Consensus(#[from] ln_consensus::ConsensusError),

    #[error("blockchain is stopped")]
    ChainStopped,

    #[error("upgrade task failed: {0}")]
    Upgrade(String),
}
