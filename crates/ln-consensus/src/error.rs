use ln_types::{Address, Hash};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("unknown ancestor {0}")]
    UnknownAncestor(Hash),

    #[error("invalid block number: have {have}, want {want}")]
    InvalidNumber { have: u64, want: u64 },

    #[error("block in the future")]
    FutureBlock,

    #[error("timestamp older than parent")]
    InvalidTimestamp,

    #[error("extra-data too long: {len} > {max}")]
    ExtraDataTooLong { len: usize, max: usize },

    #[error("extra-data 32 byte vanity prefix missing")]
    MissingVanity,

    #[error("extra-data signature suffix missing")]
    MissingSignature,

    #[error("invalid signer list on checkpoint block")]
    InvalidCheckpointSigners,

    #[error("non-zero mix digest")]
    InvalidMixDigest,

    #[error("invalid difficulty: have {have}, want {want}")]
    InvalidDifficulty { have: String, want: String },

    #[error("invalid gas limit: {0}")]
    InvalidGasLimit(String),

    #[error("invalid proof-of-work")]
    InvalidPoW,

    #[error("unauthorized signer {0}")]
    Unauthorized(Address),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("sealing paused while waiting for transactions")]
    WaitTransactions,

    #[error("no signer authorized for sealing")]
    SignerMissing,

    #[error("signing failed: {0}")]
    SignFailed(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
