use libp2p_identity::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid sync mode {0:?}")]
    InvalidMode(String),

    #[error("light sync is served by the light protocol, not the full protocol manager")]
    LightModeUnsupported,

    #[error("protocol manager stopped")]
    Stopped,

    #[error("sync already in progress")]
    Busy,

    #[error("sync cancelled")]
    Cancelled,

    #[error("too many peers (max {0})")]
    TooManyPeers(usize),

    #[error("peer {0} already registered")]
    AlreadyRegistered(PeerId),

    #[error("network id mismatch (have {have}, want {want})")]
    NetworkMismatch { have: u64, want: u64 },

    #[error("genesis mismatch")]
    GenesisMismatch,

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("chain error: {0}")]
    Chain(#[from] ln_chain::ChainError),
}
