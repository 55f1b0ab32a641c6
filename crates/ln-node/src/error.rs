use ln_types::Address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid sync mode {0}")]
    InvalidSyncMode(String),

    #[error("can't run a full node service in light sync mode, use the light node service")]
    LightSyncUnsupported,

    #[error("light node service requires light sync mode, got {0}")]
    FullSyncUnsupported(String),

    #[error(
        "blockchain DB version mismatch ({have} / {want}); run a database upgrade or start with a fresh data directory"
    )]
    VersionMismatch { have: u64, want: u64 },

    #[error("invalid peer config: light peer count ({light_peers}) >= total peer count ({max_peers})")]
    InvalidPeerConfig { light_peers: usize, max_peers: usize },

    #[error("invalid consensus config: {0}")]
    InvalidConsensusConfig(String),

    #[error("genesis setup failed: {0}")]
    Genesis(#[source] ln_chain::ChainError),

    #[error("etherbase must be explicitly specified")]
    EtherbaseMissing,

    #[error("signer missing for etherbase {0}")]
    SignerMissing(Address),

    #[error("extra-data too long: {len} > {max}")]
    ExtraDataTooLong { len: usize, max: usize },

    #[error("service is {state}, cannot {op}")]
    InvalidState { state: &'static str, op: &'static str },

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transaction pool error: {0}")]
    TxPool(#[from] ln_txpool::TxPoolError),

    #[error("chain error: {0}")]
    Chain(#[from] ln_chain::ChainError),

    #[error("consensus error: {0}")]
    Consensus(#[from] ln_consensus::ConsensusError),

    #[error("sync error: {0}")]
    Sync(#[from] ln_sync::SyncError),

    #[error("bloom error: {0}")]
    Bloom(#[from] ln_bloom::BloomError),

    #[error("retrieval error: {0}")]
    Odr(#[from] ln_light::OdrError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Errors that abort construction or start outright.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidSyncMode(_)
                | Self::LightSyncUnsupported
                | Self::FullSyncUnsupported(_)
                | Self::VersionMismatch { .. }
                | Self::InvalidPeerConfig { .. }
                | Self::InvalidConsensusConfig(_)
                | Self::Genesis(_)
        )
    }
}
