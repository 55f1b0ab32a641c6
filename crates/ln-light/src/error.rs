use thiserror::Error;

#[derive(Debug, Error)]
pub enum OdrError {
    /// The caller gave up before the retrieval finished.
    #[error("retrieval cancelled")]
    Cancelled,

    #[error("retrieval timed out")]
    Timeout,

    #[error("no peer could serve the request")]
    NoPeers,

    /// A peer answered with data that does not match the request.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("light chain stopped")]
    Stopped,

    #[error("transaction rejected: {0}")]
    Pool(#[from] ln_txpool::TxPoolError),

    #[error("chain error: {0}")]
    Chain(#[from] ln_chain::ChainError),

    #[error("consensus error: {0}")]
    Consensus(#[from] ln_consensus::ConsensusError),
}

impl OdrError {
    /// True for the retrieval-aborted class, as opposed to a definite answer.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout)
    }
}
