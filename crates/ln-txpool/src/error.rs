use thiserror::Error;

/// Reasons a transaction is refused by the pool.
#[derive(Debug, Error)]
pub enum TxPoolError {
    #[error("known transaction")]
    AlreadyKnown,

    #[error("nonce too low")]
    NonceTooLow,

    #[error("transaction underpriced")]
    Underpriced,

    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,

    #[error("exceeds block gas limit")]
    GasLimit,

    #[error("intrinsic gas too low")]
    IntrinsicGas,

    #[error("transaction pool is full")]
    PoolFull,

    #[error("transaction pool stopped")]
    Stopped,

    #[error("journal error: {0}")]
    Journal(#[from] std::io::Error),

    #[error("journal encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("chain error: {0}")]
    Chain(#[from] ln_chain::ChainError),
}
