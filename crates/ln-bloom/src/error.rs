use thiserror::Error;

#[derive(Debug, Error)]
pub enum BloomError {
    #[error("section size {0} is not a positive multiple of 8")]
    InvalidSectionSize(u64),

    #[error("matcher section size {matcher} differs from indexed section size {indexed}")]
    SectionSizeMismatch { matcher: u64, indexed: u64 },

    #[error("bloom for block {index} added out of order (expected {expected})")]
    OutOfOrder { index: u64, expected: u64 },

    #[error("bit index {0} out of range")]
    BitOutOfRange(usize),

    #[error("section {0} has not been indexed")]
    SectionUnavailable(u64),

    #[error("bloom retrieval multiplexer closed")]
    Closed,

    #[error("chain error: {0}")]
    Chain(#[from] ln_chain::ChainError),
}
