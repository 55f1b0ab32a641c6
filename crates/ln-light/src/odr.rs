use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ln_chain::{BlockChain, ChainError, StateDb};
use ln_types::{Block, Hash, Header, Receipt, U256};

use crate::OdrError;

/// A datum a light node can ask its peers for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OdrRequest {
    HeaderByNumber(u64),
    Block(Hash),
    Receipts(Hash),
    State(Hash),
    Td(Hash),
}

/// Answer to an [`OdrRequest`].  `None` means the serving peer confirmed the
/// datum does not exist.
#[derive(Debug, Clone)]
pub enum OdrResponse {
    Header(Option<Header>),
    Block(Option<Block>),
    Receipts(Option<Vec<Receipt>>),
    State(Option<StateDb>),
    Td(Option<U256>),
}

/// Network side of on-demand retrieval.
#[async_trait]
pub trait OdrBackend: Send + Sync {
    async fn retrieve(&self, request: &OdrRequest) -> Result<OdrResponse, OdrError>;
}

/// Serves retrievals straight out of a full chain, as a light server would.
pub struct ChainOdrBackend {
    chain: Arc<BlockChain>,
    latency: Duration,
}

impl ChainOdrBackend {
    pub fn new(chain: Arc<BlockChain>) -> Self {
        Self {
            chain,
            latency: Duration::ZERO,
        }
    }

    /// Delay every answer by `latency`, simulating a slow peer.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl OdrBackend for ChainOdrBackend {
    async fn retrieve(&self, request: &OdrRequest) -> Result<OdrResponse, OdrError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(match request {
            OdrRequest::HeaderByNumber(number) => OdrResponse::Header(self.chain.get_header_by_number(*number)),
            OdrRequest::Block(hash) => OdrResponse::Block(self.chain.get_block_by_hash(hash)),
            OdrRequest::Receipts(hash) => OdrResponse::Receipts(self.chain.get_receipts_by_hash(hash)),
            OdrRequest::State(root) => match self.chain.state_at(root) {
                Ok(state) => OdrResponse::State(Some(state)),
                Err(ChainError::MissingState(_)) => OdrResponse::State(None),
                Err(err) => return Err(err.into()),
            },
            OdrRequest::Td(hash) => OdrResponse::Td(self.chain.get_td_by_hash(hash)),
        })
    }
}
