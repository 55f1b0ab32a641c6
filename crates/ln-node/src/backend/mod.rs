//! Query surface shared by full and light nodes.
//!
//! The RPC layer only sees [`Backend`].  [`FullBackend`] answers from the
//! local chain; [`LightBackend`] falls through to on-demand retrieval for
//! anything it has not stored.  Both take the caller's cancellation token
//! so an abandoned request releases its retrieval promptly.

mod full;
mod light;

pub use full::FullBackend;
pub use light::LightBackend;

use std::sync::Arc;

use async_trait::async_trait;
use ln_bloom::{BloomError, MatcherSession};
use ln_chain::{ChainError, ChainEvent, ChainHeadEvent, ChainSideEvent, RemovedLogsEvent, StateDb, StateProcessor};
use ln_light::OdrError;
use ln_txpool::{NewTxsEvent, PoolContent, TxPoolError};
use ln_types::{Address, Block, BlockNumber, ChainConfig, Hash, Header, Log, Receipt, Transaction, U256};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::accounts::AccountManager;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The retrieval was cancelled or timed out.  The datum may exist.
    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    TxPool(#[from] TxPoolError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("bloom error: {0}")]
    Bloom(#[from] BloomError),

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("execution failed: {0}")]
    Execution(String),
}

impl From<OdrError> for BackendError {
    fn from(err: OdrError) -> Self {
        match err {
            OdrError::Cancelled | OdrError::Timeout => BackendError::Cancelled,
            OdrError::Pool(err) => BackendError::TxPool(err),
            OdrError::Chain(err) => BackendError::Chain(err),
            other => BackendError::Retrieval(other.to_string()),
        }
    }
}

/// Short label for a pool rejection, used as a metric label.
pub(crate) fn rejection_reason(err: &TxPoolError) -> &'static str {
    match err {
        TxPoolError::AlreadyKnown => "known",
        TxPoolError::NonceTooLow => "nonce_too_low",
        TxPoolError::Underpriced => "underpriced",
        TxPoolError::InsufficientFunds => "insufficient_funds",
        TxPoolError::GasLimit => "gas_limit",
        TxPoolError::IntrinsicGas => "intrinsic_gas",
        TxPoolError::PoolFull => "pool_full",
        TxPoolError::Stopped => "stopped",
        TxPoolError::Journal(_) | TxPoolError::Encoding(_) | TxPoolError::Chain(_) => "other",
    }
}

/// A message executed on top of a state, as `eth_call` does.
pub struct ExecutionContext {
    pub message: Transaction,
    pub state: StateDb,
    pub header: Header,
    pub config: ChainConfig,
}

impl ExecutionContext {
    /// Run the message, ignoring its nonce.  Returns the receipt and the
    /// resulting state.
    pub fn call(mut self) -> Result<(Receipt, StateDb), BackendError> {
        self.message.nonce = self.state.nonce(&self.message.from);
        let receipt = StateProcessor
            .apply_transaction(&self.header, &self.message, 0, 0, &mut self.state)
            .map_err(|err| BackendError::Execution(err.to_string()))?;
        Ok((receipt, self.state))
    }
}

/// Everything the RPC services need from a node.
///
/// Unknown numbers and hashes give `Ok(None)`; a retrieval that could not
/// finish gives [`BackendError::Cancelled`].
#[async_trait]
pub trait Backend: Send + Sync {
    fn chain_config(&self) -> ChainConfig;

    fn current_block(&self) -> Block;

    /// Rewind the local chain to `number`.
    fn set_head(&self, number: u64) -> Result<(), BackendError>;

    async fn header_by_number(
        &self,
        token: &CancellationToken,
        number: BlockNumber,
    ) -> Result<Option<Header>, BackendError>;

    async fn header_by_hash(&self, token: &CancellationToken, hash: &Hash) -> Result<Option<Header>, BackendError>;

    async fn block_by_number(
        &self,
        token: &CancellationToken,
        number: BlockNumber,
    ) -> Result<Option<Block>, BackendError>;

    async fn block_by_hash(&self, token: &CancellationToken, hash: &Hash) -> Result<Option<Block>, BackendError>;

    async fn state_and_header_by_number(
        &self,
        token: &CancellationToken,
        number: BlockNumber,
    ) -> Result<Option<(StateDb, Header)>, BackendError>;

    async fn get_receipts(&self, token: &CancellationToken, hash: &Hash) -> Result<Option<Vec<Receipt>>, BackendError>;

    /// Logs of every transaction in the block `hash`.
    async fn get_logs(&self, token: &CancellationToken, hash: &Hash) -> Result<Option<Vec<Vec<Log>>>, BackendError> {
        Ok(self
            .get_receipts(token, hash)
            .await?
            .map(|receipts| receipts.into_iter().map(|r| r.logs).collect()))
    }

    async fn get_td(&self, token: &CancellationToken, hash: &Hash) -> Result<Option<U256>, BackendError>;

    fn execution_context(&self, message: Transaction, state: StateDb, header: &Header) -> ExecutionContext {
        ExecutionContext {
            message,
            state,
            header: header.clone(),
            config: self.chain_config(),
        }
    }

    /// Submit a signed transaction.  Pool rejections come back unchanged.
    async fn send_tx(&self, token: &CancellationToken, tx: Transaction) -> Result<(), BackendError>;

    fn get_pool_transaction(&self, hash: &Hash) -> Option<Transaction>;

    fn get_pool_transactions(&self) -> Vec<Transaction>;

    async fn get_pool_nonce(&self, token: &CancellationToken, address: &Address) -> Result<u64, BackendError>;

    fn remove_tx(&self, hash: &Hash) -> Option<Transaction>;

    /// Pending and queued transaction counts.
    fn stats(&self) -> (usize, usize);

    fn tx_pool_content(&self) -> PoolContent;

    fn subscribe_new_txs_event(&self) -> broadcast::Receiver<NewTxsEvent>;

    fn subscribe_chain_event(&self) -> broadcast::Receiver<ChainEvent>;

    fn subscribe_chain_head_event(&self) -> broadcast::Receiver<ChainHeadEvent>;

    fn subscribe_chain_side_event(&self) -> broadcast::Receiver<ChainSideEvent>;

    fn subscribe_removed_logs_event(&self) -> broadcast::Receiver<RemovedLogsEvent>;

    fn subscribe_logs_event(&self) -> broadcast::Receiver<Vec<Log>>;

    fn protocol_version(&self) -> u32;

    fn network_id(&self) -> u64;

    async fn suggest_price(&self, token: &CancellationToken) -> Result<U256, BackendError>;

    /// Blocks per bloom section and the number of indexed sections.
    fn bloom_status(&self) -> (u64, u64);

    /// Queue a filter search on the bloom retrieval workers.
    fn service_filter(&self, session: MatcherSession) -> Result<(), BackendError>;

    fn account_manager(&self) -> Arc<AccountManager>;
}
