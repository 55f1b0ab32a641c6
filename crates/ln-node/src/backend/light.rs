use std::sync::Arc;

use async_trait::async_trait;
use ln_bloom::{BloomIndexer, BloomRetrievalMultiplexer, MatcherSession};
use ln_chain::{ChainEvent, ChainHeadEvent, ChainSideEvent, RemovedLogsEvent, StateDb};
use ln_consensus::ChainReader;
use ln_light::{LightChain, LightTxPool};
use ln_txpool::{NewTxsEvent, PoolContent};
use ln_types::{Address, Block, BlockNumber, ChainConfig, Hash, Header, Log, Receipt, Transaction, U256};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{Backend, BackendError};
use crate::accounts::AccountManager;
use crate::gasprice::Oracle;
use crate::les::LES_VERSION;
use crate::metrics::NodeMetrics;

/// Backend of a light node.  Headers are local; bodies, receipts, total
/// difficulties and state come from on-demand retrieval.  There is no
/// local miner, so `pending` means `latest`.
pub struct LightBackend {
    pub(crate) chain: Arc<LightChain>,
    pub(crate) pool: Arc<LightTxPool>,
    pub(crate) indexer: Arc<BloomIndexer>,
    pub(crate) multiplexer: Arc<BloomRetrievalMultiplexer>,
    pub(crate) accounts: Arc<AccountManager>,
    pub(crate) gpo: Oracle,
    pub(crate) metrics: Arc<NodeMetrics>,
    pub(crate) network_id: u64,
}

#[async_trait]
impl Backend for LightBackend {
    fn chain_config(&self) -> ChainConfig {
        self.chain.config()
    }

    fn current_block(&self) -> Block {
        Block::with_header(self.chain.current_header())
    }

    fn set_head(&self, number: u64) -> Result<(), BackendError> {
        Ok(self.chain.set_head(number)?)
    }

    async fn header_by_number(
        &self,
        token: &CancellationToken,
        number: BlockNumber,
    ) -> Result<Option<Header>, BackendError> {
        match number {
            BlockNumber::Pending | BlockNumber::Latest => Ok(Some(self.chain.current_header())),
            BlockNumber::Earliest => Ok(Some(self.chain.genesis())),
            BlockNumber::Number(n) => Ok(self.chain.get_header_by_number_odr(token, n).await?),
        }
    }

    async fn header_by_hash(&self, _token: &CancellationToken, hash: &Hash) -> Result<Option<Header>, BackendError> {
        Ok(self.chain.get_header_by_hash(hash)?)
    }

    async fn block_by_number(
        &self,
        token: &CancellationToken,
        number: BlockNumber,
    ) -> Result<Option<Block>, BackendError> {
        match self.header_by_number(token, number).await? {
            Some(header) => self.block_by_hash(token, &header.hash()).await,
            None => Ok(None),
        }
    }

    async fn block_by_hash(&self, token: &CancellationToken, hash: &Hash) -> Result<Option<Block>, BackendError> {
        Ok(self.chain.get_block_by_hash(token, hash).await?)
    }

    async fn state_and_header_by_number(
        &self,
        token: &CancellationToken,
        number: BlockNumber,
    ) -> Result<Option<(StateDb, Header)>, BackendError> {
        let Some(header) = self.header_by_number(token, number).await? else {
            return Ok(None);
        };
        Ok(self
            .chain
            .state_at(token, &header.state_root)
            .await?
            .map(|state| (state, header)))
    }

    async fn get_receipts(&self, token: &CancellationToken, hash: &Hash) -> Result<Option<Vec<Receipt>>, BackendError> {
        Ok(self.chain.get_receipts(token, hash).await?)
    }

    async fn get_td(&self, token: &CancellationToken, hash: &Hash) -> Result<Option<U256>, BackendError> {
        Ok(self.chain.get_td(token, hash).await?)
    }

    async fn send_tx(&self, token: &CancellationToken, tx: Transaction) -> Result<(), BackendError> {
        self.pool.add(token, tx).await.map_err(|err| {
            let err = BackendError::from(err);
            if let BackendError::TxPool(pool_err) = &err {
                self.metrics.reject_tx(super::rejection_reason(pool_err));
            }
            err
        })
    }

    fn get_pool_transaction(&self, hash: &Hash) -> Option<Transaction> {
        self.pool.get(hash)
    }

    fn get_pool_transactions(&self) -> Vec<Transaction> {
        self.pool.pending()
    }

    async fn get_pool_nonce(&self, token: &CancellationToken, address: &Address) -> Result<u64, BackendError> {
        Ok(self.pool.nonce(token, address).await?)
    }

    fn remove_tx(&self, hash: &Hash) -> Option<Transaction> {
        self.pool.remove_tx(hash)
    }

    fn stats(&self) -> (usize, usize) {
        self.pool.stats()
    }

    fn tx_pool_content(&self) -> PoolContent {
        self.pool.content()
    }

    fn subscribe_new_txs_event(&self) -> broadcast::Receiver<NewTxsEvent> {
        self.pool.subscribe_new_txs()
    }

    fn subscribe_chain_event(&self) -> broadcast::Receiver<ChainEvent> {
        self.chain.subscribe_chain_event()
    }

    fn subscribe_chain_head_event(&self) -> broadcast::Receiver<ChainHeadEvent> {
        self.chain.subscribe_chain_head_event()
    }

    fn subscribe_chain_side_event(&self) -> broadcast::Receiver<ChainSideEvent> {
        self.chain.subscribe_chain_side_event()
    }

    fn subscribe_removed_logs_event(&self) -> broadcast::Receiver<RemovedLogsEvent> {
        self.chain.subscribe_removed_logs_event()
    }

    fn subscribe_logs_event(&self) -> broadcast::Receiver<Vec<Log>> {
        self.chain.subscribe_logs_event()
    }

    fn protocol_version(&self) -> u32 {
        LES_VERSION + 10_000
    }

    fn network_id(&self) -> u64 {
        self.network_id
    }

    async fn suggest_price(&self, token: &CancellationToken) -> Result<U256, BackendError> {
        self.gpo.suggest_price(token).await
    }

    fn bloom_status(&self) -> (u64, u64) {
        (self.indexer.section_size(), self.indexer.sections())
    }

    fn service_filter(&self, session: MatcherSession) -> Result<(), BackendError> {
        self.multiplexer.serve(session)?;
        self.metrics.bloom_retrievals.set(self.multiplexer.served() as i64);
        Ok(())
    }

    fn account_manager(&self) -> Arc<AccountManager> {
        self.accounts.clone()
    }
}
