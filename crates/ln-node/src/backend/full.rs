use std::sync::Arc;

use async_trait::async_trait;
use ln_bloom::{BloomIndexer, BloomRetrievalMultiplexer, MatcherSession};
use ln_chain::{BlockChain, ChainEvent, ChainHeadEvent, ChainSideEvent, RemovedLogsEvent, StateDb};
use ln_sync::protocol::ETH63;
use ln_sync::ProtocolManager;
use ln_txpool::{NewTxsEvent, PoolContent, TxPool};
use ln_types::{Address, Block, BlockNumber, ChainConfig, Hash, Header, Log, Receipt, Transaction, U256};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{Backend, BackendError};
use crate::accounts::AccountManager;
use crate::gasprice::Oracle;
use crate::metrics::NodeMetrics;
use crate::miner::Miner;

/// Backend of a node holding the whole chain.  Every lookup is local;
/// `pending` is the miner's block while mining.
pub struct FullBackend {
    pub(crate) chain: Arc<BlockChain>,
    pub(crate) pool: Arc<TxPool>,
    pub(crate) miner: Arc<Miner>,
    pub(crate) protocol: Arc<ProtocolManager>,
    pub(crate) indexer: Arc<BloomIndexer>,
    pub(crate) multiplexer: Arc<BloomRetrievalMultiplexer>,
    pub(crate) accounts: Arc<AccountManager>,
    pub(crate) gpo: Oracle,
    pub(crate) metrics: Arc<NodeMetrics>,
}

impl FullBackend {
    fn pending(&self) -> Option<(Block, StateDb)> {
        if self.miner.mining() {
            self.miner.pending()
        } else {
            None
        }
    }

    fn resolve(&self, number: BlockNumber) -> Option<Block> {
        match number {
            BlockNumber::Pending => self
                .pending()
                .map(|(block, _)| block)
                .or_else(|| Some(self.chain.current_block())),
            BlockNumber::Latest => Some(self.chain.current_block()),
            BlockNumber::Earliest => Some(self.chain.genesis()),
            BlockNumber::Number(n) => self.chain.get_block_by_number(n),
        }
    }
}

#[async_trait]
impl Backend for FullBackend {
    fn chain_config(&self) -> ChainConfig {
        self.protocol.chain_config().clone()
    }

    fn current_block(&self) -> Block {
        self.chain.current_block()
    }

    fn set_head(&self, number: u64) -> Result<(), BackendError> {
        self.protocol.downloader().cancel();
        Ok(self.chain.set_head(number)?)
    }

    async fn header_by_number(
        &self,
        _token: &CancellationToken,
        number: BlockNumber,
    ) -> Result<Option<Header>, BackendError> {
        Ok(match number {
            BlockNumber::Number(n) => self.chain.get_header_by_number(n),
            other => self.resolve(other).map(|block| block.header),
        })
    }

    async fn header_by_hash(&self, _token: &CancellationToken, hash: &Hash) -> Result<Option<Header>, BackendError> {
        Ok(self.chain.get_header_by_hash(hash))
    }

    async fn block_by_number(
        &self,
        _token: &CancellationToken,
        number: BlockNumber,
    ) -> Result<Option<Block>, BackendError> {
        Ok(self.resolve(number))
    }

    async fn block_by_hash(&self, _token: &CancellationToken, hash: &Hash) -> Result<Option<Block>, BackendError> {
        Ok(self.chain.get_block_by_hash(hash))
    }

    async fn state_and_header_by_number(
        &self,
        token: &CancellationToken,
        number: BlockNumber,
    ) -> Result<Option<(StateDb, Header)>, BackendError> {
        if number == BlockNumber::Pending {
            if let Some((block, state)) = self.pending() {
                return Ok(Some((state, block.header)));
            }
        }
        let Some(header) = self.header_by_number(token, number).await? else {
            return Ok(None);
        };
        let state = self.chain.state_at(&header.state_root)?;
        Ok(Some((state, header)))
    }

    async fn get_receipts(&self, _token: &CancellationToken, hash: &Hash) -> Result<Option<Vec<Receipt>>, BackendError> {
        Ok(self.chain.get_receipts_by_hash(hash))
    }

    async fn get_td(&self, _token: &CancellationToken, hash: &Hash) -> Result<Option<U256>, BackendError> {
        Ok(self.chain.get_td_by_hash(hash))
    }

    async fn send_tx(&self, _token: &CancellationToken, tx: Transaction) -> Result<(), BackendError> {
        self.pool.add_local(tx).map_err(|err| {
            self.metrics.reject_tx(super::rejection_reason(&err));
            BackendError::TxPool(err)
        })
    }

    fn get_pool_transaction(&self, hash: &Hash) -> Option<Transaction> {
        self.pool.get(hash)
    }

    fn get_pool_transactions(&self) -> Vec<Transaction> {
        self.pool.pending().into_values().flatten().collect()
    }

    async fn get_pool_nonce(&self, _token: &CancellationToken, address: &Address) -> Result<u64, BackendError> {
        Ok(self.pool.nonce(address))
    }

    fn remove_tx(&self, hash: &Hash) -> Option<Transaction> {
        self.pool.remove(hash)
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
        self.protocol
            .sub_protocols()
            .iter()
            .map(|p| p.version)
            .max()
            .unwrap_or(ETH63)
    }

    fn network_id(&self) -> u64 {
        self.protocol.network_id()
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
