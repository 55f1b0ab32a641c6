use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ln_chain::{BlockChain, ChainHeadEvent, StateDb};
use ln_types::params::TX_GAS;
use ln_types::{Address, ChainConfig, Hash, Transaction, U256};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{TxJournal, TxPoolConfig, TxPoolError};

/// Interval between checks for expired queued transactions.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Transactions newly made executable.
#[derive(Debug, Clone)]
pub struct NewTxsEvent {
    pub txs: Vec<Transaction>,
}

/// Per-account transactions keyed by nonce.
type TxList = BTreeMap<u64, Transaction>;

/// Pool contents: executable transactions per account, then queued ones.
pub type PoolContent = (BTreeMap<Address, Vec<Transaction>>, BTreeMap<Address, Vec<Transaction>>);

#[derive(Default)]
struct PoolState {
    pending: HashMap<Address, TxList>,
    queue: HashMap<Address, TxList>,
    all: HashMap<Hash, Transaction>,
    locals: HashSet<Address>,
    beats: HashMap<Address, Instant>,
    state: StateDb,
    gas_limit: u64,
    gas_price: U256,
}

impl PoolState {
    fn pending_nonce(&self, address: &Address) -> u64 {
        self.pending
            .get(address)
            .and_then(|list| list.keys().next_back())
            .map(|n| n + 1)
            .unwrap_or_else(|| self.state.nonce(address))
    }

    fn queued_count(&self) -> usize {
        self.queue.values().map(BTreeMap::len).sum()
    }

    fn pending_count(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }

    fn existing(&self, tx: &Transaction) -> Option<&Transaction> {
        self.pending
            .get(&tx.from)
            .and_then(|l| l.get(&tx.nonce))
            .or_else(|| self.queue.get(&tx.from).and_then(|l| l.get(&tx.nonce)))
    }

    fn remove(&mut self, hash: &Hash) -> Option<Transaction> {
        let tx = self.all.remove(hash)?;
        for lists in [&mut self.pending, &mut self.queue] {
            if let Some(list) = lists.get_mut(&tx.from) {
                if list.get(&tx.nonce).map(Transaction::hash) == Some(*hash) {
                    list.remove(&tx.nonce);
                }
                if list.is_empty() {
                    lists.remove(&tx.from);
                }
            }
        }
        Some(tx)
    }

    /// Move queued transactions that became executable into pending.
    fn promote(&mut self, address: &Address, config: &TxPoolConfig) -> Vec<Transaction> {
        let mut promoted = Vec::new();
        let mut next = self.pending_nonce(address);
        while let Some(tx) = self.queue.get_mut(address).and_then(|l| l.remove(&next)) {
            self.pending.entry(*address).or_default().insert(next, tx.clone());
            promoted.push(tx);
            next += 1;
        }
        if self.queue.get(address).is_some_and(BTreeMap::is_empty) {
            self.queue.remove(address);
        }
        // Cap the queue of remote accounts, dropping the highest nonces.
        if !self.locals.contains(address) {
            let mut overflow = Vec::new();
            if let Some(list) = self.queue.get_mut(address) {
                while list.len() as u64 > config.account_queue {
                    if let Some((_, tx)) = list.pop_last() {
                        overflow.push(tx.hash());
                    }
                }
            }
            for hash in overflow {
                trace!(%hash, "Dropping queued transaction over account limit");
                self.remove(&hash);
            }
        }
        promoted
    }

    /// Drop transactions made stale by a new state and re-promote.
    fn reset(&mut self, state: StateDb, gas_limit: u64, config: &TxPoolConfig) -> Vec<Transaction> {
        self.state = state;
        self.gas_limit = gas_limit;
        let mut stale = Vec::new();
        for lists in [&self.pending, &self.queue] {
            for (address, list) in lists {
                let nonce = self.state.nonce(address);
                stale.extend(list.range(..nonce).map(|(_, tx)| tx.hash()));
            }
        }
        for hash in &stale {
            self.remove(hash);
        }
        // Demote everything above a gap back into the queue.
        let addresses: Vec<Address> = self.pending.keys().copied().collect();
        for address in &addresses {
            let base = self.state.nonce(address);
            if let Some(list) = self.pending.remove(address) {
                let mut expected = base;
                for (nonce, tx) in list {
                    if nonce == expected {
                        self.pending.entry(*address).or_default().insert(nonce, tx);
                        expected += 1;
                    } else {
                        self.queue.entry(*address).or_default().insert(nonce, tx);
                    }
                }
            }
        }
        let queued: Vec<Address> = self.queue.keys().copied().collect();
        queued
            .iter()
            .flat_map(|address| self.promote(address, config))
            .collect()
    }
}

/// Pool of transactions waiting for inclusion.
///
/// Transactions whose nonce follows the account's state nonce (or its last
/// pending transaction) are pending; those with a gap are queued until the
/// gap fills.
pub struct TxPool {
    config: TxPoolConfig,
    chain_config: ChainConfig,
    chain: Arc<BlockChain>,
    state: RwLock<PoolState>,
    journal: Mutex<Option<TxJournal>>,
    new_txs: broadcast::Sender<NewTxsEvent>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TxPool {
    /// Build a pool on top of `chain`, loading the local journal if one is
    /// configured.  `journal` must already be resolved against the data
    /// directory.
    pub fn new(
        config: TxPoolConfig,
        chain_config: ChainConfig,
        chain: Arc<BlockChain>,
    ) -> Result<Arc<Self>, TxPoolError> {
        let config = config.sanitize();
        let head = chain.current_block();
        let state = chain.state_at(&head.header.state_root)?;
        let pool = Arc::new(Self {
            state: RwLock::new(PoolState {
                state,
                gas_limit: head.header.gas_limit,
                gas_price: U256::from(config.price_limit),
                ..PoolState::default()
            }),
            journal: Mutex::new(None),
            new_txs: broadcast::channel(ln_chain::events::EVENT_CHANNEL_CAPACITY).0,
            token: CancellationToken::new(),
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
            chain_config,
            config,
            chain: chain.clone(),
        });

        if !pool.config.no_locals && !pool.config.journal.as_os_str().is_empty() {
            let mut journal = TxJournal::new(pool.config.journal.clone());
            if let Err(err) = journal.load(|tx| pool.add_local(tx)) {
                warn!(%err, "Failed to load transaction journal");
            }
            let locals = pool.local_transactions();
            if let Err(err) = journal.rotate(&locals) {
                warn!(%err, "Failed to rotate transaction journal");
            }
            *pool.journal.lock() = Some(journal);
        }

        let task = tokio::spawn(pool.clone().run(chain.subscribe_chain_head_event()));
        *pool.task.lock() = Some(task);
        info!(chain_id = pool.chain_config.chain_id, price_limit = pool.config.price_limit, "Transaction pool started");
        Ok(pool)
    }

    async fn run(self: Arc<Self>, mut heads: broadcast::Receiver<ChainHeadEvent>) {
        let mut evict = tokio::time::interval(EVICTION_INTERVAL);
        let mut journal = tokio::time::interval(self.config.rejournal);
        evict.tick().await;
        journal.tick().await;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                event = heads.recv() => match event {
                    Ok(_) | Err(RecvError::Lagged(_)) => self.reset_to_head(),
                    Err(RecvError::Closed) => return,
                },
                _ = evict.tick() => self.evict_expired(),
                _ = journal.tick() => self.rotate_journal(),
            }
        }
    }

    fn reset_to_head(&self) {
        let head = self.chain.current_block();
        match self.chain.state_at(&head.header.state_root) {
            Ok(state) => {
                let promoted = self.state.write().reset(state, head.header.gas_limit, &self.config);
                debug!(number = head.number(), promoted = promoted.len(), "Transaction pool reset");
                if !promoted.is_empty() {
                    let _ = self.new_txs.send(NewTxsEvent { txs: promoted });
                }
            }
            Err(err) => warn!(%err, "Failed to reset transaction pool state"),
        }
    }

    fn evict_expired(&self) {
        let mut state = self.state.write();
        let now = Instant::now();
        let expired: Vec<Address> = state
            .queue
            .keys()
            .filter(|a| !state.locals.contains(*a))
            .filter(|a| state.beats.get(*a).is_some_and(|b| now.duration_since(*b) > self.config.lifetime))
            .copied()
            .collect();
        for address in expired {
            let hashes: Vec<Hash> = state
                .queue
                .get(&address)
                .map(|l| l.values().map(Transaction::hash).collect())
                .unwrap_or_default();
            for hash in hashes {
                state.remove(&hash);
            }
            state.beats.remove(&address);
            debug!(%address, "Evicted expired queued transactions");
        }
    }

    fn rotate_journal(&self) {
        let locals = self.local_transactions();
        if let Some(journal) = self.journal.lock().as_mut() {
            if let Err(err) = journal.rotate(&locals) {
                warn!(%err, "Failed to rotate local tx journal");
            }
        }
    }

    fn local_transactions(&self) -> Vec<Transaction> {
        let state = self.state.read();
        let mut txs: Vec<Transaction> = state
            .all
            .values()
            .filter(|tx| state.locals.contains(&tx.from))
            .cloned()
            .collect();
        txs.sort_by_key(|tx| (tx.from, tx.nonce));
        txs
    }

    /// Submit a transaction originating from this node.  Locals bypass the
    /// price limit and are journaled.
    pub fn add_local(&self, tx: Transaction) -> Result<(), TxPoolError> {
        let local = !self.config.no_locals;
        self.add(tx, local)
    }

    pub fn add_remote(&self, tx: Transaction) -> Result<(), TxPoolError> {
        self.add(tx, false)
    }

    pub fn add_remotes(&self, txs: Vec<Transaction>) -> Vec<Result<(), TxPoolError>> {
        txs.into_iter().map(|tx| self.add_remote(tx)).collect()
    }

    fn add(&self, tx: Transaction, local: bool) -> Result<(), TxPoolError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TxPoolError::Stopped);
        }
        let hash = tx.hash();
        let promoted = {
            let mut state = self.state.write();
            if state.all.contains_key(&hash) {
                return Err(TxPoolError::AlreadyKnown);
            }
            self.validate(&state, &tx, local)?;

            if let Some(old) = state.existing(&tx).cloned() {
                let threshold = old.gas_price * U256::from(100 + self.config.price_bump) / U256::from(100);
                if tx.gas_price < threshold {
                    return Err(TxPoolError::Underpriced);
                }
                state.remove(&old.hash());
            } else {
                let capacity = (self.config.global_slots + self.config.global_queue) as usize;
                if !local && state.all.len() >= capacity {
                    return Err(TxPoolError::PoolFull);
                }
            }

            let from = tx.from;
            state.all.insert(hash, tx.clone());
            state.queue.entry(from).or_default().insert(tx.nonce, tx.clone());
            state.beats.insert(from, Instant::now());
            if local {
                state.locals.insert(from);
            }
            state.promote(&from, &self.config)
        };
        trace!(%hash, local, "Pooled new transaction");

        if local {
            if let Some(journal) = self.journal.lock().as_mut() {
                if let Err(err) = journal.insert(&tx) {
                    warn!(%err, "Failed to journal local transaction");
                }
            }
        }
        if !promoted.is_empty() {
            let _ = self.new_txs.send(NewTxsEvent { txs: promoted });
        }
        Ok(())
    }

    fn validate(&self, state: &PoolState, tx: &Transaction, local: bool) -> Result<(), TxPoolError> {
        if tx.gas > state.gas_limit {
            return Err(TxPoolError::GasLimit);
        }
        if !local && tx.gas_price < state.gas_price {
            return Err(TxPoolError::Underpriced);
        }
        if state.state.nonce(&tx.from) > tx.nonce {
            return Err(TxPoolError::NonceTooLow);
        }
        if state.state.balance(&tx.from) < tx.cost() {
            return Err(TxPoolError::InsufficientFunds);
        }
        if tx.gas < TX_GAS {
            return Err(TxPoolError::IntrinsicGas);
        }
        Ok(())
    }

    pub fn get(&self, hash: &Hash) -> Option<Transaction> {
        self.state.read().all.get(hash).cloned()
    }

    /// Drop a transaction regardless of its state.
    pub fn remove(&self, hash: &Hash) -> Option<Transaction> {
        self.state.write().remove(hash)
    }

    /// Executable transactions per account, in nonce order.
    pub fn pending(&self) -> BTreeMap<Address, Vec<Transaction>> {
        self.state
            .read()
            .pending
            .iter()
            .map(|(a, l)| (*a, l.values().cloned().collect()))
            .collect()
    }

    pub fn content(&self) -> PoolContent {
        let state = self.state.read();
        let collect = |lists: &HashMap<Address, TxList>| {
            lists
                .iter()
                .map(|(a, l)| (*a, l.values().cloned().collect()))
                .collect()
        };
        (collect(&state.pending), collect(&state.queue))
    }

    /// `(pending, queued)` transaction counts.
    pub fn stats(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.pending_count(), state.queued_count())
    }

    /// Next nonce for `address`, counting pending transactions.
    pub fn nonce(&self, address: &Address) -> u64 {
        self.state.read().pending_nonce(address)
    }

    pub fn price_limit(&self) -> u64 {
        self.config.price_limit
    }

    /// Minimum gas price for remote transactions.
    pub fn gas_price(&self) -> U256 {
        self.state.read().gas_price
    }

    pub fn set_gas_price(&self, price: U256) {
        self.state.write().gas_price = price;
        info!(%price, "Transaction pool price threshold updated");
    }

    pub fn subscribe_new_txs(&self) -> broadcast::Receiver<NewTxsEvent> {
        self.new_txs.subscribe()
    }

    pub fn journal_path(&self) -> Option<PathBuf> {
        self.journal.lock().as_ref().map(|j| j.path().to_path_buf())
    }

    /// Stop the background loop and persist the journal.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.rotate_journal();
        if let Some(journal) = self.journal.lock().as_mut() {
            journal.close();
        }
        info!("Transaction pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ln_chain::{CacheConfig, Database, Genesis, MemoryDatabase};
    use ln_consensus::{ConsensusEngine, Ethash};

    const ALICE: Address = Address([1u8; 20]);
    const BOB: Address = Address([2u8; 20]);

    fn chain() -> (Arc<BlockChain>, ChainConfig) {
        let genesis = Genesis::dev_ethash(&[ALICE]);
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        genesis.commit(db.as_ref()).unwrap();
        let engine = Arc::new(ConsensusEngine::Ethash(Ethash::new_fake()));
        let chain = BlockChain::new(db, CacheConfig::default(), genesis.config.clone(), engine).unwrap();
        (Arc::new(chain), genesis.config)
    }

    fn tx(from: Address, nonce: u64, price: u64) -> Transaction {
        Transaction::new(from, nonce, Some(BOB), U256::one(), TX_GAS, U256::from(price), Vec::new())
    }

    fn pool(config: TxPoolConfig) -> Arc<TxPool> {
        let (chain, chain_config) = chain();
        TxPool::new(config, chain_config, chain).unwrap()
    }

    #[tokio::test]
    async fn gapped_nonces_queue_until_filled() {
        let pool = pool(TxPoolConfig::without_journal());
        pool.add_remote(tx(ALICE, 1, 5)).unwrap();
        assert_eq!(pool.stats(), (0, 1));
        pool.add_remote(tx(ALICE, 0, 5)).unwrap();
        assert_eq!(pool.stats(), (2, 0));
        assert_eq!(pool.nonce(&ALICE), 2);
        let pending = pool.pending();
        let nonces: Vec<u64> = pending[&ALICE].iter().map(|t| t.nonce).collect();
        assert_eq!(nonces, vec![0, 1]);
    }

    #[tokio::test]
    async fn admission_errors_are_reported() {
        let pool = pool(TxPoolConfig {
            price_limit: 3,
            ..TxPoolConfig::without_journal()
        });
        assert!(matches!(pool.add_remote(tx(ALICE, 0, 2)), Err(TxPoolError::Underpriced)));
        pool.add_local(tx(ALICE, 0, 2)).unwrap();
        assert!(matches!(pool.add_local(tx(ALICE, 0, 2)), Err(TxPoolError::AlreadyKnown)));
        assert!(matches!(pool.add_remote(tx(BOB, 0, 5)), Err(TxPoolError::InsufficientFunds)));

        let mut heavy = tx(ALICE, 1, 5);
        heavy.gas = u64::MAX;
        assert!(matches!(pool.add_remote(heavy), Err(TxPoolError::GasLimit)));
    }

    #[tokio::test]
    async fn replacement_requires_price_bump() {
        let pool = pool(TxPoolConfig::without_journal());
        pool.add_remote(tx(ALICE, 0, 100)).unwrap();
        assert!(matches!(pool.add_remote(tx(ALICE, 0, 105)), Err(TxPoolError::Underpriced)));
        let replacement = tx(ALICE, 0, 110);
        pool.add_remote(replacement.clone()).unwrap();
        assert_eq!(pool.stats(), (1, 0));
        assert!(pool.get(&replacement.hash()).is_some());
    }

    #[tokio::test]
    async fn full_pool_rejects_remotes() {
        let pool = pool(TxPoolConfig {
            global_slots: 1,
            global_queue: 0,
            ..TxPoolConfig::without_journal()
        });
        pool.add_remote(tx(ALICE, 0, 5)).unwrap();
        assert!(matches!(pool.add_remote(tx(ALICE, 1, 5)), Err(TxPoolError::PoolFull)));
    }

    #[tokio::test]
    async fn stopped_pool_rejects_everything() {
        let pool = pool(TxPoolConfig::without_journal());
        pool.stop().await;
        pool.stop().await;
        assert!(matches!(pool.add_local(tx(ALICE, 0, 5)), Err(TxPoolError::Stopped)));
    }

    #[tokio::test]
    async fn local_transactions_survive_restart_via_journal() {
        let dir = tempfile::tempdir().unwrap();
        let config = TxPoolConfig {
            journal: dir.path().join("transactions.rlp"),
            ..TxPoolConfig::default()
        };
        let (chain, chain_config) = chain();
        let first = TxPool::new(config.clone(), chain_config.clone(), chain.clone()).unwrap();
        first.add_local(tx(ALICE, 0, 1)).unwrap();
        first.add_remote(tx(ALICE, 1, 1)).unwrap();
        first.stop().await;

        let second = TxPool::new(config, chain_config, chain).unwrap();
        assert_eq!(second.stats().0, 2);
        second.stop().await;
    }
}
