use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ln_consensus::{ChainReader, ConsensusEngine};
use ln_types::{Block, ChainConfig, Hash, Header, Log, Receipt, Transaction, U256};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::{ChainEvent, ChainFeeds, ChainHeadEvent, ChainSideEvent, RemovedLogsEvent};
use crate::schema::{self, TxLookupEntry};
use crate::{ChainError, Database, StateDb, StateProcessor};

/// State caching policy.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Archive mode: every state is written through to the store.
    pub disabled: bool,
    /// Dirty states held in memory before a flush.
    pub trie_node_limit: usize,
    /// Maximum time between flushes.
    pub trie_time_limit: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            trie_node_limit: 256,
            trie_time_limit: Duration::from_secs(5 * 60),
        }
    }
}

/// Canonical chain manager over a [`Database`].
///
/// Blocks are verified with the consensus engine, executed with the
/// [`StateProcessor`] and made canonical when they carry more total
/// difficulty than the current head.
pub struct BlockChain {
    db: Arc<dyn Database>,
    config: ChainConfig,
    cache_config: CacheConfig,
    engine: Arc<ConsensusEngine>,
    processor: StateProcessor,
    genesis: Block,
    head: RwLock<Block>,
    dirty_states: RwLock<HashMap<Hash, StateDb>>,
    last_flush: Mutex<Instant>,
    write_lock: Mutex<()>,
    stopped: AtomicBool,
    feeds: ChainFeeds,
}

impl BlockChain {
    /// Open the chain stored in `db`.  A genesis block must already be
    /// committed.
    pub fn new(
        db: Arc<dyn Database>,
        cache_config: CacheConfig,
        config: ChainConfig,
        engine: Arc<ConsensusEngine>,
    ) -> Result<Self, ChainError> {
        let genesis_hash =
            schema::read_canonical_hash(db.as_ref(), 0)?.ok_or(ChainError::NoGenesisConfig)?;
        let genesis = schema::read_block(db.as_ref(), &genesis_hash, 0)?
            .ok_or(ChainError::MissingBlock(genesis_hash))?;

        let chain = Self {
            db,
            config,
            cache_config,
            engine,
            processor: StateProcessor,
            head: RwLock::new(genesis.clone()),
            genesis,
            dirty_states: RwLock::new(HashMap::new()),
            last_flush: Mutex::new(Instant::now()),
            write_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
            feeds: ChainFeeds::new(),
        };
        chain.load_last_state()?;
        Ok(chain)
    }

    fn load_last_state(&self) -> Result<(), ChainError> {
        let Some(head_hash) = schema::read_head_block_hash(self.db.as_ref())? else {
            warn!("Empty database, resetting chain");
            return self.reset_to_genesis();
        };
        let Some(mut head) = self.get_block_by_hash(&head_hash) else {
            warn!(hash = %head_hash, "Head block missing, resetting chain");
            return self.reset_to_genesis();
        };
        while !self.has_state(&head.header.state_root) {
            warn!(number = head.number(), "Head state missing, repairing chain");
            head = self
                .get_block(&head.parent_hash(), head.number().saturating_sub(1))
                .ok_or(ChainError::MissingBlock(head.parent_hash()))?;
        }
        let td = self.get_td(&head.hash(), head.number()).unwrap_or_default();
        info!(number = head.number(), hash = %head.hash(), %td, "Loaded most recent local full block");
        schema::write_head_block_hash(self.db.as_ref(), &head.hash())?;
        *self.head.write() = head;
        Ok(())
    }

    fn reset_to_genesis(&self) -> Result<(), ChainError> {
        let hash = self.genesis.hash();
        schema::write_head_block_hash(self.db.as_ref(), &hash)?;
        schema::write_head_header_hash(self.db.as_ref(), &hash)?;
        *self.head.write() = self.genesis.clone();
        Ok(())
    }

    pub fn db(&self) -> Arc<dyn Database> {
        self.db.clone()
    }

    pub fn engine(&self) -> Arc<ConsensusEngine> {
        self.engine.clone()
    }

    pub fn genesis(&self) -> Block {
        self.genesis.clone()
    }

    pub fn current_block(&self) -> Block {
        self.head.read().clone()
    }

    pub fn current_header(&self) -> Header {
        self.head.read().header.clone()
    }

    pub fn get_header_by_hash(&self, hash: &Hash) -> Option<Header> {
        let number = self.get_block_number(hash)?;
        found(schema::read_header(self.db.as_ref(), hash, number))
    }

    pub fn get_header_by_number(&self, number: u64) -> Option<Header> {
        let hash = found(schema::read_canonical_hash(self.db.as_ref(), number))?;
        found(schema::read_header(self.db.as_ref(), &hash, number))
    }

    pub fn get_block_number(&self, hash: &Hash) -> Option<u64> {
        found(schema::read_header_number(self.db.as_ref(), hash))
    }

    pub fn get_block(&self, hash: &Hash, number: u64) -> Option<Block> {
        found(schema::read_block(self.db.as_ref(), hash, number))
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Option<Block> {
        let number = self.get_block_number(hash)?;
        self.get_block(hash, number)
    }

    pub fn get_block_by_number(&self, number: u64) -> Option<Block> {
        let hash = found(schema::read_canonical_hash(self.db.as_ref(), number))?;
        self.get_block(&hash, number)
    }

    pub fn has_block(&self, hash: &Hash) -> bool {
        self.get_block_by_hash(hash).is_some()
    }

    pub fn get_td(&self, hash: &Hash, number: u64) -> Option<U256> {
        found(schema::read_td(self.db.as_ref(), hash, number))
    }

    pub fn get_td_by_hash(&self, hash: &Hash) -> Option<U256> {
        let number = self.get_block_number(hash)?;
        self.get_td(hash, number)
    }

    pub fn get_receipts_by_hash(&self, hash: &Hash) -> Option<Vec<Receipt>> {
        let number = self.get_block_number(hash)?;
        found(schema::read_receipts(self.db.as_ref(), hash, number))
    }

    /// A canonical transaction and its position.
    pub fn get_transaction(&self, hash: &Hash) -> Option<(Transaction, TxLookupEntry)> {
        let entry = found(schema::read_tx_lookup_entry(self.db.as_ref(), hash))?;
        let block = self.get_block(&entry.block_hash, entry.block_number)?;
        let tx = block.transactions.get(entry.index as usize)?.clone();
        Some((tx, entry))
    }

    pub fn has_state(&self, root: &Hash) -> bool {
        self.state_at(root).is_ok()
    }

    /// State as of the head block.
    pub fn state(&self) -> Result<StateDb, ChainError> {
        let root = self.head.read().header.state_root;
        self.state_at(&root)
    }

    pub fn state_at(&self, root: &Hash) -> Result<StateDb, ChainError> {
        if let Some(state) = self.dirty_states.read().get(root) {
            return Ok(state.clone());
        }
        StateDb::load(self.db.as_ref(), root)?.ok_or(ChainError::MissingState(*root))
    }

    pub fn subscribe_chain_event(&self) -> broadcast::Receiver<ChainEvent> {
        self.feeds.chain.subscribe()
    }

    pub fn subscribe_chain_head_event(&self) -> broadcast::Receiver<ChainHeadEvent> {
        self.feeds.head.subscribe()
    }

    pub fn subscribe_chain_side_event(&self) -> broadcast::Receiver<ChainSideEvent> {
        self.feeds.side.subscribe()
    }

    pub fn subscribe_removed_logs_event(&self) -> broadcast::Receiver<RemovedLogsEvent> {
        self.feeds.removed_logs.subscribe()
    }

    pub fn subscribe_logs_event(&self) -> broadcast::Receiver<Vec<Log>> {
        self.feeds.logs.subscribe()
    }

    /// Verify, execute and store `block`.  Known blocks are ignored.
    pub fn insert_block(&self, block: Block) -> Result<(), ChainError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ChainError::ChainStopped);
        }
        let _guard = self.write_lock.lock();
        let hash = block.hash();
        let number = block.number();
        if self.has_block(&hash) {
            debug!(number, %hash, "Ignoring already known block");
            return Ok(());
        }

        self.engine.verify_header(self, &block.header, true)?;
        let parent = self
            .get_block(&block.parent_hash(), number - 1)
            .ok_or(ChainError::MissingBlock(block.parent_hash()))?;
        let mut state = self.state_at(&parent.header.state_root)?;
        let (receipts, gas_used) =
            self.processor
                .process(&block.header, &block.transactions, &mut state)?;
        if gas_used != block.header.gas_used {
            return Err(ChainError::InvalidBlock(format!(
                "gas used mismatch: have {}, want {gas_used}",
                block.header.gas_used
            )));
        }
        let expected = self.engine.finalize(
            self,
            block.header.clone(),
            &mut state,
            block.transactions.clone(),
            &receipts,
        );
        if expected.header.state_root != block.header.state_root {
            return Err(ChainError::InvalidBlock("state root mismatch".into()));
        }
        if expected.header.receipt_root != block.header.receipt_root {
            return Err(ChainError::InvalidBlock("receipt root mismatch".into()));
        }
        if expected.header.tx_root != block.header.tx_root {
            return Err(ChainError::InvalidBlock("transaction root mismatch".into()));
        }

        let receipts = with_block_context(receipts, &hash, number);
        let parent_td = self
            .get_td(&parent.hash(), parent.number())
            .ok_or(ChainError::MissingBlock(parent.hash()))?;
        let td = parent_td + block.difficulty();

        let db = self.db.as_ref();
        schema::write_block(db, &block)?;
        schema::write_td(db, &hash, number, &td)?;
        schema::write_receipts(db, &hash, number, &receipts)?;
        self.store_state(state)?;

        let head = self.current_block();
        let head_td = self.get_td(&head.hash(), head.number()).unwrap_or_default();
        if td > head_td {
            self.write_canonical(&head, &block)?;
            let logs: Vec<Log> = receipts.iter().flat_map(|r| r.logs.clone()).collect();
            debug!(number, %hash, txs = block.transactions.len(), "Inserted new block");
            let _ = self.feeds.chain.send(ChainEvent {
                block: block.clone(),
                hash,
                logs: logs.clone(),
            });
            if !logs.is_empty() {
                let _ = self.feeds.logs.send(logs);
            }
            let _ = self.feeds.head.send(ChainHeadEvent { block });
        } else {
            debug!(number, %hash, "Inserted forked block");
            let _ = self.feeds.side.send(ChainSideEvent { block });
        }
        Ok(())
    }

    /// Make `new_head` canonical, unwinding the old chain back to the
    /// common ancestor.
    fn write_canonical(&self, old_head: &Block, new_head: &Block) -> Result<(), ChainError> {
        let db = self.db.as_ref();
        let mut old_chain = Vec::new();
        let mut new_chain = Vec::new();
        let mut old = old_head.clone();
        let mut new = new_head.clone();

        while old.number() > new.number() {
            let parent = self.parent_of(&old)?;
            old_chain.push(std::mem::replace(&mut old, parent));
        }
        while new.number() > old.number() {
            let parent = self.parent_of(&new)?;
            new_chain.push(std::mem::replace(&mut new, parent));
        }
        while old.hash() != new.hash() {
            let old_parent = self.parent_of(&old)?;
            let new_parent = self.parent_of(&new)?;
            old_chain.push(std::mem::replace(&mut old, old_parent));
            new_chain.push(std::mem::replace(&mut new, new_parent));
        }

        if !old_chain.is_empty() {
            info!(
                number = old.number(),
                drop = old_chain.len(),
                add = new_chain.len(),
                "Chain split detected"
            );
        }
        let mut removed = Vec::new();
        for block in &old_chain {
            for tx in &block.transactions {
                schema::delete_tx_lookup_entry(db, &tx.hash())?;
            }
            if let Some(receipts) = self.get_receipts_by_hash(&block.hash()) {
                removed.extend(receipts.into_iter().flat_map(|r| r.logs).map(|mut log| {
                    log.removed = true;
                    log
                }));
            }
        }
        for block in new_chain.iter().rev() {
            schema::write_canonical_hash(db, &block.hash(), block.number())?;
            schema::write_tx_lookup_entries(db, block)?;
        }
        for number in new_head.number() + 1..=old_head.number() {
            schema::delete_canonical_hash(db, number)?;
        }
        schema::write_head_block_hash(db, &new_head.hash())?;
        schema::write_head_header_hash(db, &new_head.hash())?;
        *self.head.write() = new_head.clone();

        if !removed.is_empty() {
            let _ = self.feeds.removed_logs.send(RemovedLogsEvent { logs: removed });
        }
        for block in old_chain {
            let _ = self.feeds.side.send(ChainSideEvent { block });
        }
        Ok(())
    }

    fn parent_of(&self, block: &Block) -> Result<Block, ChainError> {
        self.get_block(&block.parent_hash(), block.number().saturating_sub(1))
            .ok_or(ChainError::MissingBlock(block.parent_hash()))
    }

    fn store_state(&self, state: StateDb) -> Result<(), ChainError> {
        if self.cache_config.disabled {
            state.commit(self.db.as_ref())?;
            return Ok(());
        }
        let root = state.root();
        let len = {
            let mut dirty = self.dirty_states.write();
            dirty.insert(root, state);
            dirty.len()
        };
        let stale = self.last_flush.lock().elapsed() >= self.cache_config.trie_time_limit;
        if len > self.cache_config.trie_node_limit || stale {
            self.flush_states()?;
        }
        Ok(())
    }

    fn flush_states(&self) -> Result<(), ChainError> {
        let dirty: Vec<StateDb> = self.dirty_states.write().drain().map(|(_, s)| s).collect();
        for state in &dirty {
            state.commit(self.db.as_ref())?;
        }
        *self.last_flush.lock() = Instant::now();
        debug!(states = dirty.len(), "Flushed dirty states");
        Ok(())
    }

    /// Rewind the canonical chain to `number`, further if the state at that
    /// block is unavailable.
    pub fn set_head(&self, number: u64) -> Result<(), ChainError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ChainError::ChainStopped);
        }
        let _guard = self.write_lock.lock();
        let head = self.current_block();
        if number >= head.number() {
            return Ok(());
        }
        warn!(from = head.number(), to = number, "Rewinding blockchain");

        let mut target = self
            .get_block_by_number(number)
            .ok_or(ChainError::MissingBlock(Hash::zero()))?;
        while !self.has_state(&target.header.state_root) && target.number() > 0 {
            target = self.parent_of(&target)?;
        }

        let db = self.db.as_ref();
        for n in target.number() + 1..=head.number() {
            if let Some(block) = self.get_block_by_number(n) {
                for tx in &block.transactions {
                    schema::delete_tx_lookup_entry(db, &tx.hash())?;
                }
            }
            schema::delete_canonical_hash(db, n)?;
        }
        schema::write_head_block_hash(db, &target.hash())?;
        schema::write_head_header_hash(db, &target.hash())?;
        *self.head.write() = target;
        Ok(())
    }

    /// Flush cached state and refuse further writes.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.write_lock.lock();
        if let Err(err) = self.flush_states() {
            warn!(%err, "Failed to flush state on shutdown");
        }
        info!("Blockchain manager stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl ChainReader for BlockChain {
    fn config(&self) -> ChainConfig {
        self.config.clone()
    }

    fn current_header(&self) -> Header {
        BlockChain::current_header(self)
    }

    fn get_header(&self, hash: &Hash, number: u64) -> Option<Header> {
        found(schema::read_header(self.db.as_ref(), hash, number))
    }

    fn get_header_by_number(&self, number: u64) -> Option<Header> {
        BlockChain::get_header_by_number(self, number)
    }

    fn get_header_by_hash(&self, hash: &Hash) -> Option<Header> {
        BlockChain::get_header_by_hash(self, hash)
    }
}

fn found<T>(result: Result<Option<T>, ChainError>) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(err) => {
            debug!(%err, "Chain lookup failed");
            None
        }
    }
}

/// Fill the block-dependent fields of every log.
fn with_block_context(mut receipts: Vec<Receipt>, hash: &Hash, number: u64) -> Vec<Receipt> {
    let mut index = 0u32;
    for receipt in &mut receipts {
        for log in &mut receipt.logs {
            log.block_hash = *hash;
            log.block_number = number;
            log.index = index;
            index += 1;
        }
    }
    receipts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::Genesis;
    use crate::MemoryDatabase;
    use ln_consensus::Ethash;
    use ln_types::params::TX_GAS;
    use ln_types::Address;

    fn new_chain(genesis: &Genesis) -> BlockChain {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        genesis.commit(db.as_ref()).unwrap();
        let engine = Arc::new(ConsensusEngine::Ethash(Ethash::new_fake()));
        BlockChain::new(db, CacheConfig::default(), genesis.config.clone(), engine).unwrap()
    }

    /// Build and seal (fake) a child of `parent` with `txs`.
    fn make_block(chain: &BlockChain, parent: &Block, txs: Vec<Transaction>, time_step: u64) -> Block {
        let mut header = Header {
            parent_hash: parent.hash(),
            number: parent.number() + 1,
            gas_limit: parent.header.gas_limit,
            time: parent.header.time + time_step,
            coinbase: Address([0xaa; 20]),
            ..Header::default()
        };
        chain.engine.prepare(chain, &mut header).unwrap();
        let mut state = chain.state_at(&parent.header.state_root).unwrap();
        let (receipts, gas_used) = StateProcessor.process(&header, &txs, &mut state).unwrap();
        header.gas_used = gas_used;
        chain.engine.finalize(chain, header, &mut state, txs, &receipts)
    }

    #[test]
    fn inserted_block_becomes_head_and_is_queryable() {
        let sender = Address([1u8; 20]);
        let chain = new_chain(&Genesis::dev_ethash(&[sender]));
        let mut heads = chain.subscribe_chain_head_event();
        let tx = Transaction::new(sender, 0, Some(Address([2u8; 20])), U256::from(5), TX_GAS, U256::one(), b"hi".to_vec());
        let block = make_block(&chain, &chain.genesis(), vec![tx.clone()], 10);
        chain.insert_block(block.clone()).unwrap();

        assert_eq!(chain.current_block().hash(), block.hash());
        assert_eq!(chain.get_block_by_number(1).unwrap().hash(), block.hash());
        let receipts = chain.get_receipts_by_hash(&block.hash()).unwrap();
        assert_eq!(receipts[0].logs[0].block_hash, block.hash());
        assert_eq!(chain.get_transaction(&tx.hash()).unwrap().1.block_number, 1);
        assert!(chain.get_td_by_hash(&block.hash()).unwrap() > chain.genesis().difficulty());
        assert_eq!(heads.try_recv().unwrap().block.hash(), block.hash());
    }

    #[test]
    fn tampered_state_root_is_rejected() {
        let chain = new_chain(&Genesis::dev_ethash(&[]));
        let mut block = make_block(&chain, &chain.genesis(), Vec::new(), 10);
        block.header.state_root = Hash::digest(b"bogus");
        assert!(matches!(
            chain.insert_block(block),
            Err(ChainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn heavier_fork_reorganises_and_reports_side_blocks() {
        let chain = new_chain(&Genesis::dev_ethash(&[]));
        let genesis = chain.genesis();
        // Slow blocks lower difficulty, fast ones raise it.
        let a1 = make_block(&chain, &genesis, Vec::new(), 30);
        chain.insert_block(a1.clone()).unwrap();
        let mut side = chain.subscribe_chain_side_event();

        let b1 = make_block(&chain, &genesis, Vec::new(), 1);
        chain.insert_block(b1.clone()).unwrap();
        assert_eq!(chain.current_block().hash(), b1.hash());
        assert_eq!(side.try_recv().unwrap().block.hash(), a1.hash());
        assert_eq!(chain.get_block_by_number(1).unwrap().hash(), b1.hash());
    }

    #[test]
    fn set_head_rewinds_canonical_chain() {
        let chain = new_chain(&Genesis::dev_ethash(&[]));
        let mut parent = chain.genesis();
        for _ in 0..3 {
            let block = make_block(&chain, &parent, Vec::new(), 10);
            chain.insert_block(block.clone()).unwrap();
            parent = block;
        }
        chain.set_head(1).unwrap();
        assert_eq!(chain.current_block().number(), 1);
        assert!(chain.get_block_by_number(2).is_none());
    }

    #[test]
    fn stopped_chain_rejects_writes() {
        let chain = new_chain(&Genesis::dev_ethash(&[]));
        let block = make_block(&chain, &chain.genesis(), Vec::new(), 10);
        chain.stop();
        assert!(matches!(chain.insert_block(block), Err(ChainError::ChainStopped)));
        assert!(matches!(chain.set_head(0), Err(ChainError::ChainStopped)));
    }

    #[test]
    fn reopened_chain_resumes_from_flushed_head() {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let genesis = Genesis::dev_ethash(&[]);
        genesis.commit(db.as_ref()).unwrap();
        let engine = Arc::new(ConsensusEngine::Ethash(Ethash::new_fake()));
        let chain = BlockChain::new(db.clone(), CacheConfig::default(), genesis.config.clone(), engine.clone()).unwrap();
        let block = make_block(&chain, &chain.genesis(), Vec::new(), 10);
        chain.insert_block(block.clone()).unwrap();
        chain.stop();

        let reopened = BlockChain::new(db, CacheConfig::default(), genesis.config, engine).unwrap();
        assert_eq!(reopened.current_block().hash(), block.hash());
    }
}
