//! Local block production.
//!
//! One mining session at a time runs as a tracked task: it assembles a
//! block on the current head, publishes it as the pending block, then asks
//! the engine to seal it.  A new head abandons the attempt and starts over.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ln_chain::{BlockChain, StateDb, StateProcessor};
use ln_consensus::{ConsensusEngine, ConsensusError};
use ln_sync::{EventMux, NodeEvent};
use ln_txpool::TxPool;
use ln_types::params::MAXIMUM_EXTRA_DATA_SIZE;
use ln_types::{Address, Block, Header};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::metrics::NodeMetrics;
use crate::NodeError;

struct Session {
    id: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Miner {
    chain: Arc<BlockChain>,
    pool: Arc<TxPool>,
    engine: Arc<ConsensusEngine>,
    mux: EventMux,
    metrics: Arc<NodeMetrics>,

    coinbase: RwLock<Address>,
    extra: RwLock<Vec<u8>>,
    pending: RwLock<Option<(Block, StateDb)>>,

    mining: AtomicBool,
    /// Mining was requested and should resume after a sync.
    should_start: AtomicBool,
    /// Cleared while the downloader is synchronising.
    can_start: AtomicBool,

    session: Mutex<Option<Session>>,
    sessions: AtomicU64,
    shutdown: CancellationToken,
    update: Mutex<Option<JoinHandle<()>>>,
}

impl Miner {
    pub fn new(
        chain: Arc<BlockChain>,
        pool: Arc<TxPool>,
        engine: Arc<ConsensusEngine>,
        mux: EventMux,
        metrics: Arc<NodeMetrics>,
    ) -> Arc<Self> {
        let miner = Arc::new(Self {
            chain,
            pool,
            engine,
            metrics,
            coinbase: RwLock::new(Address::zero()),
            extra: RwLock::new(Vec::new()),
            pending: RwLock::new(None),
            mining: AtomicBool::new(false),
            should_start: AtomicBool::new(false),
            can_start: AtomicBool::new(true),
            session: Mutex::new(None),
            sessions: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            update: Mutex::new(None),
            mux,
        });
        let events = miner.mux.subscribe();
        *miner.update.lock() = Some(tokio::spawn(miner.clone().update(events)));
        miner
    }

    /// Pause mining while the downloader runs.  Stops listening after the
    /// first finished sync so peers cannot keep the miner paused.
    async fn update(self: Arc<Self>, mut events: Receiver<NodeEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(NodeEvent::StartSync) => {
                    self.can_start.store(false, Ordering::SeqCst);
                    if self.mining() {
                        self.halt().await;
                        info!("Mining aborted due to sync");
                    }
                }
                Ok(NodeEvent::DoneSync) | Ok(NodeEvent::FailedSync(_)) => {
                    self.can_start.store(true, Ordering::SeqCst);
                    if self.should_start.load(Ordering::SeqCst) {
                        self.spawn_session();
                    }
                    return;
                }
                Ok(NodeEvent::NewMinedBlock(_)) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
        }
    }

    /// Start mining to `coinbase`.  Deferred while a sync is running.
    pub fn start(self: &Arc<Self>, coinbase: Address) {
        self.should_start.store(true, Ordering::SeqCst);
        self.set_etherbase(coinbase);
        if !self.can_start.load(Ordering::SeqCst) {
            info!("Network syncing, will start miner afterwards");
            return;
        }
        self.spawn_session();
    }

    fn spawn_session(self: &Arc<Self>) {
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return;
        }
        let id = self.sessions.fetch_add(1, Ordering::SeqCst);
        let token = self.shutdown.child_token();
        let task = tokio::spawn(self.clone().mine(id, token.clone()));
        *session = Some(Session { id, token, task });
        self.mining.store(true, Ordering::SeqCst);
        self.metrics.mining_sessions.inc();
        info!(coinbase = %*self.coinbase.read(), "Starting mining operation");
    }

    /// Stop the running session, if any, and wait for it to exit.
    async fn halt(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.token.cancel();
            if let Err(err) = session.task.await {
                warn!(%err, "Mining task panicked");
            }
        }
        self.mining.store(false, Ordering::SeqCst);
    }

    /// Stop mining.  Idempotent.
    pub async fn stop(&self) {
        self.should_start.store(false, Ordering::SeqCst);
        if self.mining() {
            info!("Stopping mining operation");
        }
        self.halt().await;
    }

    /// Stop mining and the sync listener for good.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.stop().await;
        let update = self.update.lock().take();
        if let Some(update) = update {
            let _ = update.await;
        }
        debug!("Miner closed");
    }

    pub fn mining(&self) -> bool {
        self.mining.load(Ordering::SeqCst)
    }

    pub fn set_etherbase(&self, coinbase: Address) {
        *self.coinbase.write() = coinbase;
    }

    pub fn etherbase(&self) -> Address {
        *self.coinbase.read()
    }

    pub fn set_extra(&self, extra: Vec<u8>) -> Result<(), NodeError> {
        if extra.len() > MAXIMUM_EXTRA_DATA_SIZE {
            return Err(NodeError::ExtraDataTooLong {
                len: extra.len(),
                max: MAXIMUM_EXTRA_DATA_SIZE,
            });
        }
        *self.extra.write() = extra;
        Ok(())
    }

    pub fn extra(&self) -> Vec<u8> {
        self.extra.read().clone()
    }

    /// The block being sealed and the state it produces.
    pub fn pending(&self) -> Option<(Block, StateDb)> {
        self.pending.read().clone()
    }

    pub fn pending_block(&self) -> Option<Block> {
        self.pending.read().as_ref().map(|(block, _)| block.clone())
    }

    /// Session task.  A session that ends without being halted clears the
    /// mining flag itself, unless a newer session has replaced it.
    async fn mine(self: Arc<Self>, id: u64, token: CancellationToken) {
        self.mine_blocks(&token).await;
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| s.id == id) {
            *session = None;
            self.mining.store(false, Ordering::SeqCst);
            if !token.is_cancelled() {
                warn!("Mining session ended");
            }
        }
    }

    async fn mine_blocks(&self, token: &CancellationToken) {
        let mut heads = self.chain.subscribe_chain_head_event();
        let mut txs = self.pool.subscribe_new_txs();
        while !token.is_cancelled() {
            if self.chain.is_stopped() {
                info!("Chain stopped, leaving mining loop");
                return;
            }
            // Our own insertions show up here too; the next attempt builds
            // on the current head regardless.
            loop {
                match heads.try_recv() {
                    Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Closed) => return,
                }
            }

            let block = match self.commit_new_work(token).await {
                Ok(Some(block)) => block,
                Ok(None) => return,
                Err(err) => {
                    error!(%err, "Failed to prepare mining work");
                    if !wait_for_change(token, &mut heads, &mut txs).await {
                        return;
                    }
                    continue;
                }
            };

            let attempt = token.child_token();
            let sealed = tokio::select! {
                sealed = self.engine.seal(self.chain.as_ref(), &block, attempt.clone()) => sealed,
                head = heads.recv() => {
                    attempt.cancel();
                    if matches!(head, Err(RecvError::Closed)) {
                        return;
                    }
                    continue;
                }
            };
            match sealed {
                Ok(Some(sealed)) => self.commit_sealed(sealed),
                Ok(None) => {}
                Err(ConsensusError::WaitTransactions) => {
                    trace!("Sealing paused, waiting for transactions");
                    if !wait_for_change(token, &mut heads, &mut txs).await {
                        return;
                    }
                }
                Err(err) => {
                    warn!(%err, number = block.number(), "Block sealing failed");
                    if !wait_for_change(token, &mut heads, &mut txs).await {
                        return;
                    }
                }
            }
        }
    }

    fn commit_sealed(&self, block: Block) {
        let number = block.number();
        let hash = block.hash();
        if let Err(err) = self.chain.insert_block(block.clone()) {
            error!(number, %hash, %err, "Failed writing mined block");
            return;
        }
        self.metrics.mined_blocks.inc();
        info!(number, %hash, txs = block.transactions.len(), "Successfully sealed new block");
        self.mux.post(NodeEvent::NewMinedBlock(block));
    }

    /// Assemble a block on the current head and publish it as pending.
    /// Returns `None` if cancelled while waiting for the block's timestamp.
    async fn commit_new_work(&self, token: &CancellationToken) -> Result<Option<Block>, NodeError> {
        let parent = self.chain.current_block();
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let time = now.max(parent.header.time + 1);
        if time > now + 1 {
            let wait = Duration::from_secs(time - now);
            debug!(?wait, "Mining too far in the future");
            tokio::select! {
                _ = token.cancelled() => return Ok(None),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let mut header = Header {
            parent_hash: parent.hash(),
            coinbase: *self.coinbase.read(),
            number: parent.number() + 1,
            gas_limit: parent.header.gas_limit,
            time,
            extra: self.extra(),
            ..Header::default()
        };
        self.engine.prepare(self.chain.as_ref(), &mut header)?;
        let mut state = self.chain.state_at(&parent.header.state_root)?;

        let mut transactions = Vec::new();
        let mut receipts = Vec::new();
        let mut gas_used = 0;
        for (account, list) in self.pool.pending() {
            for tx in list {
                match StateProcessor.apply_transaction(&header, &tx, transactions.len(), gas_used, &mut state) {
                    Ok(receipt) => {
                        gas_used = receipt.cumulative_gas_used;
                        receipts.push(receipt);
                        transactions.push(tx);
                    }
                    Err(err) => {
                        // Later nonces of this account cannot apply either.
                        trace!(%account, nonce = tx.nonce, %err, "Skipping transaction");
                        break;
                    }
                }
            }
        }
        header.gas_used = gas_used;

        let block = self
            .engine
            .finalize(self.chain.as_ref(), header, &mut state, transactions, &receipts);
        debug!(number = block.number(), txs = block.transactions.len(), "Commit new mining work");
        *self.pending.write() = Some((block.clone(), state));
        Ok(Some(block))
    }
}

/// Wait until the head or the pool changes.  False once mining should end.
async fn wait_for_change<A: Clone, B: Clone>(
    token: &CancellationToken,
    heads: &mut Receiver<A>,
    txs: &mut Receiver<B>,
) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        head = heads.recv() => !matches!(head, Err(RecvError::Closed)),
        tx = txs.recv() => !matches!(tx, Err(RecvError::Closed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountManager;
    use ed25519_dalek::SigningKey;
    use ln_chain::{CacheConfig, Database, Genesis, MemoryDatabase};
    use ln_consensus::Clique;
    use ln_txpool::TxPoolConfig;
    use ln_types::params::TX_GAS;
    use ln_types::{Transaction, U256};

    use crate::accounts::Wallet;

    struct Setup {
        chain: Arc<BlockChain>,
        pool: Arc<TxPool>,
        miner: Arc<Miner>,
        mux: EventMux,
        signer: Address,
    }

    /// Clique chain with period 0: the miner only seals blocks carrying
    /// transactions, so the pending block stays put while idle.
    fn setup() -> Setup {
        let wallet = Wallet::keystore("keystore://miner", vec![SigningKey::from_bytes(&[9u8; 32])]);
        let signer = wallet.accounts()[0];
        let accounts = AccountManager::new(vec![wallet]);

        let genesis = Genesis::dev(signer, 0);
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        genesis.commit(db.as_ref()).unwrap();
        let clique = genesis.config.clique.unwrap();
        let engine = Arc::new(ConsensusEngine::Clique(Clique::new(clique)));
        engine.authorize(signer, accounts.sign_fn(&signer).unwrap());
        let chain = Arc::new(
            BlockChain::new(db, CacheConfig::default(), genesis.config.clone(), engine.clone()).unwrap(),
        );
        let pool = TxPool::new(
            TxPoolConfig {
                journal: std::path::PathBuf::new(),
                ..TxPoolConfig::default()
            },
            genesis.config.clone(),
            chain.clone(),
        )
        .unwrap();
        let mux = EventMux::new();
        let miner = Miner::new(
            chain.clone(),
            pool.clone(),
            engine,
            mux.clone(),
            Arc::new(NodeMetrics::new().unwrap()),
        );
        Setup {
            chain,
            pool,
            miner,
            mux,
            signer,
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_miner_publishes_pending_block() {
        let s = setup();
        s.miner.start(s.signer);
        assert!(s.miner.mining());
        wait_for(|| s.miner.pending_block().is_some()).await;

        let pending = s.miner.pending_block().unwrap();
        assert_eq!(pending.number(), s.chain.current_block().number() + 1);
        assert_eq!(pending.parent_hash(), s.chain.current_block().hash());

        s.miner.stop().await;
        s.miner.stop().await;
        assert!(!s.miner.mining());
        s.miner.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pooled_transactions_are_mined() {
        let s = setup();
        let mut events = s.mux.subscribe();
        s.miner.start(s.signer);

        let tx = Transaction::new(s.signer, 0, Some(Address([7u8; 20])), U256::one(), TX_GAS, U256::one(), Vec::new());
        s.pool.add_local(tx.clone()).unwrap();

        let mined = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(NodeEvent::NewMinedBlock(block)) = events.recv().await {
                    return block;
                }
            }
        })
        .await
        .unwrap();
        assert!(mined.transaction(&tx.hash()).is_some());
        assert_eq!(s.chain.current_block().hash(), mined.hash());
        s.miner.close().await;
        s.pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_pauses_and_resumes_mining() {
        let s = setup();
        s.miner.start(s.signer);
        s.mux.post(NodeEvent::StartSync);
        wait_for(|| !s.miner.mining()).await;

        // Requests made during the sync are deferred.
        s.miner.start(s.signer);
        assert!(!s.miner.mining());

        s.mux.post(NodeEvent::DoneSync);
        wait_for(|| s.miner.mining()).await;
        s.miner.close().await;
        assert!(!s.miner.mining());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_ending_on_its_own_clears_mining_flag() {
        let s = setup();
        s.chain.stop();
        s.miner.start(s.signer);
        wait_for(|| !s.miner.mining()).await;
        assert!(s.miner.session.lock().is_none());

        // A later request starts a fresh session, which ends the same way.
        s.miner.start(s.signer);
        wait_for(|| !s.miner.mining()).await;
        s.miner.close().await;
        assert!(!s.miner.mining());
    }

    #[tokio::test]
    async fn oversized_extra_is_rejected() {
        let s = setup();
        assert!(s.miner.set_extra(vec![0u8; MAXIMUM_EXTRA_DATA_SIZE]).is_ok());
        assert!(matches!(
            s.miner.set_extra(vec![0u8; MAXIMUM_EXTRA_DATA_SIZE + 1]),
            Err(NodeError::ExtraDataTooLong { .. })
        ));
        s.miner.close().await;
    }
}
