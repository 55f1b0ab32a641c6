use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ln_chain::events::EVENT_CHANNEL_CAPACITY;
use ln_chain::ChainHeadEvent;
use ln_txpool::{NewTxsEvent, PoolContent, TxPoolError};
use ln_types::params::TX_GAS;
use ln_types::{Address, Hash, Transaction};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{LightChain, OdrError};

/// Transaction pool of a light node.
///
/// Holds only locally submitted transactions until a new head includes
/// them.  Nonces and balances come from on-demand state retrieval.
pub struct LightTxPool {
    chain: Arc<LightChain>,
    pending: RwLock<HashMap<Hash, Transaction>>,
    relay: broadcast::Sender<NewTxsEvent>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl LightTxPool {
    pub fn new(chain: Arc<LightChain>) -> Arc<Self> {
        let pool = Arc::new(Self {
            pending: RwLock::new(HashMap::new()),
            relay: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            token: CancellationToken::new(),
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
            chain: chain.clone(),
        });
        let task = tokio::spawn(pool.clone().run(chain.subscribe_chain_head_event()));
        *pool.task.lock() = Some(task);
        pool
    }

    async fn run(self: Arc<Self>, mut heads: broadcast::Receiver<ChainHeadEvent>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                event = heads.recv() => match event {
                    Ok(event) => self.on_new_head(event.block.hash()).await,
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }

    /// Drop pending transactions included in the block `hash`.
    async fn on_new_head(&self, hash: Hash) {
        if self.pending.read().is_empty() {
            return;
        }
        match self.chain.get_block_by_hash(&self.token, &hash).await {
            Ok(Some(block)) => {
                let mut pending = self.pending.write();
                for tx in &block.transactions {
                    if pending.remove(&tx.hash()).is_some() {
                        debug!(hash = %tx.hash(), number = block.number(), "Light pool transaction mined");
                    }
                }
            }
            Ok(None) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => warn!(%err, "Failed to check new head for mined transactions"),
        }
    }

    /// Validate `tx` against the head state and keep it for relay.
    pub async fn add(&self, token: &CancellationToken, tx: Transaction) -> Result<(), OdrError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TxPoolError::Stopped.into());
        }
        let hash = tx.hash();
        if self.pending.read().contains_key(&hash) {
            return Err(TxPoolError::AlreadyKnown.into());
        }
        let head = self.chain.current_header();
        if tx.gas > head.gas_limit {
            return Err(TxPoolError::GasLimit.into());
        }
        if tx.gas < TX_GAS {
            return Err(TxPoolError::IntrinsicGas.into());
        }
        let state = self
            .chain
            .state_at(token, &head.state_root)
            .await?
            .ok_or_else(|| OdrError::InvalidResponse(format!("missing state {}", head.state_root)))?;
        if state.nonce(&tx.from) > tx.nonce {
            return Err(TxPoolError::NonceTooLow.into());
        }
        if state.balance(&tx.from) < tx.cost() {
            return Err(TxPoolError::InsufficientFunds.into());
        }

        self.pending.write().insert(hash, tx.clone());
        let _ = self.relay.send(NewTxsEvent { txs: vec![tx] });
        debug!(%hash, "Light pool accepted local transaction");
        Ok(())
    }

    pub fn get(&self, hash: &Hash) -> Option<Transaction> {
        self.pending.read().get(hash).cloned()
    }

    pub fn remove_tx(&self, hash: &Hash) -> Option<Transaction> {
        self.pending.write().remove(hash)
    }

    pub fn pending(&self) -> Vec<Transaction> {
        let mut txs: Vec<Transaction> = self.pending.read().values().cloned().collect();
        txs.sort_by_key(|tx| (tx.from, tx.nonce));
        txs
    }

    /// Light pools never queue; the second map is always empty.
    pub fn content(&self) -> PoolContent {
        let mut pending: BTreeMap<Address, Vec<Transaction>> = BTreeMap::new();
        for tx in self.pending() {
            pending.entry(tx.from).or_default().push(tx);
        }
        (pending, BTreeMap::new())
    }

    pub fn stats(&self) -> (usize, usize) {
        (self.pending.read().len(), 0)
    }

    /// Next nonce for `address`: state nonce plus locally pending ones.
    pub async fn nonce(&self, token: &CancellationToken, address: &Address) -> Result<u64, OdrError> {
        let head = self.chain.current_header();
        let base = self
            .chain
            .state_at(token, &head.state_root)
            .await?
            .map(|state| state.nonce(address))
            .unwrap_or_default();
        let pending = self.pending.read();
        let mut next = base;
        while pending.values().any(|tx| tx.from == *address && tx.nonce == next) {
            next += 1;
        }
        Ok(next)
    }

    pub fn subscribe_new_txs(&self) -> broadcast::Receiver<NewTxsEvent> {
        self.relay.subscribe()
    }

    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Light transaction pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{full_chain, light_chain, SENDER};
    use ln_types::U256;

    fn tx(nonce: u64) -> Transaction {
        Transaction::new(SENDER, nonce, Some(Address([3u8; 20])), U256::one(), TX_GAS, U256::one(), Vec::new())
    }

    #[tokio::test]
    async fn accepts_and_tracks_local_transactions() {
        let full = full_chain(0);
        let pool = LightTxPool::new(Arc::new(light_chain(&full)));
        let token = CancellationToken::new();
        let mut relay = pool.subscribe_new_txs();

        pool.add(&token, tx(0)).await.unwrap();
        pool.add(&token, tx(1)).await.unwrap();
        assert!(matches!(
            pool.add(&token, tx(1)).await,
            Err(OdrError::Pool(TxPoolError::AlreadyKnown))
        ));
        assert_eq!(pool.stats(), (2, 0));
        assert_eq!(pool.nonce(&token, &SENDER).await.unwrap(), 2);
        assert_eq!(relay.recv().await.unwrap().txs[0].nonce, 0);

        let removed = pool.remove_tx(&tx(0).hash()).unwrap();
        assert_eq!(removed.nonce, 0);
        assert_eq!(pool.content().0[&SENDER].len(), 1);
        pool.stop().await;
        assert!(matches!(pool.add(&token, tx(2)).await, Err(OdrError::Pool(TxPoolError::Stopped))));
    }

    #[tokio::test]
    async fn unfunded_sender_is_rejected() {
        let full = full_chain(0);
        let pool = LightTxPool::new(Arc::new(light_chain(&full)));
        let mut poor = tx(0);
        poor.from = Address([7u8; 20]);
        assert!(matches!(
            pool.add(&CancellationToken::new(), poor).await,
            Err(OdrError::Pool(TxPoolError::InsufficientFunds))
        ));
    }
}
