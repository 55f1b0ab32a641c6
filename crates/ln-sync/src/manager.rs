use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libp2p_identity::PeerId;
use ln_chain::BlockChain;
use ln_consensus::ConsensusEngine;
use ln_txpool::TxPool;
use ln_types::{Block, ChainConfig, Transaction};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::peer::{PeerInfo, PeerSet};
use crate::protocol::{decode_message, encode_message, ProtocolDescriptor, SyncMessage, ETH62, ETH63};
use crate::{Downloader, EventMux, NodeEvent, SyncError, SyncMode};

const OUTBOUND_CAPACITY: usize = 256;

/// An encoded message waiting to be gossiped by the p2p layer.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub topic: &'static str,
    pub payload: Vec<u8>,
}

/// Drives chain synchronisation and transaction/block propagation for the
/// full protocol.
///
/// The manager never touches sockets: peers are registered by the p2p layer,
/// inbound payloads are fed to [`ProtocolManager::handle_message`], and
/// outbound gossip is published on [`ProtocolManager::subscribe_outbound`].
pub struct ProtocolManager {
    network_id: u64,
    chain_config: ChainConfig,
    chain: Arc<BlockChain>,
    txpool: Arc<TxPool>,
    engine: Arc<ConsensusEngine>,
    mux: EventMux,
    downloader: Arc<Downloader>,
    peers: PeerSet,
    sub_protocols: Vec<ProtocolDescriptor>,
    /// Set once the node is synced (or mining locally) and may take remote
    /// transactions.
    accept_txs: AtomicBool,
    fast_sync: AtomicBool,
    outbound: broadcast::Sender<Outbound>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ProtocolManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_config: &ChainConfig,
        mode: SyncMode,
        network_id: u64,
        mux: EventMux,
        txpool: Arc<TxPool>,
        engine: Arc<ConsensusEngine>,
        chain: Arc<BlockChain>,
    ) -> Result<Arc<Self>, SyncError> {
        if !mode.is_valid() {
            return Err(SyncError::InvalidMode(mode.to_string()));
        }
        if mode == SyncMode::Light {
            return Err(SyncError::LightModeUnsupported);
        }
        let mut mode = mode;
        if mode == SyncMode::Fast && chain.current_block().number() > 0 {
            warn!("Blockchain not empty, fast sync disabled");
            mode = SyncMode::Full;
        }
        let fast = mode == SyncMode::Fast;

        // Fast sync needs the state messages only the newer version carries.
        let sub_protocols = [ETH63, ETH62]
            .into_iter()
            .filter(|v| !(fast && *v < ETH63))
            .map(ProtocolDescriptor::eth)
            .collect();

        info!(network = network_id, %mode, "Initialising protocol manager");
        Ok(Arc::new(Self {
            downloader: Arc::new(Downloader::new(mode, chain.clone(), mux.clone())),
            network_id,
            chain_config: chain_config.clone(),
            chain,
            txpool,
            engine,
            mux,
            peers: PeerSet::new(0),
            sub_protocols,
            accept_txs: AtomicBool::new(false),
            fast_sync: AtomicBool::new(fast),
            outbound: broadcast::channel(OUTBOUND_CAPACITY).0,
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn network_id(&self) -> u64 {
        self.network_id
    }

    pub fn chain_config(&self) -> &ChainConfig {
        &self.chain_config
    }

    pub fn mode(&self) -> SyncMode {
        self.downloader.mode()
    }

    pub fn sub_protocols(&self) -> &[ProtocolDescriptor] {
        &self.sub_protocols
    }

    pub fn downloader(&self) -> Arc<Downloader> {
        self.downloader.clone()
    }

    pub fn accept_txs(&self) -> bool {
        self.accept_txs.load(Ordering::SeqCst)
    }

    pub fn set_accept_txs(&self, accept: bool) {
        self.accept_txs.store(accept, Ordering::SeqCst);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn max_peers(&self) -> usize {
        self.peers.max_peers()
    }

    pub fn subscribe_outbound(&self) -> broadcast::Receiver<Outbound> {
        self.outbound.subscribe()
    }

    /// Launch the broadcast loops with room for `max_peers` peers.
    pub fn start(self: &Arc<Self>, max_peers: usize) {
        self.peers.set_max_peers(max_peers);
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.clone().tx_broadcast_loop()));
        tasks.push(tokio::spawn(self.clone().mined_broadcast_loop()));
        info!(max_peers, protocols = self.sub_protocols.len(), "Protocol manager started");
    }

    /// Cancel any sync in flight and wait for every loop to exit.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping protocol manager");
        self.downloader.terminate();
        self.token.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.peers.clear();
        info!("Protocol manager stopped");
    }

    async fn tx_broadcast_loop(self: Arc<Self>) {
        let mut txs = self.txpool.subscribe_new_txs();
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                event = txs.recv() => match event {
                    Ok(event) => self.broadcast_txs(event.txs),
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "Transaction broadcast lagging"),
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }

    async fn mined_broadcast_loop(self: Arc<Self>) {
        let mut events = self.mux.subscribe();
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                event = events.recv() => match event {
                    Ok(NodeEvent::NewMinedBlock(block)) => self.broadcast_block(block),
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }

    fn publish(&self, msg: &SyncMessage) {
        match encode_message(msg) {
            Ok(payload) => {
                let _ = self.outbound.send(Outbound {
                    topic: msg.topic(),
                    payload,
                });
            }
            Err(err) => warn!(%err, "Failed to encode protocol message"),
        }
    }

    fn broadcast_txs(&self, txs: Vec<Transaction>) {
        trace!(count = txs.len(), "Broadcasting transactions");
        self.publish(&SyncMessage::Transactions(txs));
    }

    fn broadcast_block(&self, block: Block) {
        let td = self.chain.get_td_by_hash(&block.hash()).unwrap_or_default();
        debug!(number = block.number(), hash = %block.hash(), "Propagating mined block");
        self.publish(&SyncMessage::NewBlock { block, td });
    }

    /// Handshake announcing our chain.
    pub fn status(&self) -> SyncMessage {
        let head = self.chain.current_block();
        SyncMessage::Status {
            network_id: self.network_id,
            td: self.chain.get_td_by_hash(&head.hash()).unwrap_or_default(),
            head: head.hash(),
            genesis: self.chain.genesis().hash(),
        }
    }

    pub fn unregister_peer(&self, peer: &PeerId) {
        if self.peers.unregister(peer).is_some() {
            debug!(%peer, "Removed protocol peer");
        }
    }

    /// Process one payload received from `peer`.
    pub async fn handle_message(&self, peer: PeerId, payload: &[u8]) -> Result<(), SyncError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        match decode_message(payload)? {
            SyncMessage::Status {
                network_id,
                td,
                head,
                genesis,
            } => {
                if network_id != self.network_id {
                    return Err(SyncError::NetworkMismatch {
                        have: network_id,
                        want: self.network_id,
                    });
                }
                if genesis != self.chain.genesis().hash() {
                    return Err(SyncError::GenesisMismatch);
                }
                self.peers.register(peer, PeerInfo { head, td })
            }
            SyncMessage::Transactions(txs) => {
                if !self.accept_txs() {
                    trace!(%peer, count = txs.len(), "Dropping transactions before sync");
                    return Ok(());
                }
                let rejected = self.txpool.add_remotes(txs).into_iter().filter(Result::is_err).count();
                if rejected > 0 {
                    trace!(%peer, rejected, "Discarded remote transactions");
                }
                Ok(())
            }
            SyncMessage::NewBlock { block, td } => {
                if let Err(err) = self.engine.verify_seal(self.chain.as_ref(), &block.header) {
                    warn!(%peer, number = block.number(), %err, "Discarding propagated block with bad seal");
                    return Ok(());
                }
                self.peers.set_head(&peer, block.hash(), td);
                let head = self.chain.current_block();
                let local_td = self.chain.get_td_by_hash(&head.hash()).unwrap_or_default();
                if td > local_td {
                    self.synchronise(peer, vec![block]).await?;
                }
                Ok(())
            }
            SyncMessage::Blocks(blocks) => self.synchronise(peer, blocks).await,
        }
    }

    async fn synchronise(&self, peer: PeerId, blocks: Vec<Block>) -> Result<(), SyncError> {
        self.downloader.synchronise(peer, blocks).await?;
        if self.fast_sync.swap(false, Ordering::SeqCst) {
            info!("Fast sync complete, auto disabling");
            self.downloader.set_mode(SyncMode::Full);
        }
        self.set_accept_txs(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::tests::{build_blocks, new_chain, new_pool, SENDER};
    use ln_consensus::Ethash;
    use ln_types::params::TX_GAS;
    use ln_types::{Address, U256};

    fn manager(mode: SyncMode) -> (Arc<ProtocolManager>, Arc<BlockChain>, EventMux) {
        let chain = new_chain();
        let pool = new_pool(&chain);
        let mux = EventMux::new();
        let engine = Arc::new(ConsensusEngine::Ethash(Ethash::new_fake()));
        let pm = ProtocolManager::new(&ChainConfig::all_ethash(), mode, 1, mux.clone(), pool, engine, chain.clone())
            .unwrap();
        (pm, chain, mux)
    }

    #[tokio::test]
    async fn light_mode_is_rejected() {
        let chain = new_chain();
        let pool = new_pool(&chain);
        let engine = Arc::new(ConsensusEngine::Ethash(Ethash::new_fake()));
        let result = ProtocolManager::new(
            &ChainConfig::all_ethash(),
            SyncMode::Light,
            1,
            EventMux::new(),
            pool,
            engine,
            chain,
        );
        assert!(matches!(result, Err(SyncError::LightModeUnsupported)));
    }

    #[tokio::test]
    async fn fast_mode_drops_eth62() {
        let (fast, _, _) = manager(SyncMode::Fast);
        let versions: Vec<u32> = fast.sub_protocols().iter().map(|p| p.version).collect();
        assert_eq!(versions, vec![ETH63]);

        let (full, _, _) = manager(SyncMode::Full);
        assert_eq!(full.sub_protocols().len(), 2);
    }

    #[tokio::test]
    async fn fast_sync_on_non_empty_chain_falls_back_to_full() {
        let (source, _) = build_blocks(1);
        let pool = new_pool(&source);
        let engine = Arc::new(ConsensusEngine::Ethash(Ethash::new_fake()));
        let pm = ProtocolManager::new(&ChainConfig::all_ethash(), SyncMode::Fast, 1, EventMux::new(), pool, engine, source)
            .unwrap();
        assert_eq!(pm.mode(), SyncMode::Full);
    }

    #[tokio::test]
    async fn status_handshake_checks_network_and_budget() {
        let (pm, _, _) = manager(SyncMode::Full);
        pm.start(1);
        let status = encode_message(&pm.status()).unwrap();
        pm.handle_message(PeerId::random(), &status).await.unwrap();
        assert_eq!(pm.peer_count(), 1);
        assert!(matches!(
            pm.handle_message(PeerId::random(), &status).await,
            Err(SyncError::TooManyPeers(1))
        ));

        let (other, _, _) = manager(SyncMode::Full);
        let foreign = SyncMessage::Status {
            network_id: 7,
            td: U256::one(),
            head: ln_types::Hash::zero(),
            genesis: ln_types::Hash::zero(),
        };
        assert!(matches!(
            other.handle_message(PeerId::random(), &encode_message(&foreign).unwrap()).await,
            Err(SyncError::NetworkMismatch { have: 7, want: 1 })
        ));
        pm.stop().await;
    }

    #[tokio::test]
    async fn remote_transactions_wait_for_sync() {
        let (pm, _, _) = manager(SyncMode::Full);
        let tx = Transaction::new(SENDER, 0, Some(Address([9u8; 20])), U256::one(), TX_GAS, U256::one(), Vec::new());
        let payload = encode_message(&SyncMessage::Transactions(vec![tx.clone()])).unwrap();

        pm.handle_message(PeerId::random(), &payload).await.unwrap();
        assert_eq!(pm.txpool.stats(), (0, 0));

        pm.set_accept_txs(true);
        pm.handle_message(PeerId::random(), &payload).await.unwrap();
        assert!(pm.txpool.get(&tx.hash()).is_some());
    }

    #[tokio::test]
    async fn delivered_blocks_sync_and_enable_transactions() {
        let (pm, chain, _) = manager(SyncMode::Fast);
        let (_, blocks) = build_blocks(4);
        let payload = encode_message(&SyncMessage::Blocks(blocks)).unwrap();
        pm.handle_message(PeerId::random(), &payload).await.unwrap();
        assert_eq!(chain.current_block().number(), 4);
        assert!(pm.accept_txs());
        assert_eq!(pm.mode(), SyncMode::Full);
    }

    #[tokio::test]
    async fn mined_blocks_and_new_txs_are_gossiped() {
        let (pm, _, mux) = manager(SyncMode::Full);
        let mut out = pm.subscribe_outbound();
        pm.start(5);

        let (_, blocks) = build_blocks(1);
        mux.post(NodeEvent::NewMinedBlock(blocks[0].clone()));
        let msg = tokio::time::timeout(Duration::from_secs(5), out.recv()).await.unwrap().unwrap();
        assert_eq!(msg.topic, crate::protocol::TOPIC_BLOCK);

        let tx = Transaction::new(SENDER, 0, Some(Address([9u8; 20])), U256::one(), TX_GAS, U256::one(), Vec::new());
        pm.txpool.add_local(tx).unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), out.recv()).await.unwrap().unwrap();
        assert_eq!(msg.topic, crate::protocol::TOPIC_TX);

        pm.stop().await;
        pm.stop().await;
        assert!(matches!(pm.handle_message(PeerId::random(), &[]).await, Err(SyncError::Stopped)));
    }
}
