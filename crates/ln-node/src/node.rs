//! The full node service: owns the chain, pool, sync manager, miner and
//! bloom indexer, and drives their startup and shutdown.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use ln_bloom::{BloomIndexer, BloomIndexerConfig, BloomRetrievalMultiplexer, MultiplexerConfig};
use ln_chain::schema::{read_database_version, write_chain_config, write_database_version, BLOCKCHAIN_VERSION};
use ln_chain::{setup_genesis_block, upgrade_deduplicate_data, BlockChain, CacheConfig, Database, UpgradeHandle};
use ln_consensus::{ConsensusEngine, DatasetCache};
use ln_sync::{EventMux, ProtocolDescriptor, ProtocolManager, SyncMode};
use ln_txpool::{TxPool, TxPoolConfig};
use ln_types::params::{version_string, CLIENT_NAME, MAXIMUM_EXTRA_DATA_SIZE};
use ln_types::{Address, ChainConfig, RpcApi, U256};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, FullBackend};
use crate::config::{NodeConfig, ServiceContext};
use crate::consensus::create_consensus_engine;
use crate::etherbase::EtherbaseResolver;
use crate::gasprice::Oracle;
use crate::les::LesServer;
use crate::metrics::NodeMetrics;
use crate::miner::Miner;
use crate::p2p::P2pServer;
use crate::NodeError;

/// Lifecycle of a [`NodeService`].  `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Initialized,
    /// Claimed by a `start` call still bringing subsystems up.
    Starting,
    Running,
    Stopped,
}

impl ServiceState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ServiceState::Initialized => "initialized",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node holding the full chain.
pub struct NodeService {
    config: NodeConfig,
    chain_config: ChainConfig,
    db: Arc<dyn Database>,
    engine: Arc<ConsensusEngine>,
    chain: Arc<BlockChain>,
    pool: Arc<TxPool>,
    protocol: Arc<ProtocolManager>,
    miner: Arc<Miner>,
    indexer: Arc<BloomIndexer>,
    multiplexer: Arc<BloomRetrievalMultiplexer>,
    backend: Arc<FullBackend>,
    etherbase: EtherbaseResolver,
    metrics: Arc<NodeMetrics>,
    event_mux: EventMux,
    ctx: ServiceContext,
    les: RwLock<Option<Arc<dyn LesServer>>>,
    upgrade: tokio::sync::Mutex<Option<UpgradeHandle>>,
    state: Mutex<ServiceState>,
    shutdown: CancellationToken,
}

impl NodeService {
    /// Build every subsystem bottom-up.  Fails without side effects beyond
    /// the opened store for invalid sync modes, schema version mismatches,
    /// genesis conflicts and malformed consensus settings.
    pub async fn new(ctx: ServiceContext, config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        Self::with_dataset_cache(ctx, config, None).await
    }

    /// Like [`NodeService::new`], attaching a shared-mode proof-of-work
    /// engine to `datasets`.
    pub async fn with_dataset_cache(
        ctx: ServiceContext,
        config: NodeConfig,
        datasets: Option<Arc<DatasetCache>>,
    ) -> Result<Arc<Self>, NodeError> {
        if config.sync_mode == SyncMode::Light {
            return Err(NodeError::LightSyncUnsupported);
        }
        if !config.sync_mode.is_valid() {
            return Err(NodeError::InvalidSyncMode(config.sync_mode.to_string()));
        }

        let db = ctx.open_database("chaindata", config.database_cache, config.database_handles)?;
        match Self::assemble(ctx, config, datasets, db.clone()).await {
            Ok(node) => Ok(node),
            Err(err) => {
                if let Err(close) = db.close() {
                    warn!(err = %close, "Failed to close chain database");
                }
                Err(err)
            }
        }
    }

    async fn assemble(
        ctx: ServiceContext,
        config: NodeConfig,
        datasets: Option<Arc<DatasetCache>>,
        db: Arc<dyn Database>,
    ) -> Result<Arc<Self>, NodeError> {
        let upgrade = upgrade_deduplicate_data(db.clone());

        let genesis = setup_genesis_block(db.as_ref(), config.genesis.as_ref()).map_err(NodeError::Genesis)?;
        let chain_config = genesis.config.clone();
        info!(config = %chain_config, "Initialised chain configuration");

        if !config.skip_bc_version_check {
            let have = read_database_version(db.as_ref())?;
            if let Some(have) = have.filter(|v| *v != BLOCKCHAIN_VERSION) {
                return Err(NodeError::VersionMismatch {
                    have,
                    want: BLOCKCHAIN_VERSION,
                });
            }
            write_database_version(db.as_ref(), BLOCKCHAIN_VERSION)?;
        }

        let engine = Arc::new(create_consensus_engine(&ctx, &config.ethash, &chain_config, datasets)?);
        let metrics = Arc::new(NodeMetrics::new()?);
        info!(network = config.network_id, engine = engine.name(), "Initialising ledger protocol");

        let cache = CacheConfig {
            disabled: config.no_pruning,
            trie_node_limit: config.trie_cache,
            trie_time_limit: config.trie_timeout,
        };
        let chain = Arc::new(BlockChain::new(db.clone(), cache, chain_config.clone(), engine.clone())?);

        if let Some(compat) = &genesis.compat {
            warn!(err = %compat, "Rewinding chain to upgrade configuration");
            chain.set_head(compat.rewind_to)?;
            write_chain_config(db.as_ref(), &genesis.hash, &chain_config)?;
        }

        let indexer = BloomIndexer::start(
            db.clone(),
            chain.clone(),
            chain.subscribe_chain_head_event(),
            BloomIndexerConfig::default(),
        )?;

        let tx_pool = TxPoolConfig {
            journal: resolve_journal(&ctx, &config.tx_pool),
            ..config.tx_pool.clone()
        };
        let pool = match TxPool::new(tx_pool, chain_config.clone(), chain.clone()) {
            Ok(pool) => pool,
            Err(err) => {
                indexer.close().await;
                return Err(err.into());
            }
        };

        let protocol = match ProtocolManager::new(
            &chain_config,
            config.sync_mode,
            config.network_id,
            ctx.event_mux.clone(),
            pool.clone(),
            engine.clone(),
            chain.clone(),
        ) {
            Ok(protocol) => protocol,
            Err(err) => {
                pool.stop().await;
                indexer.close().await;
                return Err(err.into());
            }
        };

        let miner = Miner::new(
            chain.clone(),
            pool.clone(),
            engine.clone(),
            ctx.event_mux.clone(),
            metrics.clone(),
        );
        if let Err(err) = miner.set_extra(make_extra_data(&config.extra_data)) {
            warn!(%err, "Failed to set miner extra-data");
        }

        let multiplexer = Arc::new(BloomRetrievalMultiplexer::new(indexer.clone(), MultiplexerConfig::default()));

        let price_limit = U256::from(pool.price_limit());
        let floor = config.gas_price.max(price_limit);
        let gpo = Oracle::new(chain.clone(), &config.gpo, floor);

        let backend = Arc::new(FullBackend {
            chain: chain.clone(),
            pool: pool.clone(),
            miner: miner.clone(),
            protocol: protocol.clone(),
            indexer: indexer.clone(),
            multiplexer: multiplexer.clone(),
            accounts: ctx.account_manager.clone(),
            gpo,
            metrics: metrics.clone(),
        });

        Ok(Arc::new(Self {
            etherbase: EtherbaseResolver::new(config.etherbase, ctx.account_manager.clone()),
            event_mux: ctx.event_mux.clone(),
            config,
            chain_config,
            db,
            engine,
            chain,
            pool,
            protocol,
            miner,
            indexer,
            multiplexer,
            backend,
            metrics,
            ctx,
            les: RwLock::new(None),
            upgrade: tokio::sync::Mutex::new(upgrade),
            state: Mutex::new(ServiceState::Initialized),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    /// Start the network-facing subsystems.  The peer budget left for full
    /// peers is the server's total minus the slots reserved for light
    /// clients.
    pub async fn start(&self, server: &P2pServer) -> Result<(), NodeError> {
        let mut max_peers = server.max_peers();
        {
            let mut state = self.state.lock();
            if *state != ServiceState::Initialized {
                return Err(NodeError::InvalidState {
                    state: state.as_str(),
                    op: "start",
                });
            }
            if self.config.light_serv > 0 {
                if self.config.light_peers >= max_peers {
                    return Err(NodeError::InvalidPeerConfig {
                        light_peers: self.config.light_peers,
                        max_peers,
                    });
                }
                max_peers -= self.config.light_peers;
            }
            *state = ServiceState::Starting;
        }

        self.multiplexer.start().await;
        self.protocol.start(max_peers);
        let les = self.les.read().clone();
        if let Some(les) = les {
            if let Err(err) = les.start(self.config.light_peers).await {
                error!(%err, "Light server failed to start, shutting down");
                if let Err(stop) = self.stop().await {
                    warn!(err = %stop, "Shutdown after failed start");
                }
                return Err(err);
            }
        }

        {
            let mut state = self.state.lock();
            if *state == ServiceState::Starting {
                *state = ServiceState::Running;
            }
        }
        info!(max_peers, "Node service started");
        Ok(())
    }

    /// Tear everything down, consumers before the providers beneath them.
    /// Safe to call more than once; only the first call does anything.
    pub async fn stop(&self) -> Result<(), NodeError> {
        {
            let mut state = self.state.lock();
            if *state == ServiceState::Stopped {
                return Ok(());
            }
            *state = ServiceState::Stopped;
        }

        if let Some(mut upgrade) = self.upgrade.lock().await.take() {
            upgrade.stop().await;
        }
        self.multiplexer.close().await;
        self.indexer.close().await;
        self.chain.stop();
        self.protocol.stop().await;
        let les = self.les.write().take();
        if let Some(les) = les {
            les.stop().await;
        }
        self.pool.stop().await;
        self.miner.close().await;
        self.event_mux.stop();

        let closed = self.db.close();
        self.shutdown.cancel();
        info!("Node service stopped");
        closed.map_err(NodeError::from)
    }

    /// Resolves once the service has stopped.
    pub async fn wait(&self) {
        self.shutdown.cancelled().await
    }

    /// Begin producing blocks.  With `local` set the sync manager accepts
    /// transactions without waiting for a completed sync.
    pub fn start_mining(&self, local: bool) -> Result<(), NodeError> {
        if self.state() == ServiceState::Stopped {
            return Err(NodeError::InvalidState {
                state: ServiceState::Stopped.as_str(),
                op: "start mining",
            });
        }
        let etherbase = self.etherbase.etherbase().inspect_err(|err| {
            error!(%err, "Cannot start mining without etherbase");
        })?;
        if self.engine.is_clique() {
            self.etherbase.authorize(&self.engine, etherbase).inspect_err(|err| {
                error!(%err, "Cannot start mining without a local signer");
            })?;
        }
        if local {
            self.protocol.set_accept_txs(true);
        }
        self.miner.start(etherbase);
        Ok(())
    }

    pub async fn stop_mining(&self) {
        self.miner.stop().await;
    }

    pub fn is_mining(&self) -> bool {
        self.miner.mining()
    }

    pub fn etherbase(&self) -> Result<Address, NodeError> {
        self.etherbase.etherbase()
    }

    pub fn set_etherbase(&self, etherbase: Address) {
        self.etherbase.set_etherbase(etherbase);
        self.miner.set_etherbase(etherbase);
    }

    /// Attach a light-serving subsystem.  Must happen before
    /// [`NodeService::start`].
    pub fn add_les_server(&self, server: Arc<dyn LesServer>) {
        server.set_bloom_bits_indexer(self.indexer.clone());
        *self.les.write() = Some(server);
    }

    /// Sub-protocols to advertise on the network.
    pub fn protocols(&self) -> Vec<ProtocolDescriptor> {
        let mut protocols = self.protocol.sub_protocols().to_vec();
        if let Some(les) = self.les.read().as_ref() {
            protocols.extend(les.protocols());
        }
        protocols
    }

    /// Every RPC service this node offers, the consensus engine's included.
    pub fn apis(self: &Arc<Self>) -> Vec<RpcApi> {
        let mut apis = self.engine.apis(self.chain.clone());
        apis.extend(crate::apis::node_apis(self));
        apis
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chain_config(&self) -> &ChainConfig {
        &self.chain_config
    }

    pub fn engine(&self) -> Arc<ConsensusEngine> {
        self.engine.clone()
    }

    pub fn chain(&self) -> Arc<BlockChain> {
        self.chain.clone()
    }

    pub fn tx_pool(&self) -> Arc<TxPool> {
        self.pool.clone()
    }

    pub fn protocol_manager(&self) -> Arc<ProtocolManager> {
        self.protocol.clone()
    }

    pub fn miner(&self) -> Arc<Miner> {
        self.miner.clone()
    }

    pub fn bloom_indexer(&self) -> Arc<BloomIndexer> {
        self.indexer.clone()
    }

    pub fn metrics(&self) -> Arc<NodeMetrics> {
        self.metrics.clone()
    }

    pub fn event_mux(&self) -> EventMux {
        self.event_mux.clone()
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    pub fn network_id(&self) -> u64 {
        self.protocol.network_id()
    }

    pub fn database(&self) -> Arc<dyn Database> {
        self.db.clone()
    }
}

/// Journal path under the data directory.  Ephemeral nodes keep no
/// journal.
fn resolve_journal(ctx: &ServiceContext, config: &TxPoolConfig) -> PathBuf {
    if config.journal.as_os_str().is_empty() {
        return PathBuf::new();
    }
    ctx.resolve_path(&config.journal).unwrap_or_default()
}

/// Miner extra-data: the caller's bytes, or a client fingerprint when none
/// are given.  Oversized extra-data is dropped, not truncated.
pub(crate) fn make_extra_data(extra: &[u8]) -> Vec<u8> {
    let extra = if extra.is_empty() {
        format!("{CLIENT_NAME}/v{}/{}", version_string(), std::env::consts::OS).into_bytes()
    } else {
        extra.to_vec()
    };
    if extra.len() > MAXIMUM_EXTRA_DATA_SIZE {
        warn!(
            extra = %hex::encode(&extra),
            len = extra.len(),
            max = MAXIMUM_EXTRA_DATA_SIZE,
            "Miner extra data exceed limit"
        );
        return Vec::new();
    }
    debug!(len = extra.len(), "Miner extra data set");
    extra
}
