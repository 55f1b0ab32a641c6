//! Node service for light sync: a local header chain with everything else
//! fetched on demand from serving peers.

use std::sync::Arc;

use ln_bloom::{BloomIndexer, BloomIndexerConfig, BloomRetrievalMultiplexer, MultiplexerConfig};
use ln_chain::schema::write_chain_config;
use ln_chain::{setup_genesis_block, Database};
use ln_consensus::ConsensusEngine;
use ln_light::{LightChain, LightTxPool, OdrBackend, RetrievalObserver, Retriever};
use ln_sync::{EventMux, SyncMode};
use ln_types::{ChainConfig, RpcApi};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{Backend, LightBackend};
use crate::config::{NodeConfig, ServiceContext};
use crate::consensus::create_consensus_engine;
use crate::gasprice::Oracle;
use crate::metrics::NodeMetrics;
use crate::node::ServiceState;
use crate::NodeError;

pub struct LightNodeService {
    chain_config: ChainConfig,
    db: Arc<dyn Database>,
    engine: Arc<ConsensusEngine>,
    retriever: Arc<Retriever>,
    chain: Arc<LightChain>,
    pool: Arc<LightTxPool>,
    indexer: Arc<BloomIndexer>,
    multiplexer: Arc<BloomRetrievalMultiplexer>,
    backend: Arc<LightBackend>,
    metrics: Arc<NodeMetrics>,
    event_mux: EventMux,
    state: Mutex<ServiceState>,
    shutdown: CancellationToken,
}

impl LightNodeService {
    /// Build a light node retrieving missing data through `odr`.
    pub async fn new(
        ctx: ServiceContext,
        config: NodeConfig,
        odr: Arc<dyn OdrBackend>,
    ) -> Result<Arc<Self>, NodeError> {
        if config.sync_mode != SyncMode::Light {
            return Err(NodeError::FullSyncUnsupported(config.sync_mode.to_string()));
        }

        let db = ctx.open_database("lightchaindata", config.database_cache, config.database_handles)?;
        match Self::assemble(ctx, config, odr, db.clone()).await {
            Ok(node) => Ok(node),
            Err(err) => {
                if let Err(close) = db.close() {
                    warn!(err = %close, "Failed to close light chain database");
                }
                Err(err)
            }
        }
    }

    async fn assemble(
        ctx: ServiceContext,
        config: NodeConfig,
        odr: Arc<dyn OdrBackend>,
        db: Arc<dyn Database>,
    ) -> Result<Arc<Self>, NodeError> {
        let genesis = setup_genesis_block(db.as_ref(), config.genesis.as_ref()).map_err(NodeError::Genesis)?;
        let chain_config = genesis.config.clone();
        info!(config = %chain_config, "Initialised chain configuration");

        let engine = Arc::new(create_consensus_engine(&ctx, &config.ethash, &chain_config, None)?);
        let metrics = Arc::new(NodeMetrics::new()?);

        let observed = metrics.clone();
        let observer: RetrievalObserver = Arc::new(move |outcome| observed.observe_retrieval(outcome));
        let retriever = Arc::new(Retriever::new(odr).with_observer(observer));
        let chain = Arc::new(LightChain::new(
            db.clone(),
            chain_config.clone(),
            engine.clone(),
            retriever.clone(),
        )?);

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
        let pool = LightTxPool::new(chain.clone());
        let multiplexer = Arc::new(BloomRetrievalMultiplexer::new(indexer.clone(), MultiplexerConfig::default()));

        let backend = Arc::new(LightBackend {
            chain: chain.clone(),
            pool: pool.clone(),
            indexer: indexer.clone(),
            multiplexer: multiplexer.clone(),
            accounts: ctx.account_manager.clone(),
            gpo: Oracle::new(chain.clone(), &config.gpo, config.gas_price),
            metrics: metrics.clone(),
            network_id: config.network_id,
        });

        info!(network = config.network_id, "Light node service initialised");
        Ok(Arc::new(Self {
            chain_config,
            db,
            engine,
            retriever,
            chain,
            pool,
            indexer,
            multiplexer,
            backend,
            metrics,
            event_mux: ctx.event_mux.clone(),
            state: Mutex::new(ServiceState::Initialized),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub async fn start(&self) -> Result<(), NodeError> {
        {
            let mut state = self.state.lock();
            if *state != ServiceState::Initialized {
                return Err(NodeError::InvalidState {
                    state: state.as_str(),
                    op: "start",
                });
            }
            *state = ServiceState::Starting;
        }
        self.multiplexer.start().await;
        {
            let mut state = self.state.lock();
            if *state == ServiceState::Starting {
                *state = ServiceState::Running;
            }
        }
        info!("Light node service started");
        Ok(())
    }

    /// Stop everything and close the store.  Only the first call has any
    /// effect.
    pub async fn stop(&self) -> Result<(), NodeError> {
        {
            let mut state = self.state.lock();
            if *state == ServiceState::Stopped {
                return Ok(());
            }
            *state = ServiceState::Stopped;
        }
        self.multiplexer.close().await;
        self.indexer.close().await;
        self.chain.stop();
        self.pool.stop().await;
        self.event_mux.stop();

        let closed = self.db.close();
        self.shutdown.cancel();
        info!("Light node service stopped");
        closed.map_err(NodeError::from)
    }

    pub async fn wait(&self) {
        self.shutdown.cancelled().await
    }

    pub fn apis(&self) -> Vec<RpcApi> {
        let mut apis = self.engine.apis(self.chain.clone());
        apis.extend(crate::apis::light_node_apis(self.backend.clone()));
        apis
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn chain(&self) -> Arc<LightChain> {
        self.chain.clone()
    }

    pub fn chain_config(&self) -> &ChainConfig {
        &self.chain_config
    }

    pub fn retriever(&self) -> Arc<Retriever> {
        self.retriever.clone()
    }

    pub fn metrics(&self) -> Arc<NodeMetrics> {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ln_chain::{BlockChain, CacheConfig, Genesis, MemoryDatabase};
    use ln_consensus::Ethash;
    use ln_light::ChainOdrBackend;

    fn serving_chain(genesis: &Genesis) -> Arc<BlockChain> {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        genesis.commit(db.as_ref()).unwrap();
        let engine = Arc::new(ConsensusEngine::Ethash(Ethash::new_fake()));
        Arc::new(BlockChain::new(db, CacheConfig::default(), genesis.config.clone(), engine).unwrap())
    }

    #[tokio::test]
    async fn full_sync_modes_are_rejected() {
        let config = NodeConfig::dev_ethash(&[]);
        let genesis = config.genesis.clone().unwrap();
        let odr = Arc::new(ChainOdrBackend::new(serving_chain(&genesis)));
        let err = LightNodeService::new(ServiceContext::ephemeral(), config, odr)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NodeError::FullSyncUnsupported(mode) if mode == "full"));
    }

    #[tokio::test]
    async fn lifecycle_closes_store_once() {
        let config = NodeConfig::dev_ethash(&[]).light();
        let genesis = config.genesis.clone().unwrap();
        let odr = Arc::new(ChainOdrBackend::new(serving_chain(&genesis)));
        let db = Arc::new(MemoryDatabase::new());
        let ctx = ServiceContext::ephemeral().with_database(db.clone());

        let node = LightNodeService::new(ctx, config, odr).await.unwrap();
        node.start().await.unwrap();
        assert!(node.start().await.is_err());
        assert!(node.apis().iter().any(|api| api.namespace == "ethash"));

        node.stop().await.unwrap();
        node.stop().await.unwrap();
        node.wait().await;
        assert_eq!(db.close_count(), 1);
    }
}
