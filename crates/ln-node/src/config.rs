use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ln_chain::{Database, Genesis, MemoryDatabase, SledDatabase};
use ln_consensus::{EthashConfig, PowMode};
use ln_sync::{EventMux, SyncMode};
use ln_txpool::TxPoolConfig;
use ln_types::params::SHANNON;
use ln_types::{Address, U256};

use crate::accounts::AccountManager;
use crate::NodeError;

/// Gas price oracle settings.
#[derive(Debug, Clone)]
pub struct GasPriceConfig {
    /// Recent blocks sampled per suggestion.
    pub blocks: usize,
    /// Percentile of the sampled prices returned.
    pub percentile: usize,
    /// Suggestions never exceed this.
    pub max_price: U256,
}

impl Default for GasPriceConfig {
    fn default() -> Self {
        Self {
            blocks: 20,
            percentile: 60,
            max_price: U256::from(500u64) * U256::from(SHANNON),
        }
    }
}

/// Full configuration for a [`crate::NodeService`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Genesis to initialise an empty store with.  `None` uses mainnet.
    pub genesis: Option<Genesis>,

    pub network_id: u64,
    pub sync_mode: SyncMode,

    /// Keep every state in memory instead of flushing on a timer.
    pub no_pruning: bool,

    /// Maximum percentage of time spent serving light clients.
    pub light_serv: u32,
    /// Peer slots reserved for light clients.
    pub light_peers: usize,

    /// Skip the on-disk schema version check.
    pub skip_bc_version_check: bool,

    pub database_cache: usize,
    pub database_handles: usize,
    pub trie_cache: usize,
    pub trie_timeout: Duration,

    /// Mining beneficiary and signer.  Resolved from the first wallet when
    /// unset.
    pub etherbase: Option<Address>,
    pub miner_threads: i32,
    pub extra_data: Vec<u8>,
    /// Minimum gas price for mined transactions and the oracle floor.
    pub gas_price: U256,

    pub ethash: EthashConfig,
    pub tx_pool: TxPoolConfig,
    pub gpo: GasPriceConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            genesis: None,
            network_id: 1,
            sync_mode: SyncMode::Fast,
            no_pruning: false,
            light_serv: 0,
            light_peers: 100,
            skip_bc_version_check: false,
            database_cache: 768,
            database_handles: 0,
            trie_cache: 256,
            trie_timeout: Duration::from_secs(5 * 60),
            etherbase: None,
            miner_threads: 0,
            extra_data: Vec::new(),
            gas_price: U256::from(18u64) * U256::from(SHANNON),
            ethash: EthashConfig::default(),
            tx_pool: TxPoolConfig::default(),
            gpo: GasPriceConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Single-node development chain sealed by `signer` every `period`
    /// seconds.
    pub fn dev(signer: Address, period: u64) -> Self {
        Self {
            genesis: Some(Genesis::dev(signer, period)),
            network_id: 1337,
            sync_mode: SyncMode::Full,
            light_peers: 0,
            etherbase: Some(signer),
            gas_price: U256::one(),
            ethash: EthashConfig {
                pow_mode: PowMode::Fake,
                ..EthashConfig::default()
            },
            ..Self::default()
        }
    }

    /// Proof-of-work chain with fake seals, funding `accounts`.
    pub fn dev_ethash(accounts: &[Address]) -> Self {
        Self {
            genesis: Some(Genesis::dev_ethash(accounts)),
            network_id: 1337,
            sync_mode: SyncMode::Full,
            light_peers: 0,
            gas_price: U256::one(),
            ethash: EthashConfig {
                pow_mode: PowMode::Fake,
                ..EthashConfig::default()
            },
            ..Self::default()
        }
    }

    /// Light client configuration for the same chain as `self`.
    pub fn light(&self) -> Self {
        Self {
            sync_mode: SyncMode::Light,
            ..self.clone()
        }
    }
}

/// Resources the host process hands to each service.
#[derive(Clone)]
pub struct ServiceContext {
    /// Root for relative paths.  `None` runs ephemerally: relative paths
    /// do not resolve and nothing is written to disk.
    pub data_dir: Option<PathBuf>,
    pub event_mux: EventMux,
    pub account_manager: Arc<AccountManager>,
    database: Option<Arc<dyn Database>>,
}

impl ServiceContext {
    pub fn new(data_dir: Option<PathBuf>, account_manager: Arc<AccountManager>) -> Self {
        Self {
            data_dir,
            event_mux: EventMux::new(),
            account_manager,
            database: None,
        }
    }

    /// Ephemeral context with no wallets.
    pub fn ephemeral() -> Self {
        Self::new(None, Arc::new(AccountManager::default()))
    }

    /// Serve `db` from [`ServiceContext::open_database`] instead of a fresh
    /// store.
    pub fn with_database(mut self, db: Arc<dyn Database>) -> Self {
        self.database = Some(db);
        self
    }

    /// Open the chain store `name`: a sled directory under the data
    /// directory, or an in-memory store when running ephemerally.
    pub fn open_database(&self, name: &str, cache: usize, handles: usize) -> Result<Arc<dyn Database>, NodeError> {
        if let Some(db) = &self.database {
            return Ok(db.clone());
        }
        let Some(dir) = &self.data_dir else {
            tracing::info!(name, "Allocated ephemeral chain database");
            return Ok(Arc::new(MemoryDatabase::new()));
        };
        let path = dir.join(name);
        let db = SledDatabase::open(&path, cache)?;
        tracing::info!(database = %path.display(), cache, handles, "Allocated chain database");
        Ok(Arc::new(db))
    }

    /// Resolve `path` against the data directory.  Absolute paths are
    /// returned unchanged.
    pub fn resolve_path(&self, path: &Path) -> Option<PathBuf> {
        if path.is_absolute() {
            return Some(path.to_path_buf());
        }
        self.data_dir.as_ref().map(|dir| dir.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_need_a_data_dir() {
        let ctx = ServiceContext::ephemeral();
        assert!(ctx.resolve_path(Path::new("transactions.rlp")).is_none());
        assert_eq!(ctx.resolve_path(Path::new("/tmp/x")), Some(PathBuf::from("/tmp/x")));

        let ctx = ServiceContext::new(Some(PathBuf::from("/data")), Arc::new(AccountManager::default()));
        assert_eq!(
            ctx.resolve_path(Path::new("transactions.rlp")),
            Some(PathBuf::from("/data/transactions.rlp"))
        );
    }

    #[test]
    fn defaults_follow_mainnet_profile() {
        let config = NodeConfig::default();
        assert_eq!(config.sync_mode, SyncMode::Fast);
        assert_eq!(config.gpo.blocks, 20);
        assert_eq!(config.gpo.percentile, 60);
        assert_eq!(config.gas_price, U256::from(18_000_000_000u64));
    }
}
