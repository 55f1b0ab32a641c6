//! RPC services registered by [`NodeService::apis`].
//!
//! Each service is a thin handle delegating to the node; transport and
//! method dispatch live outside this crate.

use std::sync::Arc;

use ln_sync::SyncProgress;
use ln_txpool::PoolContent;
use ln_types::{Address, BlockNumber, Hash, Header, Log, RpcApi, U256};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::accounts::AccountManager;
use crate::backend::{Backend, BackendError};
use crate::{NodeError, NodeService};

pub(crate) fn node_apis(node: &Arc<NodeService>) -> Vec<RpcApi> {
    vec![
        RpcApi::new("eth", "1.0", EthApi { node: node.clone() }, true),
        RpcApi::new("eth", "1.0", DownloaderApi { node: node.clone() }, true),
        RpcApi::new("eth", "1.0", FilterApi { backend: node.backend() }, true),
        RpcApi::new("txpool", "1.0", TxPoolApi { node: node.clone() }, true),
        RpcApi::new("miner", "1.0", MinerApi { node: node.clone() }, false),
        RpcApi::new("admin", "1.0", AdminApi { node: node.clone() }, false),
        RpcApi::new("debug", "1.0", PublicDebugApi { backend: node.backend() }, true),
        RpcApi::new("debug", "1.0", PrivateDebugApi { node: node.clone() }, false),
        RpcApi::new("net", "1.0", NetApi { node: node.clone() }, true),
        RpcApi::new(
            "personal",
            "1.0",
            PersonalApi {
                accounts: node.context().account_manager.clone(),
            },
            false,
        ),
    ]
}

/// Services of a light node: chain queries and filters through the
/// backend, plus local accounts.
pub(crate) fn light_node_apis(backend: Arc<dyn Backend>) -> Vec<RpcApi> {
    let accounts = backend.account_manager();
    vec![
        RpcApi::new("eth", "1.0", FilterApi { backend: backend.clone() }, true),
        RpcApi::new("debug", "1.0", PublicDebugApi { backend }, true),
        RpcApi::new("personal", "1.0", PersonalApi { accounts }, false),
    ]
}

/// Miner status and chain identity.
pub struct EthApi {
    node: Arc<NodeService>,
}

impl EthApi {
    pub fn etherbase(&self) -> Result<Address, NodeError> {
        self.node.etherbase()
    }

    pub fn coinbase(&self) -> Result<Address, NodeError> {
        self.etherbase()
    }

    pub fn mining(&self) -> bool {
        self.node.is_mining()
    }

    /// Local proof-of-work hash rate; zero under proof-of-authority.
    pub fn hashrate(&self) -> u64 {
        self.node.engine().as_ethash().map_or(0, |ethash| ethash.hashrate())
    }

    pub fn chain_id(&self) -> u64 {
        self.node.chain_config().chain_id
    }

    pub fn protocol_version(&self) -> u32 {
        self.node.backend().protocol_version()
    }
}

pub struct DownloaderApi {
    node: Arc<NodeService>,
}

impl DownloaderApi {
    /// Progress of the running sync, or `None` when idle.
    pub fn syncing(&self) -> Option<SyncProgress> {
        let downloader = self.node.protocol_manager().downloader();
        downloader.synchronising().then(|| downloader.progress())
    }
}

/// Log queries against the bloom index.
pub struct FilterApi {
    backend: Arc<dyn Backend>,
}

impl FilterApi {
    pub async fn logs(&self, token: &CancellationToken, block: Hash) -> Result<Option<Vec<Vec<Log>>>, BackendError> {
        self.backend.get_logs(token, &block).await
    }

    /// Section size and number of indexed sections.
    pub fn bloom_status(&self) -> (u64, u64) {
        self.backend.bloom_status()
    }
}

pub struct TxPoolApi {
    node: Arc<NodeService>,
}

impl TxPoolApi {
    /// Pending and queued counts.
    pub fn status(&self) -> (usize, usize) {
        self.node.tx_pool().stats()
    }

    pub fn content(&self) -> PoolContent {
        self.node.tx_pool().content()
    }
}

/// Mining control.
pub struct MinerApi {
    node: Arc<NodeService>,
}

impl MinerApi {
    pub fn start(&self) -> Result<(), NodeError> {
        if self.node.is_mining() {
            return Ok(());
        }
        self.node.start_mining(true)
    }

    pub async fn stop(&self) {
        self.node.stop_mining().await
    }

    pub fn set_extra(&self, extra: Vec<u8>) -> Result<(), NodeError> {
        self.node.miner().set_extra(extra)
    }

    pub fn set_gas_price(&self, price: U256) {
        self.node.tx_pool().set_gas_price(price);
    }

    pub fn set_etherbase(&self, etherbase: Address) {
        self.node.set_etherbase(etherbase);
    }
}

pub struct AdminApi {
    node: Arc<NodeService>,
}

impl AdminApi {
    pub fn node_info(&self) -> Value {
        let head = self.node.chain().current_header();
        let protocols: Vec<String> = self.node.protocols().iter().map(|p| p.id()).collect();
        json!({
            "network": self.node.network_id(),
            "genesis": self.node.chain().genesis().hash().to_string(),
            "head": head.hash().to_string(),
            "number": head.number,
            "config": self.node.chain_config(),
            "protocols": protocols,
        })
    }

    pub fn datadir(&self) -> Option<String> {
        self.node.context().data_dir.as_ref().map(|dir| dir.display().to_string())
    }
}

pub struct PublicDebugApi {
    backend: Arc<dyn Backend>,
}

impl PublicDebugApi {
    pub async fn get_block_header(
        &self,
        token: &CancellationToken,
        number: BlockNumber,
    ) -> Result<Option<Header>, BackendError> {
        self.backend.header_by_number(token, number).await
    }
}

pub struct PrivateDebugApi {
    node: Arc<NodeService>,
}

impl PrivateDebugApi {
    /// Rewind the chain, cancelling any sync first.
    pub fn set_head(&self, number: u64) -> Result<(), BackendError> {
        self.node.backend().set_head(number)
    }

    /// Prometheus text exposition of the node's counters.
    pub fn metrics(&self) -> String {
        self.node.metrics().render()
    }
}

pub struct NetApi {
    node: Arc<NodeService>,
}

impl NetApi {
    pub fn version(&self) -> String {
        self.node.network_id().to_string()
    }

    pub fn peer_count(&self) -> usize {
        self.node.protocol_manager().peer_count()
    }
}

pub struct PersonalApi {
    accounts: Arc<AccountManager>,
}

impl PersonalApi {
    pub fn list_accounts(&self) -> Vec<Address> {
        self.accounts.accounts()
    }

    pub fn list_wallets(&self) -> Vec<String> {
        self.accounts.wallets().iter().map(|w| w.url().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, ServiceContext};
    use crate::accounts::Wallet;
    use ed25519_dalek::SigningKey;

    #[tokio::test]
    async fn registry_flags_private_namespaces() {
        let wallet = Wallet::keystore("keystore://a", vec![SigningKey::from_bytes(&[5u8; 32])]);
        let signer = wallet.accounts()[0];
        let ctx = ServiceContext::new(None, Arc::new(AccountManager::new(vec![wallet])));
        let node = NodeService::new(ctx, NodeConfig::dev(signer, 0)).await.unwrap();
        let apis = node.apis();

        for private in ["miner", "admin", "personal"] {
            assert!(apis.iter().filter(|a| a.namespace == private).all(|a| !a.public));
        }
        assert!(apis.iter().any(|a| a.namespace == "debug" && a.public));
        assert!(apis.iter().any(|a| a.namespace == "debug" && !a.public));
        assert!(apis.iter().any(|a| a.namespace == "clique"));

        let personal = apis.iter().find_map(|a| a.downcast::<PersonalApi>()).unwrap();
        assert_eq!(personal.list_accounts(), vec![signer]);

        let admin = apis.iter().find_map(|a| a.downcast::<AdminApi>()).unwrap();
        let info = admin.node_info();
        assert_eq!(info["network"], 1337);
        assert_eq!(info["number"], 0);

        let eth = apis.iter().find_map(|a| a.downcast::<EthApi>()).unwrap();
        assert_eq!(eth.etherbase().unwrap(), signer);
        assert_eq!(eth.hashrate(), 0);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn miner_api_controls_mining() {
        let wallet = Wallet::keystore("keystore://a", vec![SigningKey::from_bytes(&[6u8; 32])]);
        let signer = wallet.accounts()[0];
        let ctx = ServiceContext::new(None, Arc::new(AccountManager::new(vec![wallet])));
        let node = NodeService::new(ctx, NodeConfig::dev(signer, 0)).await.unwrap();
        let apis = node.apis();
        let miner = apis.iter().find_map(|a| a.downcast::<MinerApi>()).unwrap();

        assert!(miner.set_extra(vec![0u8; 64]).is_err());
        miner.start().unwrap();
        assert!(node.is_mining());
        miner.stop().await;
        assert!(!node.is_mining());
        node.stop().await.unwrap();
    }
}
