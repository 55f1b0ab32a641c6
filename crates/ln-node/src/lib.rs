pub mod accounts;
pub mod apis;
pub mod backend;
pub mod config;
pub mod consensus;
pub mod error;
pub mod etherbase;
pub mod gasprice;
pub mod les;
pub mod light_service;
pub mod metrics;
pub mod miner;
pub mod node;
pub mod p2p;

pub use accounts::{AccountManager, Wallet};
pub use backend::{Backend, BackendError, FullBackend, LightBackend};
pub use config::{GasPriceConfig, NodeConfig, ServiceContext};
pub use consensus::create_consensus_engine;
pub use error::NodeError;
pub use etherbase::EtherbaseResolver;
pub use gasprice::Oracle;
pub use les::{LesServer, LES_VERSION};
pub use light_service::LightNodeService;
pub use ln_sync::{EventMux, NodeEvent};
pub use metrics::NodeMetrics;
pub use miner::Miner;
pub use node::{NodeService, ServiceState};
pub use p2p::{P2pConfig, P2pServer};
