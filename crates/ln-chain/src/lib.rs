pub mod blockchain;
pub mod db;
pub mod error;
pub mod events;
pub mod genesis;
pub mod processor;
pub mod schema;
pub mod state;
pub mod upgrade;

pub use blockchain::{BlockChain, CacheConfig};
pub use db::{Database, MemoryDatabase, SledDatabase};
pub use error::ChainError;
pub use events::{ChainEvent, ChainHeadEvent, ChainSideEvent, RemovedLogsEvent};
pub use genesis::{setup_genesis_block, Genesis, GenesisAccount, GenesisSetup};
pub use processor::StateProcessor;
pub use schema::BLOCKCHAIN_VERSION;
pub use state::{Account, StateDb};
pub use upgrade::{upgrade_deduplicate_data, UpgradeHandle};
