pub mod block;
pub mod bloom;
pub mod derive;
pub mod error;
pub mod params;
pub mod primitives;
pub mod receipt;
pub mod rpc;
pub mod transaction;

pub use block::{Block, Header};
pub use bloom::Bloom;
pub use derive::derive_root;
pub use error::TypesError;
pub use params::{ChainConfig, CliqueConfig, ConfigCompatError};
pub use primitives::{Address, Hash, U256};
pub use receipt::{Log, Receipt};
pub use rpc::{BlockNumber, RpcApi};
pub use transaction::Transaction;
