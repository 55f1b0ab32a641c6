pub mod config;
pub mod error;
pub mod journal;
pub mod pool;

pub use config::TxPoolConfig;
pub use error::TxPoolError;
pub use journal::TxJournal;
pub use pool::{NewTxsEvent, PoolContent, TxPool};
