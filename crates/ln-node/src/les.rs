use std::sync::Arc;

use async_trait::async_trait;
use ln_bloom::BloomIndexer;
use ln_sync::ProtocolDescriptor;

use crate::NodeError;

/// Light client protocol version served and reported by light backends.
pub const LES_VERSION: u32 = 2;

/// Light-client serving attached to a full node.
#[async_trait]
pub trait LesServer: Send + Sync {
    /// Start serving with at most `max_peers` light clients.
    async fn start(&self, max_peers: usize) -> Result<(), NodeError>;

    async fn stop(&self);

    fn protocols(&self) -> Vec<ProtocolDescriptor>;

    /// Bloom index the server answers bloom-trie requests from.
    fn set_bloom_bits_indexer(&self, indexer: Arc<BloomIndexer>);
}
