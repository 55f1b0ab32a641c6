pub mod downloader;
pub mod error;
pub mod event;
pub mod manager;
pub mod mode;
pub mod peer;
pub mod protocol;

pub use downloader::{Downloader, SyncProgress};
pub use error::SyncError;
pub use event::{EventMux, NodeEvent};
pub use manager::{Outbound, ProtocolManager};
pub use mode::SyncMode;
pub use protocol::{ProtocolDescriptor, SyncMessage};

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use ln_chain::{BlockChain, CacheConfig, Database, Genesis, MemoryDatabase, StateProcessor};
    use ln_consensus::{ConsensusEngine, Ethash};
    use ln_txpool::{TxPool, TxPoolConfig};
    use ln_types::{Address, Block, Header};

    pub const SENDER: Address = Address([1u8; 20]);

    pub fn new_chain() -> Arc<BlockChain> {
        let genesis = Genesis::dev_ethash(&[SENDER]);
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        genesis.commit(db.as_ref()).unwrap();
        let engine = Arc::new(ConsensusEngine::Ethash(Ethash::new_fake()));
        Arc::new(BlockChain::new(db, CacheConfig::default(), genesis.config, engine).unwrap())
    }

    pub fn new_pool(chain: &Arc<BlockChain>) -> Arc<TxPool> {
        let config = ln_consensus::ChainReader::config(chain.as_ref());
        TxPool::new(TxPoolConfig::without_journal(), config, chain.clone()).unwrap()
    }

    /// Fresh chain extended by `count` empty blocks; returns the chain and
    /// the blocks in order.
    pub fn build_blocks(count: u64) -> (Arc<BlockChain>, Vec<Block>) {
        let chain = new_chain();
        let engine = chain.engine();
        let mut out = Vec::new();
        for number in 1..=count {
            let parent = chain.current_block();
            let mut header = Header {
                parent_hash: parent.hash(),
                number,
                gas_limit: parent.header.gas_limit,
                time: parent.header.time + 10,
                ..Header::default()
            };
            engine.prepare(chain.as_ref(), &mut header).unwrap();
            let mut state = chain.state_at(&parent.header.state_root).unwrap();
            let (receipts, gas_used) = StateProcessor.process(&header, &[], &mut state).unwrap();
            header.gas_used = gas_used;
            let block = engine.finalize(chain.as_ref(), header, &mut state, Vec::new(), &receipts);
            chain.insert_block(block.clone()).unwrap();
            out.push(block);
        }
        (chain, out)
    }
}
