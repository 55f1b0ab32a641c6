pub mod chain;
pub mod error;
pub mod odr;
pub mod retriever;
pub mod txpool;

pub use chain::LightChain;
pub use error::OdrError;
pub use odr::{ChainOdrBackend, OdrBackend, OdrRequest, OdrResponse};
pub use retriever::{RetrievalObserver, RetrievalOutcome, Retriever, RetrieverStats, DEFAULT_RETRIEVAL_TIMEOUT};
pub use txpool::LightTxPool;

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use ln_chain::{BlockChain, CacheConfig, Database, Genesis, MemoryDatabase, StateProcessor};
    use ln_consensus::{ConsensusEngine, Ethash};
    use ln_types::params::TX_GAS;
    use ln_types::{Address, Header, Transaction, U256};

    use crate::{ChainOdrBackend, LightChain, Retriever};

    pub const SENDER: Address = Address([1u8; 20]);

    fn genesis() -> Genesis {
        Genesis::dev_ethash(&[SENDER])
    }

    /// Full chain with `blocks` blocks, each carrying one logging transfer.
    pub fn full_chain(blocks: u64) -> Arc<BlockChain> {
        let genesis = genesis();
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        genesis.commit(db.as_ref()).unwrap();
        let engine = Arc::new(ConsensusEngine::Ethash(Ethash::new_fake()));
        let chain = Arc::new(BlockChain::new(db, CacheConfig::default(), genesis.config, engine.clone()).unwrap());
        for number in 1..=blocks {
            let parent = chain.current_block();
            let txs = vec![Transaction::new(
                SENDER,
                number - 1,
                Some(Address([2u8; 20])),
                U256::one(),
                TX_GAS,
                U256::one(),
                b"light".to_vec(),
            )];
            let mut header = Header {
                parent_hash: parent.hash(),
                number,
                gas_limit: parent.header.gas_limit,
                time: parent.header.time + 10,
                ..Header::default()
            };
            engine.prepare(chain.as_ref(), &mut header).unwrap();
            let mut state = chain.state_at(&parent.header.state_root).unwrap();
            let (receipts, gas_used) = StateProcessor.process(&header, &txs, &mut state).unwrap();
            header.gas_used = gas_used;
            let block = engine.finalize(chain.as_ref(), header, &mut state, txs, &receipts);
            chain.insert_block(block).unwrap();
        }
        chain
    }

    /// Light chain sharing `full`'s genesis and served by it.
    pub fn light_chain(full: &Arc<BlockChain>) -> LightChain {
        let genesis = genesis();
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        genesis.commit(db.as_ref()).unwrap();
        let engine = Arc::new(ConsensusEngine::Ethash(Ethash::new_fake()));
        let retriever = Arc::new(Retriever::new(Arc::new(ChainOdrBackend::new(full.clone()))));
        LightChain::new(db, genesis.config, engine, retriever).unwrap()
    }
}
