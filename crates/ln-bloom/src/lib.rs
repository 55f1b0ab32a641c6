//! Bloom bits indexing and the filter retrieval worker pool.

pub mod error;
pub mod generator;
pub mod indexer;
pub mod matcher;
pub mod multiplexer;

pub use error::BloomError;
pub use generator::Generator;
pub use indexer::{BloomIndexer, BloomIndexerConfig};
pub use matcher::{Matcher, MatcherSession};
pub use multiplexer::{BloomRetrievalMultiplexer, MultiplexerConfig};

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use ln_chain::{BlockChain, CacheConfig, Database, Genesis, MemoryDatabase, StateProcessor};
    use ln_consensus::{ConsensusEngine, Ethash};
    use ln_types::params::TX_GAS;
    use ln_types::{Address, Block, Header, Transaction, U256};

    pub const NEEDLE: [u8; 20] = [0x42; 20];

    /// Chain of `blocks` blocks on top of genesis; the listed heights carry
    /// a transaction logging to [`NEEDLE`].
    pub fn chain_with_blocks(blocks: u64, with_logs: &[u64]) -> (Arc<BlockChain>, Vec<Block>) {
        let sender = Address([1u8; 20]);
        let genesis = Genesis::dev_ethash(&[sender]);
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        genesis.commit(db.as_ref()).unwrap();
        let engine = Arc::new(ConsensusEngine::Ethash(Ethash::new_fake()));
        let chain = Arc::new(
            BlockChain::new(db, CacheConfig::default(), genesis.config.clone(), engine.clone())
                .unwrap(),
        );

        let mut nonce = 0;
        let mut out = Vec::new();
        for number in 1..=blocks {
            let parent = chain.current_block();
            let mut txs = Vec::new();
            if with_logs.contains(&number) {
                txs.push(Transaction::new(
                    sender,
                    nonce,
                    Some(Address(NEEDLE)),
                    U256::zero(),
                    TX_GAS,
                    U256::one(),
                    b"log".to_vec(),
                ));
                nonce += 1;
            }
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
            chain.insert_block(block.clone()).unwrap();
            out.push(block);
        }
        (chain, out)
    }

    pub async fn wait_for(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
