//! Gas price suggestions from recently included transactions.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use ln_chain::BlockChain;
use ln_light::LightChain;
use ln_types::{Block, Hash, Header, U256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::BackendError;
use crate::config::GasPriceConfig;

/// Where the oracle reads blocks from.
#[async_trait]
pub trait BlockSource: Send + Sync {
    fn head(&self) -> Header;

    async fn block(&self, token: &CancellationToken, number: u64) -> Result<Option<Block>, BackendError>;
}

#[async_trait]
impl BlockSource for BlockChain {
    fn head(&self) -> Header {
        self.current_header()
    }

    async fn block(&self, _token: &CancellationToken, number: u64) -> Result<Option<Block>, BackendError> {
        Ok(self.get_block_by_number(number))
    }
}

#[async_trait]
impl BlockSource for LightChain {
    fn head(&self) -> Header {
        self.current_header()
    }

    async fn block(&self, token: &CancellationToken, number: u64) -> Result<Option<Block>, BackendError> {
        Ok(self.get_block_by_number(token, number).await?)
    }
}

/// Suggests the configured percentile of the per-block minimum prices
/// over the most recent blocks.
///
/// A block's price is the cheapest transaction not sent by its own
/// coinbase.  Up to half the window may be empty blocks; beyond that each
/// empty block pulls in an older one, up to five windows deep.
pub struct Oracle {
    source: Arc<dyn BlockSource>,
    check_blocks: usize,
    max_empty: usize,
    max_blocks: usize,
    percentile: usize,
    max_price: U256,
    floor: U256,
    /// Head hash and price of the last suggestion.  Held while sampling so
    /// concurrent callers share one computation.
    last: Mutex<(Hash, U256)>,
}

impl Oracle {
    pub fn new(source: Arc<dyn BlockSource>, config: &GasPriceConfig, floor: U256) -> Self {
        let check_blocks = config.blocks.max(1);
        Self {
            source,
            check_blocks,
            max_empty: check_blocks / 2,
            max_blocks: check_blocks * 5,
            percentile: config.percentile.min(100),
            max_price: config.max_price,
            floor,
            last: Mutex::new((Hash::zero(), floor)),
        }
    }

    pub fn floor(&self) -> U256 {
        self.floor
    }

    pub async fn suggest_price(&self, token: &CancellationToken) -> Result<U256, BackendError> {
        let head = self.source.head();
        let head_hash = head.hash();
        let mut last = self.last.lock().await;
        if last.0 == head_hash {
            return Ok(last.1);
        }

        let mut next = head.number;
        let mut sent = 0;
        let mut max_empty = self.max_empty;
        let mut pending = FuturesUnordered::new();
        while sent < self.check_blocks && next > 0 {
            pending.push(self.block_price(token, next));
            sent += 1;
            next -= 1;
        }

        let mut prices = Vec::with_capacity(self.check_blocks);
        while let Some(result) = pending.next().await {
            match result? {
                Some(price) => prices.push(price),
                None if max_empty > 0 => max_empty -= 1,
                None => {
                    if next > 0 && sent < self.max_blocks {
                        pending.push(self.block_price(token, next));
                        sent += 1;
                        next -= 1;
                    }
                }
            }
        }

        let mut price = last.1;
        if !prices.is_empty() {
            prices.sort();
            price = prices[(prices.len() - 1) * self.percentile / 100];
        }
        let price = price.min(self.max_price).max(self.floor);
        debug!(head = head.number, samples = prices.len(), %price, "Gas price suggestion updated");
        *last = (head_hash, price);
        Ok(price)
    }

    async fn block_price(&self, token: &CancellationToken, number: u64) -> Result<Option<U256>, BackendError> {
        let Some(block) = self.source.block(token, number).await? else {
            return Ok(None);
        };
        let coinbase = block.coinbase();
        Ok(block
            .transactions
            .iter()
            .filter(|tx| tx.from != coinbase)
            .map(|tx| tx.gas_price)
            .min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ln_types::params::{SHANNON, TX_GAS};
    use ln_types::{Address, Transaction};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MINER: Address = Address([0xee; 20]);

    struct Blocks {
        blocks: HashMap<u64, Block>,
        head: u64,
        reads: AtomicUsize,
    }

    impl Blocks {
        /// `prices[i]` lists the transaction prices of block `i + 1`.
        fn new(prices: &[Vec<u64>]) -> Self {
            let mut blocks = HashMap::new();
            for (i, block_prices) in prices.iter().enumerate() {
                let number = i as u64 + 1;
                let mut txs: Vec<Transaction> = block_prices
                    .iter()
                    .enumerate()
                    .map(|(n, p)| tx(Address([n as u8 + 1; 20]), *p))
                    .collect();
                // The miner's own cheap transaction never counts.
                if !txs.is_empty() {
                    txs.push(tx(MINER, 0));
                }
                let header = Header {
                    number,
                    coinbase: MINER,
                    ..Header::default()
                };
                blocks.insert(number, Block::new(header, txs, &[]));
            }
            Self {
                head: prices.len() as u64,
                blocks,
                reads: AtomicUsize::new(0),
            }
        }
    }

    fn tx(from: Address, price: u64) -> Transaction {
        Transaction::new(from, 0, None, U256::zero(), TX_GAS, U256::from(price), Vec::new())
    }

    #[async_trait]
    impl BlockSource for Blocks {
        fn head(&self) -> Header {
            self.blocks
                .get(&self.head)
                .map(|b| b.header.clone())
                .unwrap_or_default()
        }

        async fn block(&self, _token: &CancellationToken, number: u64) -> Result<Option<Block>, BackendError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.blocks.get(&number).cloned())
        }
    }

    fn new_oracle(source: Arc<Blocks>, floor: u64) -> Oracle {
        Oracle::new(source, &GasPriceConfig::default(), U256::from(floor))
    }

    #[tokio::test]
    async fn percentile_of_per_block_minimums() {
        // Block n has prices n and n + 100; its minimum is n.
        let prices: Vec<Vec<u64>> = (1..=20).map(|n| vec![n + 100, n]).collect();
        let oracle = new_oracle(Arc::new(Blocks::new(&prices)), 1);
        let price = oracle.suggest_price(&CancellationToken::new()).await.unwrap();
        assert_eq!(price, U256::from(12u64));
    }

    #[tokio::test]
    async fn short_chains_use_what_exists() {
        let prices: Vec<Vec<u64>> = (1..=5).map(|n| vec![n * 10]).collect();
        let oracle = new_oracle(Arc::new(Blocks::new(&prices)), 1);
        // Sorted 10..50, index (4 * 60) / 100 = 2.
        assert_eq!(oracle.suggest_price(&CancellationToken::new()).await.unwrap(), U256::from(30u64));
    }

    #[tokio::test]
    async fn floor_and_cap_bound_the_suggestion() {
        let prices: Vec<Vec<u64>> = (1..=20).map(|n| vec![n]).collect();
        let oracle = new_oracle(Arc::new(Blocks::new(&prices)), 50);
        assert_eq!(oracle.suggest_price(&CancellationToken::new()).await.unwrap(), U256::from(50u64));

        let expensive: Vec<Vec<u64>> = (1..=20).map(|_| vec![1_000 * SHANNON]).collect();
        let oracle = new_oracle(Arc::new(Blocks::new(&expensive)), 1);
        assert_eq!(
            oracle.suggest_price(&CancellationToken::new()).await.unwrap(),
            U256::from(500 * SHANNON)
        );
    }

    #[tokio::test]
    async fn empty_blocks_extend_the_window() {
        // Ten priced blocks followed by twenty empty ones: the first ten
        // empties are skipped, the rest pull older blocks in.
        let mut prices: Vec<Vec<u64>> = (1..=10).map(|n| vec![n]).collect();
        prices.extend((0..20).map(|_| Vec::new()));
        let source = Arc::new(Blocks::new(&prices));
        let oracle = new_oracle(source.clone(), 1);
        let price = oracle.suggest_price(&CancellationToken::new()).await.unwrap();
        assert_eq!(price, U256::from(6u64));
        assert_eq!(source.reads.load(Ordering::SeqCst), 30);
    }

    #[tokio::test]
    async fn suggestion_is_cached_per_head() {
        let prices: Vec<Vec<u64>> = (1..=20).map(|n| vec![n]).collect();
        let source = Arc::new(Blocks::new(&prices));
        let oracle = new_oracle(source.clone(), 1);
        let token = CancellationToken::new();
        let first = oracle.suggest_price(&token).await.unwrap();
        let reads = source.reads.load(Ordering::SeqCst);
        assert_eq!(oracle.suggest_price(&token).await.unwrap(), first);
        assert_eq!(source.reads.load(Ordering::SeqCst), reads);
    }
}
