//! Proof-of-work engine.

mod dataset;

pub use dataset::{seed_hash, Cache, Dataset, DatasetCache, DatasetCacheConfig, EPOCH_LENGTH};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use ln_types::params::{block_reward, MAXIMUM_EXTRA_DATA_SIZE, MIN_GAS_LIMIT};
use ln_types::{Address, Block, ChainConfig, Hash, Header, Receipt, RpcApi, Transaction, U256};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ChainReader, ConsensusError, StateWriter};

/// Rounds of dataset lookups mixed into every hash attempt.
const HASHIMOTO_ROUNDS: usize = 64;

/// Seconds a header may be ahead of local time.
const ALLOWED_FUTURE_BLOCK_TIME: u64 = 15;

const MINIMUM_DIFFICULTY: u64 = 131_072;
const DIFFICULTY_BOUND_DIVISOR: u64 = 2048;
const DURATION_LIMIT: u64 = 13;
const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;

/// Nonces tried between abort checks.
const NONCE_BATCH: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowMode {
    #[default]
    Normal,
    /// Seals instantly and accepts any seal.
    Fake,
    /// Shrunk caches and datasets.
    Test,
    /// Test-sized datasets from a process-wide cache.
    Shared,
}

/// Proof-of-work engine options.
#[derive(Debug, Clone)]
pub struct EthashConfig {
    pub cache_dir: PathBuf,
    pub caches_in_mem: usize,
    pub caches_on_disk: usize,
    pub dataset_dir: PathBuf,
    pub datasets_in_mem: usize,
    pub datasets_on_disk: usize,
    pub pow_mode: PowMode,
}

impl Default for EthashConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            cache_dir: PathBuf::from("ethash"),
            caches_in_mem: 2,
            caches_on_disk: 3,
            dataset_dir: home.join(".ethash"),
            datasets_in_mem: 1,
            datasets_on_disk: 2,
            pow_mode: PowMode::Normal,
        }
    }
}

struct Inner {
    mode: PowMode,
    caches: Arc<DatasetCache>,
    threads: AtomicI32,
    hashes: AtomicU64,
    hashrate: AtomicU64,
}

/// Hash-search sealing over per-epoch datasets.
#[derive(Clone)]
pub struct Ethash {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Ethash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ethash")
            .field("mode", &self.inner.mode)
            .field("threads", &self.threads())
            .finish()
    }
}

impl Ethash {
    /// Engine in `Normal` or `Test` mode with its own caches.
    pub fn new(config: EthashConfig) -> Self {
        if config.caches_in_mem == 0 {
            warn!("Disabling ethash verification caches is not supported, keeping one");
        }
        let cache_dir = (config.caches_on_disk > 0).then(|| config.cache_dir.clone());
        let dataset_dir = (config.datasets_on_disk > 0).then(|| config.dataset_dir.clone());
        info!(
            dir = %config.cache_dir.display(),
            in_mem = config.caches_in_mem,
            on_disk = config.caches_on_disk,
            "Ethash caches configured"
        );
        let caches = Arc::new(DatasetCache::new(DatasetCacheConfig {
            cache_dir,
            caches_in_mem: config.caches_in_mem,
            caches_on_disk: config.caches_on_disk,
            dataset_dir,
            datasets_in_mem: config.datasets_in_mem,
            datasets_on_disk: config.datasets_on_disk,
            test: config.pow_mode == PowMode::Test,
        }));
        Self::with_caches(config.pow_mode, caches)
    }

    /// Engine accepting every seal.
    pub fn new_fake() -> Self {
        Self::with_caches(PowMode::Fake, DatasetCache::shared())
    }

    /// Engine backed by a cache shared with other engines.
    pub fn new_shared(caches: Arc<DatasetCache>) -> Self {
        Self::with_caches(PowMode::Shared, caches)
    }

    fn with_caches(mode: PowMode, caches: Arc<DatasetCache>) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                caches,
                threads: AtomicI32::new(0),
                hashes: AtomicU64::new(0),
                hashrate: AtomicU64::new(0),
            }),
        }
    }

    pub fn mode(&self) -> PowMode {
        self.inner.mode
    }

    /// The cache this engine reads datasets from.
    pub fn dataset_cache(&self) -> Arc<DatasetCache> {
        self.inner.caches.clone()
    }

    pub fn threads(&self) -> i32 {
        self.inner.threads.load(Ordering::Relaxed)
    }

    /// Mining threads.  Zero uses every available core; a negative value
    /// disables local mining so [`Ethash::seal`] only waits to be stopped.
    pub fn set_threads(&self, threads: i32) {
        self.inner.threads.store(threads, Ordering::Relaxed);
    }

    /// Hashes per second measured during the last seal.
    pub fn hashrate(&self) -> u64 {
        self.inner.hashrate.load(Ordering::Relaxed)
    }

    pub fn author(&self, header: &Header) -> Address {
        header.coinbase
    }

    pub fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        seal: bool,
    ) -> Result<(), ConsensusError> {
        let number = header.number;
        let parent = number
            .checked_sub(1)
            .and_then(|n| chain.get_header(&header.parent_hash, n))
            .ok_or(ConsensusError::UnknownAncestor(header.parent_hash))?;

        if header.extra.len() > MAXIMUM_EXTRA_DATA_SIZE {
            return Err(ConsensusError::ExtraDataTooLong {
                len: header.extra.len(),
                max: MAXIMUM_EXTRA_DATA_SIZE,
            });
        }
        if header.time > now() + ALLOWED_FUTURE_BLOCK_TIME {
            return Err(ConsensusError::FutureBlock);
        }
        if header.time <= parent.time {
            return Err(ConsensusError::InvalidTimestamp);
        }
        let expected = calc_difficulty(&chain.config(), header.time, &parent);
        if header.difficulty != expected {
            return Err(ConsensusError::InvalidDifficulty {
                have: header.difficulty.to_string(),
                want: expected.to_string(),
            });
        }
        verify_gas_limit(&parent, header)?;
        if header.number != parent.number + 1 {
            return Err(ConsensusError::InvalidNumber {
                have: header.number,
                want: parent.number + 1,
            });
        }
        if seal {
            self.verify_seal(header)?;
        }
        Ok(())
    }

    /// Check the header's nonce against its difficulty target.
    pub fn verify_seal(&self, header: &Header) -> Result<(), ConsensusError> {
        if self.inner.mode == PowMode::Fake {
            return Ok(());
        }
        if header.difficulty.is_zero() {
            return Err(ConsensusError::InvalidDifficulty {
                have: "0".into(),
                want: "non-zero".into(),
            });
        }
        let cache = self.inner.caches.cache(header.number)?;
        let (digest, result) = hashimoto(
            &header.hash_no_nonce(),
            header.nonce,
            cache.dataset_size(),
            |i| cache.item(i),
        );
        if digest != header.mix_digest {
            return Err(ConsensusError::InvalidMixDigest);
        }
        if U256::from_big_endian(result.as_bytes()) > target(header.difficulty) {
            return Err(ConsensusError::InvalidPoW);
        }
        Ok(())
    }

    pub fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> Result<(), ConsensusError> {
        let parent = header
            .number
            .checked_sub(1)
            .and_then(|n| chain.get_header(&header.parent_hash, n))
            .ok_or(ConsensusError::UnknownAncestor(header.parent_hash))?;
        header.difficulty = calc_difficulty(&chain.config(), header.time, &parent);
        Ok(())
    }

    /// Credit the block reward and assemble the block.
    pub fn finalize(
        &self,
        chain: &dyn ChainReader,
        mut header: Header,
        state: &mut dyn StateWriter,
        transactions: Vec<Transaction>,
        receipts: &[Receipt],
    ) -> Block {
        state.add_balance(&header.coinbase, block_reward(&chain.config(), header.number));
        header.state_root = state.intermediate_root();
        Block::new(header, transactions, receipts)
    }

    /// Search for a nonce satisfying the block's difficulty.  Returns
    /// `Ok(None)` if `stop` fires first.
    pub async fn seal(
        &self,
        block: &Block,
        stop: CancellationToken,
    ) -> Result<Option<Block>, ConsensusError> {
        if self.inner.mode == PowMode::Fake {
            let mut header = block.header.clone();
            header.nonce = 0;
            header.mix_digest = Hash::zero();
            return Ok(Some(block.with_seal(header)));
        }
        let threads = self.threads();
        if threads < 0 {
            debug!(number = block.number(), "Local mining disabled, waiting for stop");
            stop.cancelled().await;
            return Ok(None);
        }
        let threads = match threads {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n as usize,
        };

        let caches = self.inner.caches.clone();
        let number = block.number();
        let dataset = tokio::task::spawn_blocking(move || caches.dataset(number))
            .await
            .map_err(|e| ConsensusError::Dataset(e.to_string()))??;

        let seal_hash = block.header.hash_no_nonce();
        let target = target(block.header.difficulty);
        let abort = Arc::new(AtomicBool::new(false));
        let (found_tx, mut found_rx) = mpsc::channel(threads);
        let seed: u64 = rand::thread_rng().gen();
        let started = std::time::Instant::now();
        self.inner.hashes.store(0, Ordering::Relaxed);

        for id in 0..threads {
            let dataset = dataset.clone();
            let abort = abort.clone();
            let found_tx = found_tx.clone();
            let inner = self.inner.clone();
            tokio::task::spawn_blocking(move || {
                let mut nonce = seed.wrapping_add(id as u64 * (u64::MAX / threads as u64));
                while !abort.load(Ordering::Relaxed) {
                    for _ in 0..NONCE_BATCH {
                        let (digest, result) =
                            hashimoto(&seal_hash, nonce, dataset.len(), |i| dataset.item(i));
                        if U256::from_big_endian(result.as_bytes()) <= target {
                            let _ = found_tx.blocking_send((nonce, digest));
                            return;
                        }
                        nonce = nonce.wrapping_add(1);
                    }
                    inner.hashes.fetch_add(NONCE_BATCH, Ordering::Relaxed);
                }
            });
        }
        drop(found_tx);

        let outcome = tokio::select! {
            _ = stop.cancelled() => None,
            found = found_rx.recv() => found,
        };
        abort.store(true, Ordering::Relaxed);

        let elapsed = started.elapsed().as_secs().max(1);
        self.inner
            .hashrate
            .store(self.inner.hashes.load(Ordering::Relaxed) / elapsed, Ordering::Relaxed);

        Ok(outcome.map(|(nonce, digest)| {
            let mut header = block.header.clone();
            header.nonce = nonce;
            header.mix_digest = digest;
            debug!(number, nonce, "Ethash nonce found");
            block.with_seal(header)
        }))
    }

    pub fn apis(&self) -> Vec<RpcApi> {
        vec![RpcApi::new(
            "ethash",
            "1.0",
            EthashApi {
                ethash: self.clone(),
            },
            true,
        )]
    }
}

/// `ethash` RPC namespace.
pub struct EthashApi {
    ethash: Ethash,
}

impl EthashApi {
    pub fn hashrate(&self) -> u64 {
        self.ethash.hashrate()
    }

    pub fn mode(&self) -> PowMode {
        self.ethash.mode()
    }
}

/// Mix `nonce` into `seal_hash` through dataset lookups.  Returns the mix
/// digest and the final hash compared against the target.
pub fn hashimoto(
    seal_hash: &Hash,
    nonce: u64,
    size: usize,
    lookup: impl Fn(usize) -> Hash,
) -> (Hash, Hash) {
    let mut seed = Sha256::new();
    seed.update(seal_hash.0);
    seed.update(nonce.to_be_bytes());
    let seed: [u8; 32] = seed.finalize().into();

    let mut mix = seed;
    for _ in 0..HASHIMOTO_ROUNDS {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&mix[..8]);
        let index = (u64::from_be_bytes(prefix) % size as u64) as usize;
        let mut hasher = Sha256::new();
        hasher.update(mix);
        hasher.update(lookup(index).0);
        mix = hasher.finalize().into();
    }

    let mut result = Sha256::new();
    result.update(seed);
    result.update(mix);
    (Hash(mix), Hash(result.finalize().into()))
}

/// `2^256 / difficulty`, saturated to `U256::MAX`.
fn target(difficulty: U256) -> U256 {
    if difficulty <= U256::one() {
        return U256::MAX;
    }
    U256::MAX / difficulty
}

/// Difficulty a child of `parent` created at `time` must have.
pub fn calc_difficulty(config: &ChainConfig, time: u64, parent: &Header) -> U256 {
    let adjust = parent.difficulty / U256::from(DIFFICULTY_BOUND_DIVISOR);
    let elapsed = time.saturating_sub(parent.time);
    let diff = if config.is_homestead(parent.number + 1) {
        // parent_diff + parent_diff / 2048 * max(1 - elapsed / 10, -99)
        let steps = elapsed / 10;
        if steps == 0 {
            parent.difficulty + adjust
        } else {
            let down = (steps - 1).min(99);
            parent.difficulty.saturating_sub(adjust * U256::from(down))
        }
    } else if elapsed < DURATION_LIMIT {
        parent.difficulty + adjust
    } else {
        parent.difficulty.saturating_sub(adjust)
    };
    diff.max(U256::from(MINIMUM_DIFFICULTY))
}

fn verify_gas_limit(parent: &Header, header: &Header) -> Result<(), ConsensusError> {
    if header.gas_used > header.gas_limit {
        return Err(ConsensusError::InvalidGasLimit(format!(
            "gas used {} exceeds limit {}",
            header.gas_used, header.gas_limit
        )));
    }
    let limit = parent.gas_limit / GAS_LIMIT_BOUND_DIVISOR;
    let diff = parent.gas_limit.abs_diff(header.gas_limit);
    if diff >= limit.max(1) || header.gas_limit < MIN_GAS_LIMIT {
        return Err(ConsensusError::InvalidGasLimit(format!(
            "have {}, want {} +-{}",
            header.gas_limit, parent.gas_limit, limit
        )));
    }
    Ok(())
}

fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Headers {
        config: ChainConfig,
        headers: HashMap<Hash, Header>,
    }

    impl ChainReader for Headers {
        fn config(&self) -> ChainConfig {
            self.config.clone()
        }
        fn current_header(&self) -> Header {
            self.headers.values().max_by_key(|h| h.number).cloned().unwrap_or_default()
        }
        fn get_header(&self, hash: &Hash, number: u64) -> Option<Header> {
            self.headers.get(hash).filter(|h| h.number == number).cloned()
        }
        fn get_header_by_number(&self, number: u64) -> Option<Header> {
            self.headers.values().find(|h| h.number == number).cloned()
        }
        fn get_header_by_hash(&self, hash: &Hash) -> Option<Header> {
            self.headers.get(hash).cloned()
        }
    }

    fn genesis() -> Header {
        Header {
            difficulty: U256::from(MINIMUM_DIFFICULTY),
            gas_limit: 4_712_388,
            time: 1_000,
            ..Header::default()
        }
    }

    fn child_of(chain: &Headers, engine: &Ethash, parent: &Header) -> Header {
        let mut header = Header {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            gas_limit: parent.gas_limit,
            time: parent.time + 10,
            ..Header::default()
        };
        engine.prepare(chain, &mut header).unwrap();
        header
    }

    fn chain_with(parent: &Header) -> Headers {
        Headers {
            config: ChainConfig::all_ethash(),
            headers: HashMap::from([(parent.hash(), parent.clone())]),
        }
    }

    #[test]
    fn difficulty_rises_for_fast_blocks_and_falls_for_slow_ones() {
        let config = ChainConfig::all_ethash();
        let parent = Header {
            difficulty: U256::from(1_000_000u64),
            ..genesis()
        };
        let fast = calc_difficulty(&config, parent.time + 5, &parent);
        let slow = calc_difficulty(&config, parent.time + 40, &parent);
        assert!(fast > parent.difficulty);
        assert!(slow < parent.difficulty);
        assert_eq!(
            calc_difficulty(&config, parent.time + 100_000, &genesis()),
            U256::from(MINIMUM_DIFFICULTY)
        );
    }

    #[tokio::test]
    async fn fake_mode_seals_instantly_and_verifies() {
        let engine = Ethash::new_fake();
        let parent = genesis();
        let chain = chain_with(&parent);
        let header = child_of(&chain, &engine, &parent);
        let block = Block::new(header, Vec::new(), &[]);
        let sealed = engine
            .seal(&block, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        engine.verify_header(&chain, &sealed.header, true).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shared_mode_seal_passes_verification() {
        let engine = Ethash::new_shared(DatasetCache::shared());
        engine.set_threads(1);
        let parent = genesis();
        let chain = chain_with(&parent);
        let mut header = child_of(&chain, &engine, &parent);
        // Keep the search short.
        header.difficulty = U256::from(64);
        let block = Block::new(header, Vec::new(), &[]);
        let sealed = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            engine.seal(&block, CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        engine.verify_seal(&sealed.header).unwrap();

        let mut forged = sealed.header.clone();
        forged.mix_digest = Hash::digest(b"forged");
        assert!(matches!(
            engine.verify_seal(&forged),
            Err(ConsensusError::InvalidMixDigest)
        ));
    }

    #[tokio::test]
    async fn disabled_threads_wait_for_stop() {
        let engine = Ethash::new_shared(DatasetCache::shared());
        engine.set_threads(-1);
        let block = Block::new(genesis(), Vec::new(), &[]);
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });
        assert!(engine.seal(&block, stop).await.unwrap().is_none());
    }

    #[test]
    fn header_checks_reject_bad_parent_and_extra() {
        let engine = Ethash::new_fake();
        let parent = genesis();
        let chain = chain_with(&parent);

        let mut orphan = child_of(&chain, &engine, &parent);
        orphan.parent_hash = Hash::digest(b"missing");
        assert!(matches!(
            engine.verify_header(&chain, &orphan, false),
            Err(ConsensusError::UnknownAncestor(_))
        ));

        let mut long_extra = child_of(&chain, &engine, &parent);
        long_extra.extra = vec![0u8; MAXIMUM_EXTRA_DATA_SIZE + 1];
        assert!(matches!(
            engine.verify_header(&chain, &long_extra, false),
            Err(ConsensusError::ExtraDataTooLong { .. })
        ));
    }

    #[test]
    fn shared_engines_share_generated_datasets() {
        let shared = DatasetCache::shared();
        let a = Ethash::new_shared(shared.clone());
        let b = Ethash::new_shared(shared.clone());
        a.dataset_cache().dataset(0).unwrap();
        let generated = shared.generated();
        b.dataset_cache().dataset(0).unwrap();
        assert_eq!(shared.generated(), generated);
        assert!(Arc::ptr_eq(&a.dataset_cache(), &b.dataset_cache()));
    }
}
