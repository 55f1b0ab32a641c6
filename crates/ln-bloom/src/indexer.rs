use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ln_chain::schema::write_bloom_bits;
use ln_chain::{ChainHeadEvent, Database};
use ln_consensus::ChainReader;
use ln_types::bloom::BLOOM_BIT_LENGTH;
use ln_types::params::{BLOOM_BITS_BLOCKS, BLOOM_CONFIRMS};
use ln_types::Hash;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{BloomError, Generator};

const SECTION_COUNT_KEY: &[u8] = b"bloomindex-count";
const SECTION_HEAD_PREFIX: &[u8] = b"bloomindex-shead";

#[derive(Debug, Clone, Copy)]
pub struct BloomIndexerConfig {
    /// Blocks per section.
    pub section_size: u64,
    /// Blocks that must follow a section before it is indexed.
    pub confirms: u64,
}

impl Default for BloomIndexerConfig {
    fn default() -> Self {
        Self {
            section_size: BLOOM_BITS_BLOCKS,
            confirms: BLOOM_CONFIRMS,
        }
    }
}

/// Head hash of an indexed section.
pub fn read_section_head(db: &dyn Database, section: u64) -> Result<Option<Hash>, BloomError> {
    let key = [SECTION_HEAD_PREFIX, &section.to_be_bytes()].concat();
    match db.get(&key)? {
        Some(bytes) => Ok(Hash::from_slice(&bytes).ok()),
        None => Ok(None),
    }
}

fn read_section_count(db: &dyn Database) -> Result<u64, BloomError> {
    Ok(db
        .get(SECTION_COUNT_KEY)?
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0))
}

/// Background task rotating block blooms into per-bit section vectors as
/// the chain head advances.
pub struct BloomIndexer {
    db: Arc<dyn Database>,
    config: BloomIndexerConfig,
    sections: AtomicU64,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BloomIndexer {
    /// Resume indexing from the stored section count and follow `heads`.
    pub fn start(
        db: Arc<dyn Database>,
        chain: Arc<dyn ChainReader>,
        heads: broadcast::Receiver<ChainHeadEvent>,
        config: BloomIndexerConfig,
    ) -> Result<Arc<Self>, BloomError> {
        if config.section_size == 0 || config.section_size % 8 != 0 {
            return Err(BloomError::InvalidSectionSize(config.section_size));
        }
        let stored = read_section_count(db.as_ref())?;
        let indexer = Arc::new(Self {
            db,
            config,
            sections: AtomicU64::new(stored),
            token: CancellationToken::new(),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(indexer.clone().run(chain, heads));
        if let Ok(mut slot) = indexer.task.try_lock() {
            *slot = Some(task);
        }
        debug!(sections = stored, size = config.section_size, "Bloom indexer started");
        Ok(indexer)
    }

    async fn run(self: Arc<Self>, chain: Arc<dyn ChainReader>, mut heads: broadcast::Receiver<ChainHeadEvent>) {
        self.process(chain.as_ref(), chain.current_header().number);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                event = heads.recv() => match event {
                    Ok(ChainHeadEvent { block }) => self.process(chain.as_ref(), block.number()),
                    Err(RecvError::Lagged(_)) => {
                        self.process(chain.as_ref(), chain.current_header().number)
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }

    fn process(&self, chain: &dyn ChainReader, head: u64) {
        let size = self.config.section_size;
        loop {
            if self.token.is_cancelled() {
                return;
            }
            let section = self.sections.load(Ordering::SeqCst);
            if (section + 1) * size + self.config.confirms > head + 1 {
                return;
            }
            if let Err(err) = self.index_section(chain, section) {
                warn!(section, %err, "Bloom section indexing failed");
                return;
            }
        }
    }

    fn index_section(&self, chain: &dyn ChainReader, section: u64) -> Result<(), BloomError> {
        let size = self.config.section_size;
        let mut generator = Generator::new(size)?;
        let mut last = Hash::zero();
        for i in 0..size {
            let number = section * size + i;
            let header = chain
                .get_header_by_number(number)
                .ok_or(BloomError::SectionUnavailable(section))?;
            generator.add_bloom(i, &header.bloom)?;
            last = header.hash();
        }
        let db = self.db.as_ref();
        for bit in 0..BLOOM_BIT_LENGTH {
            write_bloom_bits(db, bit as u16, section, &last, generator.bitset(bit)?)?;
        }
        db.put(
            &[SECTION_HEAD_PREFIX, &section.to_be_bytes()].concat(),
            last.as_bytes(),
        )?;
        db.put(SECTION_COUNT_KEY, &(section + 1).to_be_bytes())?;
        self.sections.store(section + 1, Ordering::SeqCst);
        info!(section, head = %last, "Indexed bloom section");
        Ok(())
    }

    /// Number of fully indexed sections.
    pub fn sections(&self) -> u64 {
        self.sections.load(Ordering::SeqCst)
    }

    pub fn section_size(&self) -> u64 {
        self.config.section_size
    }

    pub fn db(&self) -> Arc<dyn Database> {
        self.db.clone()
    }

    /// Stop following the chain and wait for the task.
    pub async fn close(&self) {
        self.token.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
            debug!("Bloom indexer closed");
        }
    }
}
