use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ln_chain::events::EVENT_CHANNEL_CAPACITY;
use ln_chain::{schema, ChainError, ChainEvent, ChainHeadEvent, ChainSideEvent, Database, RemovedLogsEvent, StateDb};
use ln_consensus::{ChainReader, ConsensusEngine};
use ln_types::{Block, ChainConfig, Hash, Header, Log, Receipt, U256};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{OdrError, OdrRequest, OdrResponse, Retriever};

/// Bodies kept in memory after retrieval.
const BLOCK_CACHE_LIMIT: usize = 256;

/// Header chain of a light node.
///
/// Headers arrive through header sync and are stored locally; bodies,
/// receipts, total difficulties and state are fetched on demand and cached.
pub struct LightChain {
    db: Arc<dyn Database>,
    config: ChainConfig,
    engine: Arc<ConsensusEngine>,
    retriever: Arc<Retriever>,
    genesis: Header,
    head: RwLock<Header>,
    block_cache: Mutex<HashMap<Hash, Block>>,
    write_lock: Mutex<()>,
    head_feed: broadcast::Sender<ChainHeadEvent>,
    chain_feed: broadcast::Sender<ChainEvent>,
    side_feed: broadcast::Sender<ChainSideEvent>,
    removed_logs_feed: broadcast::Sender<RemovedLogsEvent>,
    logs_feed: broadcast::Sender<Vec<Log>>,
    stopped: AtomicBool,
}

impl LightChain {
    /// Open the header chain in `db`.  A genesis block must already be
    /// committed.
    pub fn new(
        db: Arc<dyn Database>,
        config: ChainConfig,
        engine: Arc<ConsensusEngine>,
        retriever: Arc<Retriever>,
    ) -> Result<Self, ChainError> {
        let genesis_hash =
            schema::read_canonical_hash(db.as_ref(), 0)?.ok_or(ChainError::NoGenesisConfig)?;
        let genesis = schema::read_header(db.as_ref(), &genesis_hash, 0)?
            .ok_or(ChainError::MissingBlock(genesis_hash))?;

        let head = match schema::read_head_header_hash(db.as_ref())? {
            Some(hash) => match schema::read_header_number(db.as_ref(), &hash)? {
                Some(number) => schema::read_header(db.as_ref(), &hash, number)?,
                None => None,
            },
            None => None,
        };
        let head = head.unwrap_or_else(|| {
            warn!("Empty header chain, starting from genesis");
            genesis.clone()
        });
        info!(number = head.number, hash = %head.hash(), "Loaded most recent local header");

        Ok(Self {
            db,
            config,
            engine,
            retriever,
            genesis,
            head: RwLock::new(head),
            block_cache: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
            head_feed: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            chain_feed: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            side_feed: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            removed_logs_feed: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            logs_feed: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn db(&self) -> Arc<dyn Database> {
        self.db.clone()
    }

    pub fn engine(&self) -> Arc<ConsensusEngine> {
        self.engine.clone()
    }

    pub fn retriever(&self) -> Arc<Retriever> {
        self.retriever.clone()
    }

    pub fn genesis(&self) -> Header {
        self.genesis.clone()
    }

    pub fn current_header(&self) -> Header {
        self.head.read().clone()
    }

    /// Append a contiguous run of headers.  Returns how many were new.
    pub fn insert_header_chain(&self, headers: &[Header]) -> Result<usize, ChainError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ChainError::ChainStopped);
        }
        let _guard = self.write_lock.lock();
        let db = self.db.as_ref();
        let mut inserted = 0;
        for header in headers {
            let hash = header.hash();
            if schema::read_header_number(db, &hash)?.is_some() {
                continue;
            }
            let number = header.number;
            let parent_td = schema::read_td(db, &header.parent_hash, number.saturating_sub(1))?
                .ok_or(ChainError::MissingBlock(header.parent_hash))?;
            self.engine.verify_header(self, header, false)?;

            let td = parent_td + header.difficulty;
            schema::write_header(db, header)?;
            schema::write_td(db, &hash, number, &td)?;
            inserted += 1;

            let head = self.current_header();
            let head_td = schema::read_td(db, &head.hash(), head.number)?.unwrap_or_default();
            if td > head_td {
                self.set_canonical(header)?;
                let _ = self.head_feed.send(ChainHeadEvent {
                    block: Block::with_header(header.clone()),
                });
                let _ = self.chain_feed.send(ChainEvent {
                    block: Block::with_header(header.clone()),
                    hash,
                    logs: Vec::new(),
                });
            } else {
                let _ = self.side_feed.send(ChainSideEvent {
                    block: Block::with_header(header.clone()),
                });
            }
        }
        if inserted > 0 {
            let head = self.current_header();
            debug!(count = inserted, number = head.number, hash = %head.hash(), "Inserted headers");
        }
        Ok(inserted)
    }

    /// Make `header` the canonical head, rewriting number mappings back to
    /// the fork point.
    fn set_canonical(&self, header: &Header) -> Result<(), ChainError> {
        let db = self.db.as_ref();
        let old = self.current_header();
        for number in header.number + 1..=old.number {
            schema::delete_canonical_hash(db, number)?;
        }
        let mut cursor = header.clone();
        loop {
            let hash = cursor.hash();
            if schema::read_canonical_hash(db, cursor.number)? == Some(hash) {
                break;
            }
            schema::write_canonical_hash(db, &hash, cursor.number)?;
            if cursor.number == 0 {
                break;
            }
            cursor = schema::read_header(db, &cursor.parent_hash, cursor.number - 1)?
                .ok_or(ChainError::MissingBlock(cursor.parent_hash))?;
        }
        schema::write_head_header_hash(db, &header.hash())?;
        *self.head.write() = header.clone();
        Ok(())
    }

    /// Rewind the header chain to `number`.
    pub fn set_head(&self, number: u64) -> Result<(), ChainError> {
        let _guard = self.write_lock.lock();
        let db = self.db.as_ref();
        let head = self.current_header();
        if number >= head.number {
            return Ok(());
        }
        warn!(from = head.number, to = number, "Rewinding header chain");
        let hash = schema::read_canonical_hash(db, number)?.ok_or(ChainError::MissingBlock(Hash::zero()))?;
        let target = schema::read_header(db, &hash, number)?.ok_or(ChainError::MissingBlock(hash))?;
        for n in number + 1..=head.number {
            schema::delete_canonical_hash(db, n)?;
        }
        schema::write_head_header_hash(db, &hash)?;
        *self.head.write() = target;
        self.block_cache.lock().clear();
        Ok(())
    }

    /// Locally stored header for `hash`.  A store failure is an error, not
    /// a miss.
    pub fn get_header_by_hash(&self, hash: &Hash) -> Result<Option<Header>, OdrError> {
        let db = self.db.as_ref();
        let Some(number) = schema::read_header_number(db, hash)? else {
            return Ok(None);
        };
        Ok(schema::read_header(db, hash, number)?)
    }

    /// Canonical header at `number` if it is stored locally.
    pub fn get_header_by_number(&self, number: u64) -> Result<Option<Header>, OdrError> {
        let db = self.db.as_ref();
        let Some(hash) = schema::read_canonical_hash(db, number)? else {
            return Ok(None);
        };
        Ok(schema::read_header(db, &hash, number)?)
    }

    /// Canonical header at `number`, asking peers when it is beyond the
    /// local header chain.
    pub async fn get_header_by_number_odr(
        &self,
        token: &CancellationToken,
        number: u64,
    ) -> Result<Option<Header>, OdrError> {
        if let Some(header) = self.get_header_by_number(number)? {
            return Ok(Some(header));
        }
        match self.retriever.retrieve(token, OdrRequest::HeaderByNumber(number)).await? {
            OdrResponse::Header(header) => Ok(header),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_block_by_hash(&self, token: &CancellationToken, hash: &Hash) -> Result<Option<Block>, OdrError> {
        if let Some(block) = self.block_cache.lock().get(hash) {
            return Ok(Some(block.clone()));
        }
        let block = match self.retriever.retrieve(token, OdrRequest::Block(*hash)).await? {
            OdrResponse::Block(Some(block)) => block,
            OdrResponse::Block(None) => return Ok(None),
            other => return Err(unexpected(other)),
        };
        if block.hash() != *hash {
            return Err(OdrError::InvalidResponse(format!("block {} for request {hash}", block.hash())));
        }
        let mut cache = self.block_cache.lock();
        if cache.len() >= BLOCK_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(*hash, block.clone());
        Ok(Some(block))
    }

    pub async fn get_block_by_number(&self, token: &CancellationToken, number: u64) -> Result<Option<Block>, OdrError> {
        match self.get_header_by_number_odr(token, number).await? {
            Some(header) => self.get_block_by_hash(token, &header.hash()).await,
            None => Ok(None),
        }
    }

    pub async fn get_receipts(&self, token: &CancellationToken, hash: &Hash) -> Result<Option<Vec<Receipt>>, OdrError> {
        let db = self.db.as_ref();
        if let Some(number) = schema::read_header_number(db, hash)? {
            if let Some(receipts) = schema::read_receipts(db, hash, number)? {
                return Ok(Some(receipts));
            }
        }
        let receipts = match self.retriever.retrieve(token, OdrRequest::Receipts(*hash)).await? {
            OdrResponse::Receipts(receipts) => receipts,
            other => return Err(unexpected(other)),
        };
        if let (Some(receipts), Some(number)) = (&receipts, schema::read_header_number(db, hash)?) {
            schema::write_receipts(db, hash, number, receipts)?;
        }
        Ok(receipts)
    }

    pub async fn get_td(&self, token: &CancellationToken, hash: &Hash) -> Result<Option<U256>, OdrError> {
        if let Some(number) = schema::read_header_number(self.db.as_ref(), hash)? {
            if let Some(td) = schema::read_td(self.db.as_ref(), hash, number)? {
                return Ok(Some(td));
            }
        }
        match self.retriever.retrieve(token, OdrRequest::Td(*hash)).await? {
            OdrResponse::Td(td) => Ok(td),
            other => Err(unexpected(other)),
        }
    }

    pub async fn state_at(&self, token: &CancellationToken, root: &Hash) -> Result<Option<StateDb>, OdrError> {
        if let Some(state) = StateDb::load(self.db.as_ref(), root)? {
            return Ok(Some(state));
        }
        match self.retriever.retrieve(token, OdrRequest::State(*root)).await? {
            OdrResponse::State(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    pub fn subscribe_chain_head_event(&self) -> broadcast::Receiver<ChainHeadEvent> {
        self.head_feed.subscribe()
    }

    pub fn subscribe_chain_event(&self) -> broadcast::Receiver<ChainEvent> {
        self.chain_feed.subscribe()
    }

    pub fn subscribe_chain_side_event(&self) -> broadcast::Receiver<ChainSideEvent> {
        self.side_feed.subscribe()
    }

    /// Header-only chains never revert logs; the feed exists so light and
    /// full nodes share one subscription surface.
    pub fn subscribe_removed_logs_event(&self) -> broadcast::Receiver<RemovedLogsEvent> {
        self.removed_logs_feed.subscribe()
    }

    pub fn subscribe_logs_event(&self) -> broadcast::Receiver<Vec<Log>> {
        self.logs_feed.subscribe()
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Light chain stopped");
        }
    }
}

/// Engine-facing lookups have no error channel; failures are logged.
fn local(result: Result<Option<Header>, OdrError>) -> Option<Header> {
    result.unwrap_or_else(|err| {
        warn!(%err, "Local header lookup failed");
        None
    })
}

fn unexpected(response: OdrResponse) -> OdrError {
    OdrError::InvalidResponse(format!("unexpected response {response:?}"))
}

impl ChainReader for LightChain {
    fn config(&self) -> ChainConfig {
        self.config.clone()
    }

    fn current_header(&self) -> Header {
        LightChain::current_header(self)
    }

    fn get_header(&self, hash: &Hash, number: u64) -> Option<Header> {
        local(schema::read_header(self.db.as_ref(), hash, number).map_err(OdrError::from))
    }

    fn get_header_by_number(&self, number: u64) -> Option<Header> {
        local(LightChain::get_header_by_number(self, number))
    }

    fn get_header_by_hash(&self, hash: &Hash) -> Option<Header> {
        local(LightChain::get_header_by_hash(self, hash))
    }
}
