use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ln_chain::schema::read_bloom_bits;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::indexer::read_section_head;
use crate::{BloomError, BloomIndexer, MatcherSession};

/// Default number of workers draining the session queue.
pub const BLOOM_FILTER_THREADS: usize = 3;

/// Sessions a worker services per batch.
pub const BLOOM_RETRIEVAL_BATCH: usize = 16;

/// How long a worker waits to fill a batch before serving what it has.
pub const BLOOM_RETRIEVAL_WAIT: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy)]
pub struct MultiplexerConfig {
    pub threads: usize,
    pub batch: usize,
    pub wait: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            threads: BLOOM_FILTER_THREADS,
            batch: BLOOM_RETRIEVAL_BATCH,
            wait: BLOOM_RETRIEVAL_WAIT,
        }
    }
}

type SessionQueue = Arc<Mutex<mpsc::UnboundedReceiver<MatcherSession>>>;

/// Fixed pool of workers serving filter sessions from the bloom index.
///
/// Sessions are pushed onto one unbounded queue.  Each worker takes up to
/// `batch` sessions, waiting at most `wait` for a partial batch to fill,
/// then serves them against the indexed sections.
pub struct BloomRetrievalMultiplexer {
    queue: mpsc::UnboundedSender<MatcherSession>,
    receiver: SessionQueue,
    indexer: Arc<BloomIndexer>,
    config: MultiplexerConfig,
    served: Arc<AtomicU64>,
    token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BloomRetrievalMultiplexer {
    pub fn new(indexer: Arc<BloomIndexer>, config: MultiplexerConfig) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        Self {
            queue,
            receiver: Arc::new(Mutex::new(receiver)),
            indexer,
            config: MultiplexerConfig {
                threads: config.threads.max(1),
                batch: config.batch.max(1),
                wait: config.wait,
            },
            served: Arc::new(AtomicU64::new(0)),
            token: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the workers.  Calling it again while running does nothing.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for id in 0..self.config.threads {
            let worker = Worker {
                id,
                queue: self.receiver.clone(),
                indexer: self.indexer.clone(),
                config: self.config,
                served: self.served.clone(),
                token: self.token.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        debug!(threads = self.config.threads, "Bloom retrieval workers started");
    }

    /// Queue a session.  Its matcher must use the indexer's section size.
    pub fn serve(&self, session: MatcherSession) -> Result<(), BloomError> {
        if self.token.is_cancelled() {
            return Err(BloomError::Closed);
        }
        let (matcher, indexed) = (session.matcher.section_size(), self.indexer.section_size());
        if matcher != indexed {
            return Err(BloomError::SectionSizeMismatch { matcher, indexed });
        }
        self.queue.send(session).map_err(|_| BloomError::Closed)
    }

    /// Sessions served so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub async fn running_workers(&self) -> usize {
        self.workers
            .lock()
            .await
            .iter()
            .filter(|w| !w.is_finished())
            .count()
    }

    /// Stop every worker and wait for them to exit.
    pub async fn close(&self) {
        self.token.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            let _ = worker.await;
        }
    }
}

struct Worker {
    id: usize,
    queue: SessionQueue,
    indexer: Arc<BloomIndexer>,
    config: MultiplexerConfig,
    served: Arc<AtomicU64>,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let Some(batch) = self.next_batch().await else {
                trace!(worker = self.id, "Bloom retrieval worker exiting");
                return;
            };
            trace!(worker = self.id, sessions = batch.len(), "Serving bloom batch");
            for session in batch {
                if let Err(err) = self.serve(&session) {
                    warn!(worker = self.id, %err, "Bloom session failed");
                }
                self.served.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Wait for one session, then fill the batch for at most `wait`.
    async fn next_batch(&self) -> Option<Vec<MatcherSession>> {
        let mut queue = tokio::select! {
            _ = self.token.cancelled() => return None,
            queue = self.queue.lock() => queue,
        };
        let first = tokio::select! {
            _ = self.token.cancelled() => return None,
            session = queue.recv() => session?,
        };
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + self.config.wait;
        while batch.len() < self.config.batch {
            match tokio::time::timeout_at(deadline, queue.recv()).await {
                Ok(Some(session)) => batch.push(session),
                Ok(None) | Err(_) => break,
            }
        }
        Some(batch)
    }

    fn serve(&self, session: &MatcherSession) -> Result<(), BloomError> {
        let size = self.indexer.section_size();
        let db = self.indexer.db();
        let indexed = self.indexer.sections();
        let bits = session.matcher.bits();

        let first = session.begin / size;
        let last = (session.end / size).min(indexed.saturating_sub(1));
        if indexed == 0 || first > last {
            return Ok(());
        }
        for section in first..=last {
            if session.cancel.is_cancelled() || session.results.is_closed() {
                return Ok(());
            }
            let head = read_section_head(db.as_ref(), section)?
                .ok_or(BloomError::SectionUnavailable(section))?;
            let mut vectors = std::collections::HashMap::with_capacity(bits.len());
            for bit in &bits {
                let vector = read_bloom_bits(db.as_ref(), *bit as u16, section, &head)?
                    .ok_or(BloomError::SectionUnavailable(section))?;
                vectors.insert(*bit, vector);
            }
            let matches = session
                .matcher
                .match_section(|bit| vectors.get(&bit).cloned().unwrap_or_default());
            for (byte_index, byte) in matches.iter().enumerate() {
                for offset in 0..8u64 {
                    if byte & (0x80 >> offset) == 0 {
                        continue;
                    }
                    let number = section * size + byte_index as u64 * 8 + offset;
                    if number < session.begin || number > session.end {
                        continue;
                    }
                    if session.results.send(number).is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}
