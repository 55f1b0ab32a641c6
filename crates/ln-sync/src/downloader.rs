use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libp2p_identity::PeerId;
use ln_chain::BlockChain;
use ln_types::Block;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{EventMux, NodeEvent, SyncError, SyncMode};

/// Snapshot of the current (or last) synchronisation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub starting_block: u64,
    pub current_block: u64,
    pub highest_block: u64,
}

/// Imports block batches delivered by peers, one sync at a time.
pub struct Downloader {
    mode: RwLock<SyncMode>,
    chain: Arc<BlockChain>,
    mux: EventMux,
    cancel: Mutex<CancellationToken>,
    synchronising: AtomicBool,
    terminated: AtomicBool,
    progress: RwLock<SyncProgress>,
}

impl Downloader {
    pub fn new(mode: SyncMode, chain: Arc<BlockChain>, mux: EventMux) -> Self {
        Self {
            mode: RwLock::new(mode),
            chain,
            mux,
            cancel: Mutex::new(CancellationToken::new()),
            synchronising: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            progress: RwLock::new(SyncProgress::default()),
        }
    }

    pub fn mode(&self) -> SyncMode {
        *self.mode.read()
    }

    pub(crate) fn set_mode(&self, mode: SyncMode) {
        *self.mode.write() = mode;
    }

    pub fn synchronising(&self) -> bool {
        self.synchronising.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> SyncProgress {
        *self.progress.read()
    }

    /// Abort the running sync, if any.  Later syncs are unaffected.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Cancel and refuse every future sync.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.cancel();
    }

    /// Import `blocks` from `peer`, posting start/done/failed events on the
    /// mux.  Cancellation is checked between blocks.
    pub async fn synchronise(&self, peer: PeerId, blocks: Vec<Block>) -> Result<(), SyncError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        if self.synchronising.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Busy);
        }
        let token = {
            let mut cancel = self.cancel.lock();
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
            cancel.clone()
        };

        let head = self.chain.current_block().number();
        *self.progress.write() = SyncProgress {
            starting_block: head,
            current_block: head,
            highest_block: blocks.last().map(Block::number).unwrap_or(head).max(head),
        };
        info!(%peer, mode = %self.mode(), blocks = blocks.len(), "Block synchronisation started");
        self.mux.post(NodeEvent::StartSync);

        let result = self.import(&token, blocks).await;
        self.synchronising.store(false, Ordering::SeqCst);
        match &result {
            Ok(()) => {
                debug!(%peer, head = self.chain.current_block().number(), "Synchronisation completed");
                self.mux.post(NodeEvent::DoneSync);
            }
            Err(err) => {
                warn!(%peer, %err, "Synchronisation failed");
                self.mux.post(NodeEvent::FailedSync(err.to_string()));
            }
        }
        result
    }

    async fn import(&self, token: &CancellationToken, blocks: Vec<Block>) -> Result<(), SyncError> {
        for block in blocks {
            if token.is_cancelled() || self.terminated.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled);
            }
            if !self.chain.has_block(&block.hash()) {
                let number = block.number();
                self.chain.insert_block(block)?;
                self.progress.write().current_block = number;
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}
