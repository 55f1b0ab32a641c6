use ln_types::{Block, Hash, Log};
use tokio::sync::broadcast;

/// Capacity of each chain event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A block was inserted into the canonical chain.
#[derive(Debug, Clone)]
pub struct ChainEvent {
    pub block: Block,
    pub hash: Hash,
    pub logs: Vec<Log>,
}

/// The canonical head changed.
#[derive(Debug, Clone)]
pub struct ChainHeadEvent {
    pub block: Block,
}

/// A block was stored off the canonical chain, or dropped from it.
#[derive(Debug, Clone)]
pub struct ChainSideEvent {
    pub block: Block,
}

/// Logs reverted by a reorganisation.
#[derive(Debug, Clone)]
pub struct RemovedLogsEvent {
    pub logs: Vec<Log>,
}

pub(crate) struct ChainFeeds {
    pub chain: broadcast::Sender<ChainEvent>,
    pub head: broadcast::Sender<ChainHeadEvent>,
    pub side: broadcast::Sender<ChainSideEvent>,
    pub removed_logs: broadcast::Sender<RemovedLogsEvent>,
    pub logs: broadcast::Sender<Vec<Log>>,
}

impl ChainFeeds {
    pub fn new() -> Self {
        Self {
            chain: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            head: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            side: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            removed_logs: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            logs: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }
}
