use std::collections::HashMap;

use libp2p_identity::PeerId;
use ln_types::{Hash, U256};
use parking_lot::RwLock;
use tracing::debug;

use crate::SyncError;

/// What we know about a remote peer's chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub head: Hash,
    pub td: U256,
}

/// Bounded set of connected protocol peers.
pub struct PeerSet {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    max_peers: RwLock<usize>,
}

impl PeerSet {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_peers: RwLock::new(max_peers),
        }
    }

    pub fn set_max_peers(&self, max: usize) {
        *self.max_peers.write() = max;
    }

    pub fn max_peers(&self) -> usize {
        *self.max_peers.read()
    }

    pub fn register(&self, id: PeerId, info: PeerInfo) -> Result<(), SyncError> {
        let max = self.max_peers();
        let mut peers = self.peers.write();
        if peers.contains_key(&id) {
            return Err(SyncError::AlreadyRegistered(id));
        }
        if peers.len() >= max {
            return Err(SyncError::TooManyPeers(max));
        }
        debug!(peer = %id, td = %info.td, "Registered protocol peer");
        peers.insert(id, info);
        Ok(())
    }

    pub fn unregister(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.write().remove(id)
    }

    /// Record a newer head announced by `id`.
    pub fn set_head(&self, id: &PeerId, head: Hash, td: U256) {
        if let Some(info) = self.peers.write().get_mut(id) {
            info.head = head;
            info.td = td;
        }
    }

    pub fn peer(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().get(id).cloned()
    }

    /// Peer with the highest total difficulty.
    pub fn best_peer(&self) -> Option<(PeerId, PeerInfo)> {
        self.peers
            .read()
            .iter()
            .max_by_key(|(_, info)| info.td)
            .map(|(id, info)| (*id, info.clone()))
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.peers.write().clear();
    }
}
