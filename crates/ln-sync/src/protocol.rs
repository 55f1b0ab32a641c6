use ln_types::{Block, Hash, Transaction, U256};
use serde::{Deserialize, Serialize};

/// Gossip topics carrying the broadcast half of the protocol.
pub const TOPIC_TX: &str = "ln/eth/tx";
pub const TOPIC_BLOCK: &str = "ln/eth/block";
pub const TOPIC_STATUS: &str = "ln/eth/status";

pub const ETH62: u32 = 62;
pub const ETH63: u32 = 63;

/// A versioned sub-protocol advertised to the p2p server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    pub name: &'static str,
    pub version: u32,
    /// Number of message codes the version uses.
    pub length: u64,
}

impl ProtocolDescriptor {
    pub const fn eth(version: u32) -> Self {
        let length = if version == ETH63 { 17 } else { 8 };
        Self {
            name: "eth",
            version,
            length,
        }
    }

    /// Identifier used when negotiating with libp2p peers.
    pub fn id(&self) -> String {
        format!("/ln/{}/{}", self.name, self.version)
    }
}

/// Messages exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Handshake: chain identity and head.
    Status {
        network_id: u64,
        td: U256,
        head: Hash,
        genesis: Hash,
    },
    Transactions(Vec<Transaction>),
    /// A freshly mined block and the sender's total difficulty including it.
    NewBlock { block: Block, td: U256 },
    /// Blocks answering a sync request, oldest first.
    Blocks(Vec<Block>),
}

impl SyncMessage {
    /// Topic a message is gossiped on.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Status { .. } => TOPIC_STATUS,
            Self::Transactions(_) => TOPIC_TX,
            Self::NewBlock { .. } | Self::Blocks(_) => TOPIC_BLOCK,
        }
    }
}

pub fn encode_message(msg: &SyncMessage) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

pub fn decode_message(bytes: &[u8]) -> Result<SyncMessage, bincode::Error> {
    bincode::deserialize(bytes)
}
