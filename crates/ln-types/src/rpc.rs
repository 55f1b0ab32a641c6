use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::TypesError;

/// Block selector accepted by chain queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockNumber {
    /// The block currently being assembled by a local miner.
    Pending,
    /// The current canonical head.
    Latest,
    /// The genesis block.
    Earliest,
    /// An explicit height.
    Number(u64),
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockNumber::Pending => f.write_str("pending"),
            BlockNumber::Latest => f.write_str("latest"),
            BlockNumber::Earliest => f.write_str("earliest"),
            BlockNumber::Number(n) => write!(f, "{n:#x}"),
        }
    }
}

impl FromStr for BlockNumber {
    type Err = TypesError;

    /// Accepts the symbolic tags, `0x`-prefixed hex, or decimal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(BlockNumber::Pending),
            "latest" => Ok(BlockNumber::Latest),
            "earliest" => Ok(BlockNumber::Earliest),
            other => {
                let parsed = match other.strip_prefix("0x") {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => other.parse::<u64>(),
                };
                parsed
                    .map(BlockNumber::Number)
                    .map_err(|_| TypesError::InvalidBlockNumber(s.to_string()))
            }
        }
    }
}

impl From<u64> for BlockNumber {
    fn from(n: u64) -> Self {
        BlockNumber::Number(n)
    }
}

/// A namespaced service object offered to the RPC layer.
///
/// `public` services may be exposed over untrusted transports; private ones
/// are restricted to local IPC.
#[derive(Clone)]
pub struct RpcApi {
    pub namespace: &'static str,
    pub version: &'static str,
    pub service: Arc<dyn Any + Send + Sync>,
    pub public: bool,
}

impl RpcApi {
    pub fn new<S: Any + Send + Sync>(
        namespace: &'static str,
        version: &'static str,
        service: S,
        public: bool,
    ) -> Self {
        Self {
            namespace,
            version,
            service: Arc::new(service),
            public,
        }
    }

    /// Borrow the service as its concrete type.
    pub fn downcast<S: Any + Send + Sync>(&self) -> Option<&S> {
        self.service.downcast_ref::<S>()
    }
}

impl fmt::Debug for RpcApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcApi")
            .field("namespace", &self.namespace)
            .field("version", &self.version)
            .field("public", &self.public)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tags_and_numbers() {
        assert_eq!("latest".parse::<BlockNumber>().unwrap(), BlockNumber::Latest);
        assert_eq!("pending".parse::<BlockNumber>().unwrap(), BlockNumber::Pending);
        assert_eq!("earliest".parse::<BlockNumber>().unwrap(), BlockNumber::Earliest);
        assert_eq!("0x10".parse::<BlockNumber>().unwrap(), BlockNumber::Number(16));
        assert_eq!("42".parse::<BlockNumber>().unwrap(), BlockNumber::Number(42));
        assert!("soon".parse::<BlockNumber>().is_err());
    }

    #[test]
    fn api_downcasts_to_concrete_service() {
        struct Echo(u8);
        let api = RpcApi::new("test", "1.0", Echo(7), true);
        assert_eq!(api.downcast::<Echo>().map(|e| e.0), Some(7));
        assert!(api.downcast::<String>().is_none());
    }
}
