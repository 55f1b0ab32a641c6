use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::SyncError;

/// How the node acquires chain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncMode {
    /// Download and execute every block.
    Full,
    /// Download headers and state, execute only the most recent blocks.
    #[default]
    Fast,
    /// Download headers only and fetch everything else on demand.
    Light,
}

impl SyncMode {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Full | Self::Fast | Self::Light)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::Fast => "fast",
            Self::Light => "light",
        })
    }
}

impl FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "fast" => Ok(Self::Fast),
            "light" => Ok(Self::Light),
            other => Err(SyncError::InvalidMode(other.to_string())),
        }
    }
}
