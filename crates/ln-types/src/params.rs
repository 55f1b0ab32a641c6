//! Chain parameters, protocol constants and configuration compatibility.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::U256;

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 8;
pub const VERSION_PATCH: u32 = 2;

/// Client name embedded in the default miner extra-data.
pub const CLIENT_NAME: &str = "ln-node";

/// Maximum size of the header extra-data field a miner may set.
pub const MAXIMUM_EXTRA_DATA_SIZE: usize = 32;

/// Number of blocks in a single bloom bits section.
pub const BLOOM_BITS_BLOCKS: u64 = 4096;

/// Confirmations required before a bloom bits section is processed.
pub const BLOOM_CONFIRMS: u64 = 256;

/// Gas consumed by a plain value transfer.
pub const TX_GAS: u64 = 21_000;

/// Minimum gas limit of any block.
pub const MIN_GAS_LIMIT: u64 = 5_000;

pub const GENESIS_GAS_LIMIT: u64 = 4_712_388;

pub const WEI: u64 = 1;
pub const SHANNON: u64 = 1_000_000_000;
pub const ETHER: u128 = 1_000_000_000_000_000_000;

/// Packed client version, `major << 16 | minor << 8 | patch`.
pub fn version_number() -> u32 {
    VERSION_MAJOR << 16 | VERSION_MINOR << 8 | VERSION_PATCH
}

pub fn version_string() -> String {
    format!("{VERSION_MAJOR}.{VERSION_MINOR}.{VERSION_PATCH}")
}

/// Proof-of-authority parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliqueConfig {
    /// Seconds between blocks.
    pub period: u64,
    /// Number of blocks after which votes are reset and a checkpoint written.
    pub epoch: u64,
}

impl Default for CliqueConfig {
    fn default() -> Self {
        Self {
            period: 15,
            epoch: 30_000,
        }
    }
}

/// Core chain configuration, persisted alongside the genesis hash.
///
/// A `None` fork block means the fork is not scheduled.  The presence of
/// `clique` selects proof-of-authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub homestead_block: Option<u64>,
    pub eip150_block: Option<u64>,
    pub eip155_block: Option<u64>,
    pub eip158_block: Option<u64>,
    pub byzantium_block: Option<u64>,
    pub clique: Option<CliqueConfig>,
}

impl ChainConfig {
    pub fn mainnet() -> Self {
        Self {
            chain_id: 1,
            homestead_block: Some(1_150_000),
            eip150_block: Some(2_463_000),
            eip155_block: Some(2_675_000),
            eip158_block: Some(2_675_000),
            byzantium_block: Some(4_370_000),
            clique: None,
        }
    }

    /// Every fork active from genesis, proof-of-work.
    pub fn all_ethash() -> Self {
        Self {
            chain_id: 1337,
            homestead_block: Some(0),
            eip150_block: Some(0),
            eip155_block: Some(0),
            eip158_block: Some(0),
            byzantium_block: Some(0),
            clique: None,
        }
    }

    /// Every fork active from genesis, proof-of-authority.
    pub fn all_clique(period: u64) -> Self {
        Self {
            clique: Some(CliqueConfig {
                period,
                epoch: 30_000,
            }),
            ..Self::all_ethash()
        }
    }

    pub fn is_homestead(&self, number: u64) -> bool {
        is_forked(self.homestead_block, number)
    }

    pub fn is_eip155(&self, number: u64) -> bool {
        is_forked(self.eip155_block, number)
    }

    pub fn is_byzantium(&self, number: u64) -> bool {
        is_forked(self.byzantium_block, number)
    }

    /// Check whether a chain with head `height` that was produced under
    /// `self` can continue under `new`.  Returns the most recent
    /// incompatibility found.
    pub fn check_compatible(&self, new: &ChainConfig, height: u64) -> Option<ConfigCompatError> {
        let forks = [
            ("Homestead fork block", self.homestead_block, new.homestead_block),
            ("EIP150 fork block", self.eip150_block, new.eip150_block),
            ("EIP155 fork block", self.eip155_block, new.eip155_block),
            ("EIP158 fork block", self.eip158_block, new.eip158_block),
            ("Byzantium fork block", self.byzantium_block, new.byzantium_block),
        ];
        let mut last = None;
        for (what, stored, next) in forks {
            if is_fork_incompatible(stored, next, height) {
                last = Some(ConfigCompatError::new(what, stored, next));
            }
        }
        if self.is_eip155(height) && self.chain_id != new.chain_id {
            last = Some(ConfigCompatError::new(
                "EIP155 chain ID",
                self.eip155_block,
                new.eip155_block,
            ));
        }
        last
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl fmt::Display for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engine = match self.clique {
            Some(_) => "clique",
            None => "ethash",
        };
        write!(
            f,
            "{{ChainID: {} Homestead: {:?} EIP150: {:?} EIP155: {:?} EIP158: {:?} Byzantium: {:?} Engine: {}}}",
            self.chain_id,
            self.homestead_block,
            self.eip150_block,
            self.eip155_block,
            self.eip158_block,
            self.byzantium_block,
            engine
        )
    }
}

fn is_forked(fork: Option<u64>, head: u64) -> bool {
    matches!(fork, Some(block) if block <= head)
}

fn is_fork_incompatible(stored: Option<u64>, new: Option<u64>, head: u64) -> bool {
    (is_forked(stored, head) || is_forked(new, head)) && stored != new
}

/// A stored chain configuration that cannot be carried forward without
/// rewinding the chain to `rewind_to`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("mismatching {what} in database (have {stored:?}, want {new:?}, rewindto {rewind_to})")]
pub struct ConfigCompatError {
    pub what: String,
    pub stored: Option<u64>,
    pub new: Option<u64>,
    /// Block to rewind to so the new configuration applies.
    pub rewind_to: u64,
}

impl ConfigCompatError {
    fn new(what: &str, stored: Option<u64>, new: Option<u64>) -> Self {
        let earliest = match (stored, new) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => 0,
        };
        Self {
            what: what.to_string(),
            stored,
            new,
            rewind_to: earliest.saturating_sub(1),
        }
    }
}

/// Block reward credited to the miner by proof-of-work chains.
pub fn block_reward(config: &ChainConfig, number: u64) -> U256 {
    let base: u64 = if config.is_byzantium(number) { 3 } else { 5 };
    U256::from(base) * U256::from(ETHER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_configs_are_compatible() {
        let c = ChainConfig::mainnet();
        assert!(c.check_compatible(&c.clone(), 10_000_000).is_none());
    }

    #[test]
    fn fork_change_compatibility_depends_on_head() {
        let stored = ChainConfig::all_ethash();
        let mut new = stored.clone();
        new.byzantium_block = Some(100);
        // Head at 10: byzantium was active at 0 under the stored config, so
        // moving it is incompatible.
        let err = stored.check_compatible(&new, 10).unwrap();
        assert_eq!(err.rewind_to, 0);

        let mut later = ChainConfig::mainnet();
        later.byzantium_block = Some(5_000_000);
        assert!(ChainConfig::mainnet().check_compatible(&later, 100).is_none());
    }

    #[test]
    fn rewind_targets_block_before_earliest_fork() {
        let mut stored = ChainConfig::all_ethash();
        stored.byzantium_block = Some(50);
        let mut new = stored.clone();
        new.byzantium_block = Some(30);
        let err = stored.check_compatible(&new, 60).unwrap();
        assert_eq!(err.what, "Byzantium fork block");
        assert_eq!(err.rewind_to, 29);
    }

    #[test]
    fn chain_id_change_after_eip155_is_incompatible() {
        let stored = ChainConfig::all_ethash();
        let mut new = stored.clone();
        new.chain_id = 9;
        assert!(stored.check_compatible(&new, 1).is_some());
    }

    #[test]
    fn packed_version_matches_components() {
        assert_eq!(version_number() >> 16, VERSION_MAJOR);
        assert_eq!(version_string(), "1.8.2");
    }
}
