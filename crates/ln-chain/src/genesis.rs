use std::collections::BTreeMap;

use ln_consensus::clique::checkpoint_extra;
use ln_consensus::StateWriter;
use ln_types::params::GENESIS_GAS_LIMIT;
use ln_types::{Address, Block, ChainConfig, ConfigCompatError, Hash, Header, U256};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::schema::{
    read_canonical_hash, read_chain_config, read_head_header_hash, read_header_number,
    write_block, write_canonical_hash, write_chain_config, write_head_block_hash,
    write_head_header_hash, write_receipts, write_td,
};
use crate::{ChainError, Database, StateDb};

const DEFAULT_DIFFICULTY: u64 = 131_072;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub balance: U256,
    pub nonce: u64,
}

/// Specification of block zero and its initial state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub config: ChainConfig,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub gas_limit: u64,
    pub difficulty: U256,
    pub coinbase: Address,
    pub alloc: BTreeMap<Address, GenesisAccount>,
}

impl Default for Genesis {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl Genesis {
    pub fn mainnet() -> Self {
        Self {
            config: ChainConfig::mainnet(),
            timestamp: 0,
            extra_data: b"ln-node mainnet genesis".to_vec(),
            gas_limit: 5_000,
            difficulty: U256::from(17_179_869_184u64),
            coinbase: Address::zero(),
            alloc: BTreeMap::new(),
        }
    }

    /// Single-signer proof-of-authority chain funding `signer`.
    pub fn dev(signer: Address, period: u64) -> Self {
        let mut alloc = BTreeMap::new();
        alloc.insert(
            signer,
            GenesisAccount {
                balance: U256::from(u128::MAX),
                nonce: 0,
            },
        );
        Self {
            config: ChainConfig::all_clique(period),
            timestamp: 0,
            extra_data: checkpoint_extra(&[], &[signer]),
            gas_limit: 6_283_185,
            difficulty: U256::one(),
            coinbase: Address::zero(),
            alloc,
        }
    }

    /// Proof-of-work chain with every fork active, funding `accounts`.
    pub fn dev_ethash(accounts: &[Address]) -> Self {
        let alloc = accounts
            .iter()
            .map(|a| {
                (
                    *a,
                    GenesisAccount {
                        balance: U256::from(u64::MAX),
                        nonce: 0,
                    },
                )
            })
            .collect();
        Self {
            config: ChainConfig::all_ethash(),
            timestamp: 0,
            extra_data: Vec::new(),
            gas_limit: GENESIS_GAS_LIMIT,
            difficulty: U256::from(DEFAULT_DIFFICULTY),
            coinbase: Address::zero(),
            alloc,
        }
    }

    pub fn state(&self) -> StateDb {
        let mut state = StateDb::new();
        for (address, account) in &self.alloc {
            state.add_balance(address, account.balance);
            state.set_nonce(address, account.nonce);
        }
        state
    }

    pub fn to_block(&self) -> Block {
        let header = Header {
            state_root: self.state().root(),
            difficulty: if self.difficulty.is_zero() {
                U256::from(DEFAULT_DIFFICULTY)
            } else {
                self.difficulty
            },
            gas_limit: if self.gas_limit == 0 {
                GENESIS_GAS_LIMIT
            } else {
                self.gas_limit
            },
            time: self.timestamp,
            extra: self.extra_data.clone(),
            coinbase: self.coinbase,
            ..Header::default()
        };
        Block::new(header, Vec::new(), &[])
    }

    /// Write the genesis block, its state and chain config, and make it the
    /// head.
    pub fn commit(&self, db: &dyn Database) -> Result<Block, ChainError> {
        let block = self.to_block();
        let hash = block.hash();
        self.state().commit(db)?;
        write_td(db, &hash, 0, &block.difficulty())?;
        write_block(db, &block)?;
        write_receipts(db, &hash, 0, &[])?;
        write_canonical_hash(db, &hash, 0)?;
        write_head_block_hash(db, &hash)?;
        write_head_header_hash(db, &hash)?;
        write_chain_config(db, &hash, &self.config)?;
        Ok(block)
    }
}

/// Outcome of [`setup_genesis_block`].
#[derive(Debug, Clone)]
pub struct GenesisSetup {
    pub config: ChainConfig,
    pub hash: Hash,
    /// Set when the stored chain must be rewound before `config` applies.
    /// The new config has not been persisted in that case.
    pub compat: Option<ConfigCompatError>,
}

/// Make sure the store holds a genesis block and a chain config compatible
/// with `genesis`.
///
/// | store                 | `genesis` | result                           |
/// |-----------------------|-----------|----------------------------------|
/// | empty                 | none      | main-net genesis committed       |
/// | empty                 | some      | given genesis committed          |
/// | has genesis           | none      | stored config kept               |
/// | has genesis           | same      | config updated or `compat` set   |
/// | has genesis           | different | [`ChainError::GenesisMismatch`]  |
pub fn setup_genesis_block(
    db: &dyn Database,
    genesis: Option<&Genesis>,
) -> Result<GenesisSetup, ChainError> {
    let Some(stored) = read_canonical_hash(db, 0)? else {
        let genesis = match genesis {
            Some(genesis) => {
                info!("Writing custom genesis block");
                genesis.clone()
            }
            None => {
                info!("Writing default main-net genesis block");
                Genesis::mainnet()
            }
        };
        let block = genesis.commit(db)?;
        return Ok(GenesisSetup {
            config: genesis.config,
            hash: block.hash(),
            compat: None,
        });
    };

    if let Some(genesis) = genesis {
        let hash = genesis.to_block().hash();
        if hash != stored {
            return Err(ChainError::GenesisMismatch { stored, new: hash });
        }
    }

    let stored_config = read_chain_config(db, &stored)?;
    let new_config = match (genesis, &stored_config) {
        (Some(genesis), _) => genesis.config.clone(),
        (None, Some(config)) => config.clone(),
        (None, None) => ChainConfig::mainnet(),
    };
    let Some(stored_config) = stored_config else {
        warn!("Found genesis block without chain config");
        write_chain_config(db, &stored, &new_config)?;
        return Ok(GenesisSetup {
            config: new_config,
            hash: stored,
            compat: None,
        });
    };

    let head = read_head_header_hash(db)?.ok_or(ChainError::MissingBlock(stored))?;
    let height = read_header_number(db, &head)?.ok_or(ChainError::MissingBlock(head))?;
    if let Some(err) = stored_config.check_compatible(&new_config, height) {
        return Ok(GenesisSetup {
            config: new_config,
            hash: stored,
            compat: Some(err),
        });
    }
    write_chain_config(db, &stored, &new_config)?;
    Ok(GenesisSetup {
        config: new_config,
        hash: stored,
        compat: None,
    })
}
