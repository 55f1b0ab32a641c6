//! Consensus engines.
//!
//! A node runs exactly one [`ConsensusEngine`], chosen once at construction:
//! proof-of-work ([`Ethash`]) or proof-of-authority ([`Clique`]).

pub mod chain;
pub mod clique;
pub mod engine;
pub mod error;
pub mod ethash;
pub mod signature;

pub use chain::{ChainReader, StateWriter};
pub use clique::{Clique, CliqueApi};
pub use engine::ConsensusEngine;
pub use error::ConsensusError;
pub use ethash::{DatasetCache, Ethash, EthashApi, EthashConfig, PowMode};
pub use signature::{SignFn, SIGNATURE_LENGTH};
