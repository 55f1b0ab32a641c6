use std::sync::Arc;

use ln_types::{Address, Block, Header, Receipt, RpcApi, Transaction, U256};
use tokio_util::sync::CancellationToken;

use crate::ethash::calc_difficulty;
use crate::{ChainReader, Clique, ConsensusError, Ethash, SignFn, StateWriter};

/// The consensus engine a node runs, fixed at construction.
#[derive(Debug, Clone)]
pub enum ConsensusEngine {
    Ethash(Ethash),
    Clique(Clique),
}

impl ConsensusEngine {
    pub fn name(&self) -> &'static str {
        match self {
            ConsensusEngine::Ethash(_) => "ethash",
            ConsensusEngine::Clique(_) => "clique",
        }
    }

    pub fn is_clique(&self) -> bool {
        matches!(self, ConsensusEngine::Clique(_))
    }

    pub fn as_ethash(&self) -> Option<&Ethash> {
        match self {
            ConsensusEngine::Ethash(ethash) => Some(ethash),
            ConsensusEngine::Clique(_) => None,
        }
    }

    pub fn as_clique(&self) -> Option<&Clique> {
        match self {
            ConsensusEngine::Clique(clique) => Some(clique),
            ConsensusEngine::Ethash(_) => None,
        }
    }

    /// Address credited with (PoW) or that signed (PoA) the header.
    pub fn author(&self, header: &Header) -> Result<Address, ConsensusError> {
        match self {
            ConsensusEngine::Ethash(ethash) => Ok(ethash.author(header)),
            ConsensusEngine::Clique(clique) => clique.author(header),
        }
    }

    pub fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        seal: bool,
    ) -> Result<(), ConsensusError> {
        match self {
            ConsensusEngine::Ethash(ethash) => ethash.verify_header(chain, header, seal),
            ConsensusEngine::Clique(clique) => clique.verify_header(chain, header, seal),
        }
    }

    pub fn verify_seal(&self, chain: &dyn ChainReader, header: &Header) -> Result<(), ConsensusError> {
        match self {
            ConsensusEngine::Ethash(ethash) => ethash.verify_seal(header),
            ConsensusEngine::Clique(clique) => clique.verify_seal(chain, header),
        }
    }

    /// Fill the consensus fields of a header about to be assembled.
    pub fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> Result<(), ConsensusError> {
        match self {
            ConsensusEngine::Ethash(ethash) => ethash.prepare(chain, header),
            ConsensusEngine::Clique(clique) => clique.prepare(chain, header),
        }
    }

    /// Apply end-of-block state changes and assemble the final block.
    pub fn finalize(
        &self,
        chain: &dyn ChainReader,
        header: Header,
        state: &mut dyn StateWriter,
        transactions: Vec<Transaction>,
        receipts: &[Receipt],
    ) -> Block {
        match self {
            ConsensusEngine::Ethash(ethash) => {
                ethash.finalize(chain, header, state, transactions, receipts)
            }
            ConsensusEngine::Clique(clique) => clique.finalize(header, state, transactions, receipts),
        }
    }

    /// Produce a sealed copy of `block`, or `Ok(None)` if `stop` fired first.
    pub async fn seal(
        &self,
        chain: &dyn ChainReader,
        block: &Block,
        stop: CancellationToken,
    ) -> Result<Option<Block>, ConsensusError> {
        match self {
            ConsensusEngine::Ethash(ethash) => ethash.seal(block, stop).await,
            ConsensusEngine::Clique(clique) => clique.seal(chain, block, stop).await,
        }
    }

    pub fn calc_difficulty(
        &self,
        chain: &dyn ChainReader,
        time: u64,
        parent: &Header,
    ) -> Result<U256, ConsensusError> {
        match self {
            ConsensusEngine::Ethash(_) => Ok(calc_difficulty(&chain.config(), time, parent)),
            ConsensusEngine::Clique(clique) => {
                let signers = clique.signers(chain, parent)?;
                Ok(clique.calc_difficulty(&signers, parent.number + 1))
            }
        }
    }

    /// Bind a signing key for sealing.  Proof-of-work needs no signer, so
    /// this does nothing for [`Ethash`].
    pub fn authorize(&self, signer: Address, sign_fn: SignFn) {
        if let ConsensusEngine::Clique(clique) = self {
            clique.authorize(signer, sign_fn);
        }
    }

    pub fn apis(&self, chain: Arc<dyn ChainReader>) -> Vec<RpcApi> {
        match self {
            ConsensusEngine::Ethash(ethash) => ethash.apis(),
            ConsensusEngine::Clique(clique) => clique.apis(chain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ln_types::{CliqueConfig, Hash};

    #[test]
    fn authorize_is_noop_for_proof_of_work() {
        let engine = ConsensusEngine::Ethash(Ethash::new_fake());
        let sign_fn: SignFn = Arc::new(|_: &Address, _: &Hash| Ok(vec![0u8; 96]));
        engine.authorize(Address([1u8; 20]), sign_fn);
        assert!(!engine.is_clique());
        assert_eq!(engine.name(), "ethash");
    }

    #[test]
    fn authorize_binds_clique_signer() {
        let engine = ConsensusEngine::Clique(Clique::new(CliqueConfig::default()));
        let sign_fn: SignFn = Arc::new(|_: &Address, _: &Hash| Ok(vec![0u8; 96]));
        engine.authorize(Address([1u8; 20]), sign_fn);
        assert_eq!(
            engine.as_clique().and_then(Clique::signer),
            Some(Address([1u8; 20]))
        );
    }
}
