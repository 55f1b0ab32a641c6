use std::sync::Arc;

use ln_consensus::ConsensusEngine;
use ln_types::Address;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::accounts::AccountManager;
use crate::NodeError;

/// The node's mining identity.
///
/// Readers take the shared lock; explicit reconfiguration and the first
/// wallet fallback take the exclusive one.
pub struct EtherbaseResolver {
    etherbase: RwLock<Option<Address>>,
    accounts: Arc<AccountManager>,
}

impl EtherbaseResolver {
    pub fn new(etherbase: Option<Address>, accounts: Arc<AccountManager>) -> Self {
        Self {
            etherbase: RwLock::new(etherbase),
            accounts,
        }
    }

    /// Configured etherbase, else the first account of the first wallet.
    /// The fallback is remembered.
    pub fn etherbase(&self) -> Result<Address, NodeError> {
        if let Some(address) = *self.etherbase.read() {
            return Ok(address);
        }
        let first = self
            .accounts
            .wallets()
            .iter()
            .find_map(|wallet| wallet.accounts().first().copied())
            .ok_or(NodeError::EtherbaseMissing)?;

        let mut slot = self.etherbase.write();
        // A concurrent setter or resolver may have won the race.
        if let Some(address) = *slot {
            return Ok(address);
        }
        *slot = Some(first);
        info!(address = %first, "Etherbase automatically configured");
        Ok(first)
    }

    pub fn set_etherbase(&self, address: Address) {
        *self.etherbase.write() = Some(address);
    }

    /// Bind the signing key for `etherbase` into `engine`.  Proof-of-work
    /// engines need none; authority engines fail with
    /// [`NodeError::SignerMissing`] when no wallet can sign.
    pub fn authorize(&self, engine: &ConsensusEngine, etherbase: Address) -> Result<(), NodeError> {
        if !engine.is_clique() {
            return Ok(());
        }
        let Some(sign_fn) = self.accounts.sign_fn(&etherbase) else {
            warn!(address = %etherbase, "Etherbase account unavailable locally");
            return Err(NodeError::SignerMissing(etherbase));
        };
        engine.authorize(etherbase, sign_fn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Wallet;
    use ed25519_dalek::SigningKey;
    use ln_consensus::{Clique, Ethash};
    use ln_types::CliqueConfig;

    fn keyed(seed: u8) -> (Wallet, Address) {
        let wallet = Wallet::keystore("keystore://test", vec![SigningKey::from_bytes(&[seed; 32])]);
        let address = wallet.accounts()[0];
        (wallet, address)
    }

    #[test]
    fn missing_wallet_is_an_error() {
        let resolver = EtherbaseResolver::new(None, Arc::new(AccountManager::default()));
        assert!(matches!(resolver.etherbase(), Err(NodeError::EtherbaseMissing)));
    }

    #[test]
    fn fallback_is_cached_and_setter_overrides() {
        let (wallet, first) = keyed(1);
        let accounts = Arc::new(AccountManager::new(vec![wallet]));
        let resolver = EtherbaseResolver::new(None, accounts.clone());
        assert_eq!(resolver.etherbase().unwrap(), first);

        let (other, second) = keyed(2);
        accounts.add_wallet(other);
        assert_eq!(resolver.etherbase().unwrap(), first);

        resolver.set_etherbase(second);
        assert_eq!(resolver.etherbase().unwrap(), second);
    }

    #[test]
    fn explicit_etherbase_needs_no_wallet() {
        let address = Address([3u8; 20]);
        let resolver = EtherbaseResolver::new(Some(address), Arc::new(AccountManager::default()));
        assert_eq!(resolver.etherbase().unwrap(), address);
    }

    #[test]
    fn authorize_requires_signer_only_for_clique() {
        let address = Address([4u8; 20]);
        let resolver = EtherbaseResolver::new(Some(address), Arc::new(AccountManager::default()));

        let pow = ConsensusEngine::Ethash(Ethash::new_fake());
        assert!(resolver.authorize(&pow, address).is_ok());

        let poa = ConsensusEngine::Clique(Clique::new(CliqueConfig::default()));
        assert!(matches!(
            resolver.authorize(&poa, address),
            Err(NodeError::SignerMissing(a)) if a == address
        ));
        assert!(poa.as_clique().and_then(Clique::signer).is_none());
    }

    #[test]
    fn authorize_binds_wallet_signer() {
        let (wallet, address) = keyed(6);
        let resolver = EtherbaseResolver::new(None, Arc::new(AccountManager::new(vec![wallet])));
        let poa = ConsensusEngine::Clique(Clique::new(CliqueConfig::default()));
        resolver.authorize(&poa, address).unwrap();
        assert_eq!(poa.as_clique().and_then(Clique::signer), Some(address));
    }
}
