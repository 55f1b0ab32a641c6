use std::collections::HashMap;
use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use ln_consensus::SignFn;
use ln_types::{Address, Hash};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use tracing::debug;

/// A set of accounts behind one backend.  Keys are optional: a watch-only
/// wallet lists accounts it cannot sign for.
pub struct Wallet {
    url: String,
    accounts: Vec<Address>,
    keys: HashMap<Address, SigningKey>,
}

impl Wallet {
    /// In-memory keystore wallet holding `keys`.
    pub fn keystore(url: impl Into<String>, keys: Vec<SigningKey>) -> Self {
        let mut accounts = Vec::with_capacity(keys.len());
        let mut map = HashMap::new();
        for key in keys {
            let address = Address::from_public_key(key.verifying_key().as_bytes());
            accounts.push(address);
            map.insert(address, key);
        }
        Self {
            url: url.into(),
            accounts,
            keys: map,
        }
    }

    /// Keystore wallet with one freshly generated key.
    pub fn generate(url: impl Into<String>) -> Self {
        Self::keystore(url, vec![SigningKey::generate(&mut OsRng)])
    }

    pub fn watch_only(url: impl Into<String>, accounts: Vec<Address>) -> Self {
        Self {
            url: url.into(),
            accounts,
            keys: HashMap::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn accounts(&self) -> &[Address] {
        &self.accounts
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.accounts.contains(address)
    }

    pub fn can_sign(&self, address: &Address) -> bool {
        self.keys.contains_key(address)
    }

    /// Seal signature over `hash`: public key followed by the signature.
    pub fn sign_hash(&self, address: &Address, hash: &Hash) -> Result<Vec<u8>, String> {
        let key = self
            .keys
            .get(address)
            .ok_or_else(|| format!("no key for account {address}"))?;
        let mut out = key.verifying_key().to_bytes().to_vec();
        out.extend_from_slice(&key.sign(hash.as_bytes()).to_bytes());
        Ok(out)
    }
}

/// Registry of wallets the node may mine and sign with.
#[derive(Default)]
pub struct AccountManager {
    wallets: RwLock<Vec<Arc<Wallet>>>,
}

impl AccountManager {
    pub fn new(wallets: Vec<Wallet>) -> Self {
        Self {
            wallets: RwLock::new(wallets.into_iter().map(Arc::new).collect()),
        }
    }

    pub fn add_wallet(&self, wallet: Wallet) {
        debug!(url = wallet.url(), accounts = wallet.accounts().len(), "Wallet attached");
        self.wallets.write().push(Arc::new(wallet));
    }

    pub fn wallets(&self) -> Vec<Arc<Wallet>> {
        self.wallets.read().clone()
    }

    /// All accounts across wallets, in wallet order.
    pub fn accounts(&self) -> Vec<Address> {
        self.wallets
            .read()
            .iter()
            .flat_map(|w| w.accounts().iter().copied())
            .collect()
    }

    /// Wallet able to sign for `address`.
    pub fn find(&self, address: &Address) -> Option<Arc<Wallet>> {
        self.wallets
            .read()
            .iter()
            .find(|w| w.contains(address) && w.can_sign(address))
            .cloned()
    }

    /// Signing capability for `address`, suitable for binding into an
    /// authority engine.
    pub fn sign_fn(&self, address: &Address) -> Option<SignFn> {
        let wallet = self.find(address)?;
        Some(Arc::new(move |account: &Address, hash: &Hash| wallet.sign_hash(account, hash)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ln_consensus::signature::recover;

    #[test]
    fn signatures_recover_to_the_account() {
        let wallet = Wallet::keystore("keystore://a", vec![SigningKey::from_bytes(&[5u8; 32])]);
        let address = wallet.accounts()[0];
        let manager = AccountManager::new(vec![wallet]);

        let hash = Hash::digest(b"header");
        let sign = manager.sign_fn(&address).unwrap();
        assert_eq!(recover(&hash, &sign(&address, &hash).unwrap()).unwrap(), address);
    }

    #[test]
    fn watch_only_accounts_cannot_sign() {
        let address = Address([8u8; 20]);
        let manager = AccountManager::new(vec![Wallet::watch_only("ledger://x", vec![address])]);
        assert_eq!(manager.accounts(), vec![address]);
        assert!(manager.find(&address).is_none());
        assert!(manager.sign_fn(&address).is_none());
    }
}
