use std::collections::BTreeMap;

use ln_consensus::StateWriter;
use ln_types::derive::derive_root;
use ln_types::primitives::u256_bytes;
use ln_types::{Address, Hash, U256};
use serde::{Deserialize, Serialize};

use crate::schema::{read_state_blob, write_state_blob};
use crate::{ChainError, Database};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
}

/// Account balances and nonces.
///
/// The root commits to every non-empty account in address order, so equal
/// states always share a root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDb {
    accounts: BTreeMap<Address, Account>,
}

impl StateDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn balance(&self, address: &Address) -> U256 {
        self.accounts
            .get(address)
            .map(|a| a.balance)
            .unwrap_or_default()
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        self.accounts.get(address).map(|a| a.nonce).unwrap_or(0)
    }

    pub fn set_nonce(&mut self, address: &Address, nonce: u64) {
        self.accounts.entry(*address).or_default().nonce = nonce;
    }

    /// Debit `amount`.  Returns `false` and leaves the balance unchanged if
    /// it is insufficient.
    pub fn sub_balance(&mut self, address: &Address, amount: U256) -> bool {
        let account = self.accounts.entry(*address).or_default();
        if account.balance < amount {
            return false;
        }
        account.balance -= amount;
        true
    }

    pub fn root(&self) -> Hash {
        let leaves: Vec<Hash> = self
            .accounts
            .iter()
            .filter(|(_, a)| a.nonce != 0 || !a.balance.is_zero())
            .map(|(address, account)| {
                let mut buf = Vec::with_capacity(20 + 8 + 32);
                buf.extend_from_slice(address.as_bytes());
                buf.extend_from_slice(&account.nonce.to_be_bytes());
                buf.extend_from_slice(&u256_bytes(&account.balance));
                Hash::digest(&buf)
            })
            .collect();
        derive_root(&leaves)
    }
}

impl StateDb {
    /// Persist under the state root and return it.
    pub fn commit(&self, db: &dyn Database) -> Result<Hash, ChainError> {
        let root = self.root();
        write_state_blob(db, &root, &bincode::serialize(self)?)?;
        Ok(root)
    }

    pub fn load(db: &dyn Database, root: &Hash) -> Result<Option<Self>, ChainError> {
        match read_state_blob(db, root)? {
            Some(blob) => Ok(Some(bincode::deserialize(&blob)?)),
            None => Ok(None),
        }
    }
}

impl StateWriter for StateDb {
    fn add_balance(&mut self, address: &Address, amount: U256) {
        let account = self.accounts.entry(*address).or_default();
        account.balance = account.balance.saturating_add(amount);
    }

    fn intermediate_root(&self) -> Hash {
        self.root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_ignores_empty_accounts() {
        let mut a = StateDb::new();
        let b = StateDb::new();
        a.set_nonce(&Address([1u8; 20]), 0);
        assert_eq!(a.root(), b.root());
        a.add_balance(&Address([1u8; 20]), U256::one());
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn committed_state_loads_by_root() {
        let db = crate::MemoryDatabase::new();
        let mut state = StateDb::new();
        state.add_balance(&Address([3u8; 20]), U256::from(9));
        let root = state.commit(&db).unwrap();
        assert_eq!(StateDb::load(&db, &root).unwrap(), Some(state));
        assert!(StateDb::load(&db, &Hash::digest(b"nope")).unwrap().is_none());
    }

    #[test]
    fn overdraft_is_refused() {
        let mut state = StateDb::new();
        let who = Address([2u8; 20]);
        state.add_balance(&who, U256::from(5));
        assert!(!state.sub_balance(&who, U256::from(6)));
        assert!(state.sub_balance(&who, U256::from(5)));
        assert!(state.balance(&who).is_zero());
    }
}
