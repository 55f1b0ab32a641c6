use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::primitives::{u256_bytes, Address, Hash, U256};

/// A value transfer (optionally carrying call data) submitted to the ledger.
///
/// The `from` field is carried explicitly; `signature` holds the sender's
/// signature over [`Transaction::sig_hash`] once the originating wallet has
/// signed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender account sequence number.
    pub nonce: u64,

    /// Price per unit of gas offered by the sender.
    pub gas_price: U256,

    /// Gas allowance.
    pub gas: u64,

    /// Recipient; `None` for contract creation.
    pub to: Option<Address>,

    /// Amount transferred to `to`.
    pub value: U256,

    /// Call data.
    pub data: Vec<u8>,

    /// Sending account.
    pub from: Address,

    /// Signature of `sig_hash()`.  Empty until signed.
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Create a new unsigned transaction.
    pub fn new(
        from: Address,
        nonce: u64,
        to: Option<Address>,
        value: U256,
        gas: u64,
        gas_price: U256,
        data: Vec<u8>,
    ) -> Self {
        Self {
            nonce,
            gas_price,
            gas,
            to,
            value,
            data,
            from,
            signature: Vec::new(),
        }
    }

    /// Digest of every field except the signature; this is what gets signed.
    pub fn sig_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.nonce.to_be_bytes());
        hasher.update(u256_bytes(&self.gas_price));
        hasher.update(self.gas.to_be_bytes());
        match &self.to {
            Some(to) => {
                hasher.update([1u8]);
                hasher.update(to.0);
            }
            None => hasher.update([0u8]),
        }
        hasher.update(u256_bytes(&self.value));
        hasher.update((self.data.len() as u64).to_be_bytes());
        hasher.update(&self.data);
        hasher.update(self.from.0);
        Hash(hasher.finalize().into())
    }

    /// Transaction identity: the signing digest extended with the signature.
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.sig_hash().0);
        hasher.update(&self.signature);
        Hash(hasher.finalize().into())
    }

    /// Maximum amount this transaction can debit from the sender.
    pub fn cost(&self) -> U256 {
        self.gas_price
            .saturating_mul(U256::from(self.gas))
            .saturating_add(self.value)
    }

    /// Attach a pre-computed signature.
    pub fn sign(&mut self, signature: Vec<u8>) {
        self.signature = signature;
    }

    /// True when a signature has been attached.
    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(nonce: u64, data: &[u8]) -> Transaction {
        Transaction::new(
            Address([1u8; 20]),
            nonce,
            Some(Address([2u8; 20])),
            U256::from(10u64),
            21_000,
            U256::from(1u64),
            data.to_vec(),
        )
    }

    #[test]
    fn hash_is_deterministic_for_same_data() {
        let tx = make(0, b"hello");
        assert_eq!(tx.hash(), tx.hash());
    }

    #[test]
    fn different_payloads_produce_different_hashes() {
        assert_ne!(make(0, b"a").hash(), make(0, b"b").hash());
        assert_ne!(make(0, b"a").hash(), make(1, b"a").hash());
    }

    #[test]
    fn signature_changes_hash_but_not_sig_hash() {
        let unsigned = make(3, b"");
        let mut signed = unsigned.clone();
        signed.sign(vec![9u8; 64]);
        assert!(signed.is_signed());
        assert_eq!(unsigned.sig_hash(), signed.sig_hash());
        assert_ne!(unsigned.hash(), signed.hash());
    }

    #[test]
    fn cost_includes_gas_and_value() {
        let tx = make(0, b"");
        assert_eq!(tx.cost(), U256::from(21_010u64));
    }
}
