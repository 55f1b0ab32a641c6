//! Seal signatures.
//!
//! Signatures are 96 bytes: the 32-byte ed25519 public key followed by the
//! 64-byte signature, so verifiers can recover the signing address.

use std::sync::Arc;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use ln_types::{Address, Hash};

use crate::ConsensusError;

pub const PUBLIC_KEY_LENGTH: usize = 32;

pub const SIGNATURE_LENGTH: usize = 96;

/// Signs a digest on behalf of an account.
pub type SignFn = Arc<dyn Fn(&Address, &Hash) -> Result<Vec<u8>, String> + Send + Sync>;

/// Verify `signature` over `hash` and return the address of the signer.
pub fn recover(hash: &Hash, signature: &[u8]) -> Result<Address, ConsensusError> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(ConsensusError::InvalidSignature);
    }
    let (key_bytes, sig_bytes) = signature.split_at(PUBLIC_KEY_LENGTH);
    let key_array: [u8; PUBLIC_KEY_LENGTH] = key_bytes
        .try_into()
        .map_err(|_| ConsensusError::InvalidSignature)?;
    let key = VerifyingKey::from_bytes(&key_array).map_err(|_| ConsensusError::InvalidSignature)?;
    let sig = Signature::from_slice(sig_bytes).map_err(|_| ConsensusError::InvalidSignature)?;
    key.verify(hash.as_bytes(), &sig)
        .map_err(|_| ConsensusError::InvalidSignature)?;
    Ok(Address::from_public_key(key_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn sign(key: &SigningKey, hash: &Hash) -> Vec<u8> {
        let mut out = key.verifying_key().to_bytes().to_vec();
        out.extend_from_slice(&key.sign(hash.as_bytes()).to_bytes());
        out
    }

    #[test]
    fn recovers_signer_address() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let hash = Hash::digest(b"header");
        let sig = sign(&key, &hash);
        let expected = Address::from_public_key(key.verifying_key().as_bytes());
        assert_eq!(recover(&hash, &sig).unwrap(), expected);
    }

    #[test]
    fn rejects_signature_over_other_digest() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let sig = sign(&key, &Hash::digest(b"a"));
        assert!(recover(&Hash::digest(b"b"), &sig).is_err());
        assert!(recover(&Hash::digest(b"a"), &sig[..64]).is_err());
    }
}
