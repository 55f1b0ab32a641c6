use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::TypesError;

pub use primitive_types::U256;

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn zero() -> Self {
                Self([0u8; $len])
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; $len]
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            /// Build from a slice of exactly `LEN` bytes.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, TypesError> {
                if bytes.len() != $len {
                    return Err(TypesError::InvalidLength {
                        expected: $len,
                        got: bytes.len(),
                    });
                }
                let mut out = [0u8; $len];
                out.copy_from_slice(bytes);
                Ok(Self(out))
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = TypesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let stripped = s.strip_prefix("0x").unwrap_or(s);
                let bytes =
                    hex::decode(stripped).map_err(|e| TypesError::InvalidHex(e.to_string()))?;
                Self::from_slice(&bytes)
            }
        }
    };
}

fixed_bytes!(
    /// 32-byte SHA-256 digest identifying blocks, transactions and state roots.
    Hash,
    32
);

fixed_bytes!(
    /// 20-byte account identifier.
    Address,
    20
);

impl Hash {
    /// SHA-256 of `data`.
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl Address {
    /// Derive an account address from a public key: the trailing 20 bytes of
    /// its SHA-256 digest.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..32]);
        Self(out)
    }
}

/// Big-endian 32-byte encoding of a `U256`, used when hashing.
pub fn u256_bytes(value: &U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_parses_with_and_without_prefix() {
        let h = Hash::digest(b"ledger");
        let with_prefix: Hash = h.to_hex().parse().unwrap();
        let without: Hash = h.to_hex()[2..].parse().unwrap();
        assert_eq!(with_prefix, h);
        assert_eq!(without, h);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let err = "0x0102".parse::<Address>().unwrap_err();
        assert_eq!(err, TypesError::InvalidLength { expected: 20, got: 2 });
    }

    #[test]
    fn address_from_public_key_is_stable() {
        let a = Address::from_public_key(&[7u8; 32]);
        let b = Address::from_public_key(&[7u8; 32]);
        assert_eq!(a, b);
        assert!(!a.is_zero());
    }
}
