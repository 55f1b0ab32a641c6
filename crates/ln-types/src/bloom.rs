use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::receipt::Log;

/// Size of a log bloom in bytes.
pub const BLOOM_BYTE_LENGTH: usize = 256;

/// Number of bits in a log bloom.
pub const BLOOM_BIT_LENGTH: usize = 8 * BLOOM_BYTE_LENGTH;

/// 2048-bit probabilistic filter over log addresses and topics.
///
/// Each inserted item sets three bits, chosen from the first six bytes of its
/// SHA-256 digest (each byte pair taken modulo 2048).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Bloom(pub [u8; BLOOM_BYTE_LENGTH]);

impl Default for Bloom {
    fn default() -> Self {
        Self([0u8; BLOOM_BYTE_LENGTH])
    }
}

/// The three bit positions (0 = most significant bit of byte 0) that `data`
/// sets in a bloom.
pub fn bloom_bits(data: &[u8]) -> [usize; 3] {
    let digest = Sha256::digest(data);
    let mut out = [0usize; 3];
    for (i, slot) in out.iter_mut().enumerate() {
        let pair = ((digest[2 * i] as usize) << 8) | digest[2 * i + 1] as usize;
        *slot = pair % BLOOM_BIT_LENGTH;
    }
    out
}

impl Bloom {
    pub fn add(&mut self, data: &[u8]) {
        for bit in bloom_bits(data) {
            self.0[bit / 8] |= 0x80 >> (bit % 8);
        }
    }

    /// True if every bit `data` would set is already set.  False positives are
    /// possible, false negatives are not.
    pub fn contains(&self, data: &[u8]) -> bool {
        bloom_bits(data)
            .iter()
            .all(|bit| self.0[bit / 8] & (0x80 >> (bit % 8)) != 0)
    }

    /// Whether the bit at `index` is set.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn accrue(&mut self, other: &Bloom) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a |= *b;
        }
    }

    pub fn from_logs(logs: &[Log]) -> Self {
        let mut bloom = Bloom::default();
        for log in logs {
            bloom.add(log.address.as_bytes());
            for topic in &log.topics {
                bloom.add(topic.as_bytes());
            }
        }
        bloom
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Bloom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bloom(0x{})", hex::encode(self.0))
    }
}

impl Serialize for Bloom {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct BloomVisitor;

impl<'de> Visitor<'de> for BloomVisitor {
    type Value = Bloom;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BLOOM_BYTE_LENGTH} bloom bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Bloom, E> {
        if v.len() != BLOOM_BYTE_LENGTH {
            return Err(E::invalid_length(v.len(), &self));
        }
        let mut out = [0u8; BLOOM_BYTE_LENGTH];
        out.copy_from_slice(v);
        Ok(Bloom(out))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Bloom, E> {
        self.visit_bytes(&v)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Bloom, A::Error> {
        let mut out = [0u8; BLOOM_BYTE_LENGTH];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(Bloom(out))
    }
}

impl<'de> Deserialize<'de> for Bloom {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(BloomVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, Hash};

    #[test]
    fn added_items_are_contained() {
        let mut bloom = Bloom::default();
        bloom.add(b"transfer");
        assert!(bloom.contains(b"transfer"));
        assert!(!bloom.is_empty());
    }

    #[test]
    fn from_logs_covers_address_and_topics() {
        let log = Log {
            address: Address([5u8; 20]),
            topics: vec![Hash::digest(b"topic")],
            ..Log::default()
        };
        let bloom = Bloom::from_logs(&[log.clone()]);
        assert!(bloom.contains(log.address.as_bytes()));
        assert!(bloom.contains(log.topics[0].as_bytes()));
    }

    #[test]
    fn survives_bincode() {
        let mut bloom = Bloom::default();
        bloom.add(b"x");
        let bytes = bincode::serialize(&bloom).unwrap();
        let back: Bloom = bincode::deserialize(&bytes).unwrap();
        assert_eq!(bloom, back);
    }
}
