use ln_types::bloom::BLOOM_BIT_LENGTH;
use ln_types::Bloom;

use crate::BloomError;

/// Rotates a section of block blooms into one bit vector per bloom bit.
///
/// Vector `b` has bit `i` set when block `i` of the section has bloom bit
/// `b` set.
pub struct Generator {
    blooms: Vec<Vec<u8>>,
    section_size: u64,
    next: u64,
}

impl Generator {
    pub fn new(section_size: u64) -> Result<Self, BloomError> {
        if section_size == 0 || section_size % 8 != 0 {
            return Err(BloomError::InvalidSectionSize(section_size));
        }
        Ok(Self {
            blooms: vec![vec![0u8; (section_size / 8) as usize]; BLOOM_BIT_LENGTH],
            section_size,
            next: 0,
        })
    }

    /// Add the bloom of the block at `index` within the section.  Blooms
    /// must be added in order.
    pub fn add_bloom(&mut self, index: u64, bloom: &Bloom) -> Result<(), BloomError> {
        if index != self.next || index >= self.section_size {
            return Err(BloomError::OutOfOrder {
                index,
                expected: self.next,
            });
        }
        let byte = (index / 8) as usize;
        let mask = 0x80u8 >> (index % 8);
        for (bit, vector) in self.blooms.iter_mut().enumerate() {
            if bloom.bit(bit) {
                vector[byte] |= mask;
            }
        }
        self.next += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.next == self.section_size
    }

    pub fn bitset(&self, bit: usize) -> Result<&[u8], BloomError> {
        self.blooms
            .get(bit)
            .map(Vec::as_slice)
            .ok_or(BloomError::BitOutOfRange(bit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ln_types::bloom::bloom_bits;

    #[test]
    fn rotated_vectors_mark_matching_blocks() {
        let mut generator = Generator::new(16).unwrap();
        for i in 0..16u64 {
            let mut bloom = Bloom::default();
            if i == 3 || i == 9 {
                bloom.add(b"needle");
            }
            generator.add_bloom(i, &bloom).unwrap();
        }
        assert!(generator.is_complete());
        let bit = bloom_bits(b"needle")[0];
        let vector = generator.bitset(bit).unwrap();
        assert_eq!(vector, &[0b0001_0000, 0b0100_0000]);
    }

    #[test]
    fn rejects_bad_sizes_and_order() {
        assert!(Generator::new(12).is_err());
        let mut generator = Generator::new(8).unwrap();
        assert!(matches!(
            generator.add_bloom(1, &Bloom::default()),
            Err(BloomError::OutOfOrder { .. })
        ));
    }
}
