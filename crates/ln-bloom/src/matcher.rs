use std::sync::Arc;

use ln_types::bloom::bloom_bits;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::BloomError;

/// Log filter compiled to bloom bit positions.
///
/// `filters` is a conjunction of groups; each group is a disjunction of
/// byte strings (an address list, or the alternatives for one topic
/// position).  An empty group matches everything.
#[derive(Debug, Clone)]
pub struct Matcher {
    section_size: u64,
    groups: Vec<Vec<[usize; 3]>>,
}

impl Matcher {
    /// `section_size` must equal the size of the indexed sections the
    /// matcher will be served from.
    pub fn new(section_size: u64, filters: &[Vec<Vec<u8>>]) -> Result<Self, BloomError> {
        if section_size == 0 || section_size % 8 != 0 {
            return Err(BloomError::InvalidSectionSize(section_size));
        }
        let groups = filters
            .iter()
            .filter(|group| !group.is_empty())
            .map(|group| group.iter().map(|item| bloom_bits(item)).collect())
            .collect();
        Ok(Self {
            section_size,
            groups,
        })
    }

    pub fn section_size(&self) -> u64 {
        self.section_size
    }

    /// Bloom bits whose vectors are needed to evaluate a section.
    pub fn bits(&self) -> Vec<usize> {
        let mut bits: Vec<usize> = self.groups.iter().flatten().flatten().copied().collect();
        bits.sort_unstable();
        bits.dedup();
        bits
    }

    /// Evaluate one section.  `vector(bit)` returns the section's bit vector
    /// for a bloom bit.  The result has a bit set for every candidate block.
    pub fn match_section(&self, vector: impl Fn(usize) -> Vec<u8>) -> Vec<u8> {
        let len = (self.section_size / 8) as usize;
        let mut result = vec![0xffu8; len];
        for group in &self.groups {
            let mut any = vec![0u8; len];
            for bits in group {
                let mut all = vec![0xffu8; len];
                for bit in bits {
                    let v = vector(*bit);
                    for (a, b) in all.iter_mut().zip(v.iter().chain(std::iter::repeat(&0))) {
                        *a &= *b;
                    }
                }
                for (a, b) in any.iter_mut().zip(all.iter()) {
                    *a |= *b;
                }
            }
            for (r, a) in result.iter_mut().zip(any.iter()) {
                *r &= *a;
            }
        }
        result
    }

    /// Start a search over blocks `begin..=end`.  Candidate block numbers
    /// arrive on the returned receiver, which closes once the session has
    /// been served.
    pub fn start(self: &Arc<Self>, begin: u64, end: u64) -> (MatcherSession, mpsc::UnboundedReceiver<u64>) {
        let (results, rx) = mpsc::unbounded_channel();
        let session = MatcherSession {
            matcher: self.clone(),
            begin,
            end,
            results,
            cancel: CancellationToken::new(),
        };
        (session, rx)
    }
}

/// One queued filter search.
///
/// Holds everything a worker needs to serve it, so any worker may pick it
/// up.
#[derive(Debug)]
pub struct MatcherSession {
    pub(crate) matcher: Arc<Matcher>,
    pub(crate) begin: u64,
    pub(crate) end: u64,
    pub(crate) results: mpsc::UnboundedSender<u64>,
    pub(crate) cancel: CancellationToken,
}

impl MatcherSession {
    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Token the owner can use to abandon the search.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_are_anded_and_alternatives_ored() {
        let matcher = Matcher::new(8, &[vec![b"a".to_vec(), b"b".to_vec()], vec![b"t".to_vec()]]).unwrap();
        let a = bloom_bits(b"a");
        let t = bloom_bits(b"t");
        // Block 0 has `a` and `t`, block 1 has only `a`.
        let result = matcher.match_section(|bit| {
            let mut v = 0u8;
            if a.contains(&bit) {
                v |= 0b1100_0000;
            }
            if t.contains(&bit) {
                v |= 0b1000_0000;
            }
            vec![v]
        });
        assert_eq!(result[0] & 0b1100_0000, 0b1000_0000);
    }

    #[test]
    fn empty_groups_are_wildcards() {
        let matcher = Matcher::new(8, &[vec![], vec![]]).unwrap();
        assert!(matcher.bits().is_empty());
        assert_eq!(matcher.match_section(|_| vec![0]), vec![0xff]);
    }

    #[test]
    fn section_size_must_be_a_positive_multiple_of_eight() {
        for size in [0, 7, 12] {
            assert!(matches!(
                Matcher::new(size, &[]),
                Err(BloomError::InvalidSectionSize(s)) if s == size
            ));
        }
        assert!(Matcher::new(16, &[]).is_ok());
    }
}
