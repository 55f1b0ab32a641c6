use sha2::{Digest, Sha256};

use crate::Hash;

/// Root hash committed in headers for transaction and receipt lists.
pub const EMPTY_ROOT: Hash = Hash([0u8; 32]);

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left.0);
    hasher.update(right.0);
    Hash(hasher.finalize().into())
}

/// Binary Merkle root over `leaves`.
///
/// Parent hashes are SHA-256 of `left || right`.  When a level has an odd
/// number of nodes the last one is duplicated.  An empty list yields
/// [`EMPTY_ROOT`].
pub fn derive_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return EMPTY_ROOT;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 != 0 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|chunk| hash_pair(&chunk[0], &chunk[1]))
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_has_empty_root() {
        assert_eq!(derive_root(&[]), EMPTY_ROOT);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = Hash::digest(b"only");
        assert_eq!(derive_root(&[leaf]), leaf);
    }

    #[test]
    fn odd_levels_duplicate_last_leaf() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        let c = Hash::digest(b"c");
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));
        assert_eq!(derive_root(&[a, b, c]), expected);
    }

    #[test]
    fn order_matters() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        assert_ne!(derive_root(&[a, b]), derive_root(&[b, a]));
    }
}
