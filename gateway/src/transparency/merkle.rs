//! Merkle tree construction over request-hash batches (spec.md §4.5).
//!
//! Preserved exactly from `original_source/app/merkle.py` for verifier
//! compatibility (spec.md §9 Open Question): parent hashes are computed
//! over the **lowercase hex string concatenation** of their children, not
//! raw bytes, and an odd-length level duplicates its last element rather
//! than promoting it unpaired.

use sha2::{Digest, Sha256};

/// Builds the Merkle root over `hashes`, in the given order.
///
/// Returns `None` for an empty slice (spec.md §4.5: a batch is never
/// created from zero hashes). A single hash is its own root.
pub fn build_merkle_tree(hashes: &[[u8; 32]]) -> Option<[u8; 32]> {
    match hashes.len() {
        0 => None,
        1 => Some(hashes[0]),
        _ => {
            let mut level: Vec<[u8; 32]> = hashes.to_vec();
            while level.len() > 1 {
                if level.len() % 2 == 1 {
                    level.push(*level.last().unwrap());
                }
                level = level
                    .chunks(2)
                    .map(|pair| hash_pair(&pair[0], &pair[1]))
                    .collect();
            }
            Some(level[0])
        }
    }
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(hex::encode(left).as_bytes());
    hasher.update(hex::encode(right).as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn digit_hash(i: u8) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(i.to_string().as_bytes());
        hasher.finalize().into()
    }

    #[test]
    fn empty_batch_has_no_root() {
        assert_eq!(build_merkle_tree(&[]), None);
    }

    #[test]
    fn single_hash_is_its_own_root() {
        let h = digit_hash(1);
        assert_eq!(build_merkle_tree(&[h]), Some(h));
    }

    #[test]
    fn four_hashes_match_the_worked_example() {
        // spec.md §8 scenario 4.
        let h1 = digit_hash(1);
        let h2 = digit_hash(2);
        let h3 = digit_hash(3);
        let h4 = digit_hash(4);

        let p12 = hash_pair(&h1, &h2);
        let p34 = hash_pair(&h3, &h4);
        let expected = hash_pair(&p12, &p34);

        assert_eq!(build_merkle_tree(&[h1, h2, h3, h4]), Some(expected));
    }

    #[test]
    fn odd_length_batch_duplicates_the_last_hash() {
        // spec.md §8 scenario 5.
        let a = digit_hash(1);
        let b = digit_hash(2);
        let c = digit_hash(3);

        let left = hash_pair(&a, &b);
        let right = hash_pair(&c, &c);
        let expected = hash_pair(&left, &right);

        assert_eq!(build_merkle_tree(&[a, b, c]), Some(expected));
    }

    #[test]
    fn hashes_over_raw_bytes_instead_of_hex_would_differ() {
        // Locks in the hex-concatenation choice (spec.md §9): hashing raw
        // bytes instead would produce a different root.
        let a = digit_hash(1);
        let b = digit_hash(2);
        let hex_root = hash_pair(&a, &b);

        let mut raw_hasher = Sha256::new();
        raw_hasher.update(a);
        raw_hasher.update(b);
        let raw_root: [u8; 32] = raw_hasher.finalize().into();

        assert_ne!(hex_root, raw_root);
    }
}
