/// Merkle branch construction for Stratum jobs.
///
/// Miners receive only the branch ("steps") needed to fold their own
/// coinbase hash up to the root, so the server never re-hashes the full
/// transaction list per share.

use super::hashing::sha256d;

fn join(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d(&buf)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleTree {
    steps: Vec<[u8; 32]>,
}

impl MerkleTree {
    /// Build the branch for a tree whose first leaf (the coinbase) is not yet
    /// known. `hashes` are the remaining leaves in internal byte order.
    pub fn new(hashes: &[[u8; 32]]) -> Self {
        let mut level: Vec<Option<[u8; 32]>> = std::iter::once(None)
            .chain(hashes.iter().copied().map(Some))
            .collect();
        let mut steps = Vec::new();

        while level.len() > 1 {
            if let Some(step) = level[1] {
                steps.push(step);
            }
            if level.len() % 2 == 1 {
                let last = level[level.len() - 1];
                level.push(last);
            }
            let mut next = Vec::with_capacity(level.len() / 2);
            next.push(None);
            for pair in level[2..].chunks_exact(2) {
                if let (Some(l), Some(r)) = (pair[0], pair[1]) {
                    next.push(Some(join(&l, &r)));
                }
            }
            level = next;
        }

        Self { steps }
    }

    pub fn steps(&self) -> &[[u8; 32]] {
        &self.steps
    }

    /// Branch hashes as hex, the form sent in `mining.notify`.
    pub fn steps_hex(&self) -> Vec<String> {
        self.steps.iter().map(hex::encode).collect()
    }

    /// Fold `first` (the coinbase hash) through the branch to the root.
    pub fn with_first(&self, first: [u8; 32]) -> [u8; 32] {
        self.steps.iter().fold(first, |acc, step| join(&acc, step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Root of the complete leaf list, duplicating the last node on odd levels.
    fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
        if leaves.is_empty() {
            return [0u8; 32];
        }
        let mut level = leaves.to_vec();
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                let last = level[level.len() - 1];
                level.push(last);
            }
            level = level.chunks_exact(2).map(|p| join(&p[0], &p[1])).collect();
        }
        level[0]
    }

    fn leaf(n: u8) -> [u8; 32] {
        sha256d(&[n])
    }

    #[test]
    fn test_no_transactions() {
        let tree = MerkleTree::new(&[]);
        assert!(tree.steps().is_empty());
        let cb = leaf(0);
        assert_eq!(tree.with_first(cb), cb);
        assert_eq!(merkle_root(&[cb]), cb);
    }

    #[test]
    fn test_fold_matches_full_root() {
        for count in [1usize, 2, 3, 4, 5, 7, 8, 13] {
            let txs: Vec<[u8; 32]> = (1..=count as u8).map(leaf).collect();
            let tree = MerkleTree::new(&txs);
            let cb = leaf(0);

            let mut all = vec![cb];
            all.extend_from_slice(&txs);
            assert_eq!(tree.with_first(cb), merkle_root(&all), "tx count {}", count);
        }
    }

    #[test]
    fn test_branch_length_is_logarithmic() {
        let txs: Vec<[u8; 32]> = (1..=9u8).map(leaf).collect();
        // 10 leaves -> depth 4
        assert_eq!(MerkleTree::new(&txs).steps().len(), 4);
    }

    #[test]
    fn test_known_two_leaf_root() {
        // single non-coinbase tx: root = sha256d(cb || tx)
        let cb = leaf(0);
        let tx = leaf(1);
        let tree = MerkleTree::new(&[tx]);
        assert_eq!(tree.steps_hex(), vec![hex::encode(tx)]);
        assert_eq!(tree.with_first(cb), join(&cb, &tx));
    }
}
