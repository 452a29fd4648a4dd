/// Equihash solution verification with bounded parallelism.
///
/// Verification is CPU heavy; a semaphore caps how many run at once across
/// all connections, and each check runs on the blocking pool.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Serialized block header length without the solution.
pub const HEADER_LENGTH: usize = 140;
/// Header bytes hashed as the Equihash input; the remaining 32 are the nonce.
const INPUT_LENGTH: usize = 108;

/// Checks a proof-of-work solution against a serialized header.
#[async_trait]
pub trait SolutionVerifier: Send + Sync {
    /// `solution` excludes its CompactSize length prefix.
    async fn verify(&self, header: Vec<u8>, solution: Vec<u8>) -> bool;
}

#[derive(Clone)]
pub struct EquihashVerifier {
    n: u32,
    k: u32,
    permits: Arc<Semaphore>,
}

impl EquihashVerifier {
    pub fn new(n: u32, k: u32, max_concurrency: usize) -> Self {
        Self {
            n,
            k,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Zcash parameters: n=200, k=9.
    pub fn zcash(max_concurrency: usize) -> Self {
        Self::new(200, 9, max_concurrency)
    }

    /// Expected solution length in bytes, excluding the CompactSize prefix.
    pub fn solution_size(&self) -> usize {
        (1usize << self.k) * (self.n as usize / (self.k as usize + 1) + 1) / 8
    }

    pub fn verify_blocking(n: u32, k: u32, header: &[u8], solution: &[u8]) -> bool {
        if header.len() != HEADER_LENGTH {
            return false;
        }
        let (input, nonce) = header.split_at(INPUT_LENGTH);
        equihash::is_valid_solution(n, k, input, nonce, solution).is_ok()
    }
}

#[async_trait]
impl SolutionVerifier for EquihashVerifier {
    async fn verify(&self, header: Vec<u8>, solution: Vec<u8>) -> bool {
        if solution.len() != self.solution_size() {
            return false;
        }
        let Ok(_permit) = self.permits.acquire().await else {
            return false;
        };
        let (n, k) = (self.n, self.k);
        tokio::task::spawn_blocking(move || Self::verify_blocking(n, k, &header, &solution))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solution_size() {
        assert_eq!(EquihashVerifier::zcash(1).solution_size(), 1344);
        assert_eq!(EquihashVerifier::new(144, 5, 1).solution_size(), 100);
    }

    #[tokio::test]
    async fn test_rejects_garbage_solution() {
        let verifier = EquihashVerifier::zcash(2);
        let header = vec![7u8; HEADER_LENGTH];
        let solution = vec![0u8; 1344];
        assert!(!verifier.verify(header, solution).await);
    }

    #[tokio::test]
    async fn test_rejects_wrong_lengths() {
        let verifier = EquihashVerifier::zcash(1);
        assert!(!verifier.verify(vec![0u8; 80], vec![0u8; 1344]).await);
        assert!(!verifier.verify(vec![0u8; HEADER_LENGTH], vec![0u8; 100]).await);
    }
}
