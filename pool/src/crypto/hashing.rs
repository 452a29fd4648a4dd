use scrypt::{scrypt, Params as ScryptParams};
use sha2::{Digest, Sha256};

/// A coin-specific one-way function. `extra` carries per-call context some
/// algorithms mix in (e.g. the block time for time-keyed hashes); plain
/// digests ignore it.
pub trait HashAlgorithm: Send + Sync {
    fn digest(&self, data: &[u8], extra: &[u64]) -> [u8; 32];

    /// Scale from SHA-256d difficulty 1 to this algorithm's difficulty 1.
    fn share_multiplier(&self) -> f64 {
        1.0
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Double SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256D;

impl HashAlgorithm for Sha256D {
    fn digest(&self, data: &[u8], _extra: &[u64]) -> [u8; 32] {
        sha256d(data)
    }
}

/// Litecoin proof-of-work: scrypt over the header, salted with itself.
#[derive(Debug, Clone)]
pub struct Scrypt {
    params: ScryptParams,
}

impl Scrypt {
    /// N = 2^10
    const LOG_N: u8 = 10;
    const R: u32 = 1;
    const P: u32 = 1;
    /// Litecoin difficulty 1 is 2^16 times easier than Bitcoin's.
    pub const SHARE_MULTIPLIER: f64 = 65_536.0;

    pub fn litecoin() -> anyhow::Result<Self> {
        let params = ScryptParams::new(Self::LOG_N, Self::R, Self::P, 32)
            .map_err(|e| anyhow::anyhow!("Invalid Scrypt parameters: {}", e))?;
        Ok(Self { params })
    }
}

impl HashAlgorithm for Scrypt {
    fn digest(&self, data: &[u8], _extra: &[u64]) -> [u8; 32] {
        let mut output = [0u8; 32];
        match scrypt(data, data, &self.params, &mut output) {
            Ok(()) => output,
            Err(e) => {
                // an all-ones hash never meets a target
                tracing::error!("Scrypt hash failed: {}", e);
                [u8::MAX; 32]
            }
        }
    }

    fn share_multiplier(&self) -> f64 {
        Self::SHARE_MULTIPLIER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_abc() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256d_empty() {
        assert_eq!(
            hex::encode(sha256d(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_scrypt_litecoin_genesis_meets_target() {
        use crate::crypto::target::{hash_value_le, target_from_bits};

        let mut merkle = hex::decode("97ddfbbae6be97fd6cdf3e7ca13232a3afff2353e29badfab7f73011edd4ced9").unwrap();
        merkle.reverse();
        let mut header = Vec::with_capacity(80);
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&[0u8; 32]);
        header.extend_from_slice(&merkle);
        header.extend_from_slice(&1_317_972_665u32.to_le_bytes());
        header.extend_from_slice(&0x1e0f_fff0u32.to_le_bytes());
        header.extend_from_slice(&2_084_524_493u32.to_le_bytes());
        assert_eq!(header.len(), 80);

        let mut block_hash = sha256d(&header);
        block_hash.reverse();
        assert_eq!(
            hex::encode(block_hash),
            "12a765e31ffd4059bada1e25190f6e98c99d9714d334efa41a195a7e7e04bfe2"
        );

        let scrypt = Scrypt::litecoin().unwrap();
        let pow = scrypt.digest(&header, &[]);
        assert!(hash_value_le(&pow) <= target_from_bits(0x1e0f_fff0));
        // the same header misses the target under sha256d
        assert!(hash_value_le(&sha256d(&header)) > target_from_bits(0x1e0f_fff0));
        assert_eq!(scrypt.share_multiplier(), 65_536.0);
        assert_eq!(Sha256D.share_multiplier(), 1.0);
    }
}
