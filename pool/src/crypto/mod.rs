/// Hashing, Merkle and proof-of-work primitives shared by the coin families
///
/// Everything here is synchronous and allocation-light; the expensive
/// verifiers (Equihash, Ethash) are wrapped by callers in `spawn_blocking`.

pub mod equihash;
pub mod ethash;
pub mod hashing;
pub mod merkle;
pub mod serialization;
pub mod target;

pub use hashing::{sha256d, HashAlgorithm, Scrypt, Sha256D};
pub use merkle::MerkleTree;
