use bitcoin::pow::{CompactTarget, Target};
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};

/// Bitcoin difficulty-1 target.
pub const BITCOIN_DIFF1_HEX: &str = "00ffff0000000000000000000000000000000000000000000000000000";

/// Equihash (200,9) difficulty-1 target.
pub const ZCASH_DIFF1_HEX: &str = "0007ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

pub fn from_hex(hex_str: &str) -> Option<BigUint> {
    let trimmed = hex_str.trim_start_matches("0x");
    if trimmed.is_empty() {
        return None;
    }
    BigUint::parse_bytes(trimmed.as_bytes(), 16)
}

pub fn bitcoin_diff1() -> BigUint {
    BigUint::parse_bytes(BITCOIN_DIFF1_HEX.as_bytes(), 16).unwrap_or_default()
}

pub fn zcash_diff1() -> BigUint {
    BigUint::parse_bytes(ZCASH_DIFF1_HEX.as_bytes(), 16).unwrap_or_default()
}

/// Interpret a 32-byte hash as a little-endian 256-bit integer.
pub fn hash_value_le(hash: &[u8; 32]) -> BigUint {
    BigUint::from_bytes_le(hash)
}

/// `numerator / denominator` as a float, without truncating to an integer.
pub fn ratio(numerator: &BigUint, denominator: &BigUint) -> f64 {
    if denominator.is_zero() {
        return f64::INFINITY;
    }
    let n = numerator.to_f64().unwrap_or(f64::INFINITY);
    let d = denominator.to_f64().unwrap_or(f64::INFINITY);
    n / d
}

/// Expand compact `bits` into the full target.
pub fn target_from_bits(bits: u32) -> BigUint {
    let target = Target::from_compact(CompactTarget::from_consensus(bits));
    BigUint::from_bytes_be(&target.to_be_bytes())
}

/// Render a target as 64 hex characters, big-endian.
pub fn to_hex64(value: &BigUint) -> String {
    let bytes = value.to_bytes_be();
    if bytes.len() >= 32 {
        return hex::encode(&bytes[bytes.len() - 32..]);
    }
    let mut padded = vec![0u8; 32 - bytes.len()];
    padded.extend_from_slice(&bytes);
    hex::encode(padded)
}

/// Target for a stratum difficulty, computed as `diff1 / (diff * 255) * 255`
/// to keep some fractional precision.
pub fn target_from_difficulty(diff1: &BigUint, difficulty: f64) -> BigUint {
    let scaled = (difficulty * 255.0).max(1.0) as u64;
    diff1 / BigUint::from(scaled) * BigUint::from(255u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_expansion_matches_diff1() {
        // 0x1d00ffff is the genesis target, i.e. difficulty 1
        assert_eq!(target_from_bits(0x1d00ffff), bitcoin_diff1());
    }

    #[test]
    fn test_ratio_is_fractional() {
        let d1 = bitcoin_diff1();
        let double = &d1 * BigUint::from(2u32);
        assert!((ratio(&d1, &double) - 0.5).abs() < 1e-12);
        assert!(ratio(&d1, &BigUint::default()).is_infinite());
    }

    #[test]
    fn test_target_hex_round_trip() {
        let d1 = zcash_diff1();
        assert_eq!(to_hex64(&d1), ZCASH_DIFF1_HEX);
        assert_eq!(from_hex(&to_hex64(&d1)), Some(d1));
    }

    #[test]
    fn test_target_from_difficulty_inverse() {
        let d1 = zcash_diff1();
        let t = target_from_difficulty(&d1, 1.0);
        assert!((ratio(&d1, &t) - 1.0).abs() < 1e-9);
        let t = target_from_difficulty(&d1, 32.0);
        assert!((ratio(&d1, &t) - 32.0).abs() < 1e-6);
    }

    #[test]
    fn test_hash_value_le() {
        let mut h = [0u8; 32];
        h[0] = 1;
        assert_eq!(hash_value_le(&h), BigUint::from(1u32));
    }
}
