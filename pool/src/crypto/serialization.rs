use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::ScriptBuf;

/// Consensus limit for a single script push.
const MAX_PUSH_SIZE: usize = 520;

/// Append a Bitcoin CompactSize integer.
pub fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub fn compact_size(n: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    write_compact_size(&mut out, n);
    out
}

/// Push `data` onto a script builder. Slices longer than the consensus push
/// limit are truncated rather than rejected.
pub fn push_bytes(builder: Builder, data: &[u8]) -> Builder {
    let mut data = data.to_vec();
    data.truncate(MAX_PUSH_SIZE);
    match PushBytesBuf::try_from(data) {
        Ok(buf) => builder.push_slice(buf),
        Err(_) => builder,
    }
}

/// Script consisting of a single minimally-encoded number push, as used for
/// the BIP34 height in coinbase scripts.
pub fn script_number(n: i64) -> ScriptBuf {
    Builder::new().push_int(n).into_script()
}

/// Decode hex and reverse it: daemon display order to internal order and back.
pub fn reverse_hex(hex_str: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let mut bytes = hex::decode(hex_str)?;
    bytes.reverse();
    Ok(bytes)
}

pub fn decode_hex32(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

/// Swap byte order within each 4-byte word. Bitcoin stratum sends the
/// previous block hash in this word-swapped form.
pub fn swap_words(bytes: &[u8]) -> Vec<u8> {
    bytes
        .chunks(4)
        .flat_map(|w| w.iter().rev().copied())
        .collect()
}

/// Parse a hex string of exactly eight characters as a big-endian `u32`.
pub fn parse_hex_u32(s: &str) -> Option<u32> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}
