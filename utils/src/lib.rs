//! Leverage common functionality across TBFT primitives.

pub mod bitmap;
pub use bitmap::BitMap;

/// Converts bytes to a hexadecimal string.
pub fn hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Concatenate two byte slices (commonly used to derive a signing namespace).
pub fn union(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut union = Vec::with_capacity(a.len() + b.len());
    union.extend_from_slice(a);
    union.extend_from_slice(b);
    union
}

/// Compute the smallest number of participants that is strictly greater than two-thirds
/// of `n` (i.e. `floor(2n / 3) + 1`).
///
/// Quorum is computed over participant count, not weighted stake. For `n = 3f + 1` this
/// equals the familiar `2f + 1`. Returns `None` for an empty set.
pub fn quorum(n: u32) -> Option<u32> {
    if n == 0 {
        return None;
    }
    let n = n as u64;
    Some(((2 * n) / 3 + 1) as u32)
}
