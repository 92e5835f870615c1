//! A fixed-length bitmap used to summarize which participants have contributed
//! to some set (for example, which validators have voted in a round).

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Errors that can occur when parsing a [BitMap].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("bitmap too short: {0} bytes for {1} bits")]
    TooShort(usize, usize),
    #[error("bitmap too long: {0} bytes for {1} bits")]
    TooLong(usize, usize),
    #[error("trailing bits set")]
    TrailingBits,
}

/// Fixed-length bitmap backed by a byte vector (least significant bit first).
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct BitMap {
    bits: Vec<u8>,
    len: usize,
}

impl BitMap {
    /// Create a bitmap of `len` bits, all cleared.
    pub fn zeroes(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Parse a bitmap of `len` bits from its byte representation.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self, Error> {
        let expected = len.div_ceil(8);
        if bytes.len() < expected {
            return Err(Error::TooShort(bytes.len(), len));
        }
        if bytes.len() > expected {
            return Err(Error::TooLong(bytes.len(), len));
        }
        if len % 8 != 0 {
            let mask = !((1u8 << (len % 8)) - 1);
            if bytes[expected - 1] & mask != 0 {
                return Err(Error::TrailingBits);
            }
        }
        Ok(Self {
            bits: bytes.to_vec(),
            len,
        })
    }

    /// Number of bits tracked.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the bitmap tracks no bits.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the bit at `index` (or `None` if out of range).
    pub fn get(&self, index: usize) -> Option<bool> {
        if index >= self.len {
            return None;
        }
        Some(self.bits[index / 8] & (1 << (index % 8)) != 0)
    }

    /// Set the bit at `index`. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index >= self.len {
            return;
        }
        self.bits[index / 8] |= 1 << (index % 8);
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Iterate over the indices of all set bits.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|i| self.get(*i) == Some(true))
    }

    /// Byte representation of the bitmap.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }
}

impl fmt::Debug for BitMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: String = (0..self.len)
            .map(|i| if self.get(i) == Some(true) { '1' } else { '0' })
            .collect();
        write!(f, "BitMap({rendered})")
    }
}
