//! Little-endian base-128 varint codec for key bytes.
//!
//! Each output byte carries 7 payload bits; the high bit marks
//! continuation. Encoded numbers are self-delimiting, which makes the
//! concatenated key layout decodable without length prefixes.

use crate::error::{AggregateError, Result};

/// Longest possible encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

/// Returns the number of bytes `encode` will write for `v`.
pub fn encoded_len(v: u64) -> usize {
    if v == 0 {
        return 1;
    }
    (64 - v.leading_zeros() as usize).div_ceil(7)
}

/// Encodes `v` into the front of `out`, returning the number of bytes
/// written. `out` must have room for `encoded_len(v)` bytes.
pub fn encode(mut v: u64, out: &mut [u8]) -> usize {
    let mut pos = 0;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out[pos] = byte;
            pos += 1;
            return pos;
        }
        out[pos] = byte | 0x80;
        pos += 1;
    }
}

/// Decodes one varint from the front of `buf`, returning the value and
/// the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0u32;

    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        let payload = u64::from(byte & 0x7f);
        if i == MAX_VARINT_LEN - 1 && payload > 1 {
            return Err(AggregateError::Decode {
                offset: i,
                reason: "varint exceeds 64 bits",
            });
        }
        result |= payload << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }

    Err(AggregateError::Decode {
        offset: buf.len().min(MAX_VARINT_LEN),
        reason: if buf.len() >= MAX_VARINT_LEN {
            "varint longer than 10 bytes"
        } else {
            "varint truncated"
        },
    })
}
