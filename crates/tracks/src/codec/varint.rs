//! Base-128 varint and zig-zag primitives.
//!
//! Unsigned values are written least-significant group first, seven bits per
//! byte, with the high bit (`0x80`) set on every byte except the last.
//! Signed values are zig-zag mapped first so that small negative numbers stay
//! short:
//!
//! ```text
//!  0 -> 0, -1 -> 1, 1 -> 2, -2 -> 3, ...
//! ```

use crate::error::{Result, TraceError};

/// Continuation bit of a varint byte.
pub const CONTINUATION: u8 = 0x80;

/// Maximum encoded length of a 32-bit varint.
pub const MAX_VARINT32_LEN: usize = 5;

/// Maximum encoded length of a 64-bit varint.
pub const MAX_VARINT64_LEN: usize = 10;

/// Maps a signed 32-bit integer onto an unsigned one.
pub fn zigzag_encode_i32(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

/// Inverse of [`zigzag_encode_i32`].
pub fn zigzag_decode_i32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// Maps a signed 64-bit integer onto an unsigned one.
pub fn zigzag_encode_i64(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// Inverse of [`zigzag_encode_i64`].
pub fn zigzag_decode_i64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Encodes `value` into `out`, returning the number of bytes used.
pub fn encode_u64(mut value: u64, out: &mut [u8; MAX_VARINT64_LEN]) -> usize {
    let mut i = 0;
    while value >= u64::from(CONTINUATION) {
        out[i] = (value as u8) | CONTINUATION;
        value >>= 7;
        i += 1;
    }
    out[i] = value as u8;
    i + 1
}

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Incremental varint decoder shared by slice and stream readers.
///
/// Feed bytes with [`VarintDecoder::push`] until it yields a value.
#[derive(Debug)]
pub(crate) struct VarintDecoder {
    result: u64,
    shift: u32,
    count: usize,
    max_len: usize,
    bits: u32,
}

impl VarintDecoder {
    pub(crate) fn new(bits: u32) -> Self {
        let max_len = if bits <= 32 {
            MAX_VARINT32_LEN
        } else {
            MAX_VARINT64_LEN
        };
        Self {
            result: 0,
            shift: 0,
            count: 0,
            max_len,
            bits,
        }
    }

    /// Consumes one byte. Returns the value once the terminating byte is seen.
    pub(crate) fn push(&mut self, byte: u8) -> Result<Option<u64>> {
        self.count += 1;
        let group = u64::from(byte & !CONTINUATION);
        if self.count == self.max_len {
            // The last permitted byte may only carry the remaining high bits.
            let remaining = self.bits - self.shift;
            if byte & CONTINUATION != 0 || (remaining < 7 && group >> remaining != 0) {
                return Err(TraceError::CorruptData(format!(
                    "varint exceeds {} bytes for a {}-bit value",
                    self.max_len, self.bits
                )));
            }
        }
        self.result |= group << self.shift;
        if byte & CONTINUATION == 0 {
            return Ok(Some(self.result));
        }
        self.shift += 7;
        Ok(None)
    }
}

/// Decodes an unsigned 64-bit varint from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut decoder = VarintDecoder::new(64);
    for (i, &b) in bytes.iter().enumerate() {
        if let Some(value) = decoder.push(b)? {
            return Ok((value, i + 1));
        }
    }
    Err(TraceError::Truncated("varint".to_string()))
}
