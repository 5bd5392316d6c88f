//! Growable, bounded write buffer.

use crate::codec::varint::{self, MAX_VARINT64_LEN};
use crate::error::{Result, TraceError};

/// Default initial capacity of a [`ByteBuffer`] (1 KiB).
pub const DEFAULT_INITIAL_CAPACITY: usize = 1024;

/// Default hard limit of a [`ByteBuffer`] (64 MiB).
pub const DEFAULT_BUFFER_LIMIT: usize = 64 * 1024 * 1024;

/// Write buffer used to assemble block payloads.
///
/// Capacity doubles whenever a write would overflow it, up to a hard limit.
/// A write that cannot fit under the limit fails with
/// [`TraceError::BufferOverflow`] and leaves the buffer unchanged.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
    capacity: usize,
    limit: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    /// Creates a buffer with the default capacity and limit.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_INITIAL_CAPACITY, DEFAULT_BUFFER_LIMIT)
    }

    /// Creates a buffer with a custom initial capacity and hard limit.
    pub fn with_limits(initial: usize, limit: usize) -> Self {
        let capacity = initial.clamp(1, limit.max(1));
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            limit,
        }
    }

    /// Returns the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current logical capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hard limit this buffer may grow to.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Discards the contents, keeping the capacity.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    fn reserve(&mut self, additional: usize) -> Result<()> {
        let required = self.data.len() + additional;
        if required > self.limit {
            return Err(TraceError::BufferOverflow {
                requested: required,
                limit: self.limit,
            });
        }
        if required > self.capacity {
            let mut capacity = self.capacity;
            while capacity < required {
                capacity = capacity.saturating_mul(2).min(self.limit);
            }
            self.data.reserve_exact(capacity - self.data.len());
            self.capacity = capacity;
        }
        Ok(())
    }

    /// Appends raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Appends a single byte.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    /// Appends an unsigned 64-bit varint.
    pub fn write_varint_u64(&mut self, value: u64) -> Result<()> {
        let mut tmp = [0u8; MAX_VARINT64_LEN];
        let n = varint::encode_u64(value, &mut tmp);
        self.write_bytes(&tmp[..n])
    }

    /// Appends an unsigned 32-bit varint.
    pub fn write_varint_u32(&mut self, value: u32) -> Result<()> {
        self.write_varint_u64(u64::from(value))
    }

    /// Appends a zig-zag encoded signed 64-bit varint.
    pub fn write_varint_i64(&mut self, value: i64) -> Result<()> {
        self.write_varint_u64(varint::zigzag_encode_i64(value))
    }

    /// Appends a zig-zag encoded signed 32-bit varint.
    pub fn write_varint_i32(&mut self, value: i32) -> Result<()> {
        self.write_varint_u32(varint::zigzag_encode_i32(value))
    }

    /// Appends a little-endian IEEE-754 double.
    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Appends a length-prefixed byte string.
    pub fn write_len_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_varint_u64(bytes.len() as u64)?;
        self.write_bytes(bytes)
    }

    /// Appends a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        self.write_len_bytes(value.as_bytes())
    }
}
