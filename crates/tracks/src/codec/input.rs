//! Forward-only streaming reader.

use crate::codec::varint::{self, VarintDecoder};
use crate::error::{Result, TraceError};
use std::io::{self, BufRead, BufReader, Read};

/// Default read-ahead buffer size (64 KiB).
pub const DEFAULT_READ_BUFFER: usize = 64 * 1024;

/// Buffered byte stream with one-byte lookahead and position tracking.
///
/// The stream only moves forward. [`Input::skip`] and
/// [`Input::fast_forward`] discard bytes without decoding them; going back
/// means opening a fresh `Input` over a new stream.
///
/// [`Input::mark`] records the current position so that a caller decoding a
/// length-prefixed payload can compare [`Input::bytes_since_mark`] against the
/// declared length.
pub struct Input<R> {
    inner: BufReader<R>,
    position: u64,
    mark: u64,
}

impl<R: Read> Input<R> {
    /// Wraps a reader.
    pub fn new(reader: R) -> Self {
        Self::with_capacity(DEFAULT_READ_BUFFER, reader)
    }

    /// Wraps a reader with a custom read-ahead buffer size.
    pub fn with_capacity(capacity: usize, reader: R) -> Self {
        Self {
            inner: BufReader::with_capacity(capacity, reader),
            position: 0,
            mark: 0,
        }
    }

    /// Absolute number of bytes consumed since the stream was opened.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns the next byte without consuming it, or `None` at end of stream.
    pub fn peek(&mut self) -> Result<Option<u8>> {
        let buf = self.inner.fill_buf()?;
        Ok(buf.first().copied())
    }

    /// Returns true if no bytes remain.
    pub fn at_end(&mut self) -> Result<bool> {
        Ok(self.peek()?.is_none())
    }

    /// Records the current position.
    pub fn mark(&mut self) {
        self.mark = self.position;
    }

    /// Bytes consumed since the last [`Input::mark`].
    pub fn bytes_since_mark(&self) -> u64 {
        self.position - self.mark
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        match self.peek()? {
            Some(b) => {
                self.inner.consume(1);
                self.position += 1;
                Ok(b)
            }
            None => Err(TraceError::Truncated(format!(
                "unexpected end of stream at byte {}",
                self.position
            ))),
        }
    }

    /// Fills `buf` completely.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TraceError::Truncated(
                format!("expected {} bytes at byte {}", buf.len(), self.position),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn read_varint(&mut self, bits: u32) -> Result<u64> {
        let mut decoder = VarintDecoder::new(bits);
        loop {
            let byte = self.read_u8()?;
            if let Some(value) = decoder.push(byte)? {
                return Ok(value);
            }
        }
    }

    /// Reads an unsigned 64-bit varint.
    pub fn read_varint_u64(&mut self) -> Result<u64> {
        self.read_varint(64)
    }

    /// Reads an unsigned 32-bit varint.
    pub fn read_varint_u32(&mut self) -> Result<u32> {
        // The decoder rejects anything wider than 32 bits.
        Ok(self.read_varint(32)? as u32)
    }

    /// Reads a zig-zag encoded signed 64-bit varint.
    pub fn read_varint_i64(&mut self) -> Result<i64> {
        Ok(varint::zigzag_decode_i64(self.read_varint_u64()?))
    }

    /// Reads a zig-zag encoded signed 32-bit varint.
    pub fn read_varint_i32(&mut self) -> Result<i32> {
        Ok(varint::zigzag_decode_i32(self.read_varint_u32()?))
    }

    /// Reads a little-endian IEEE-754 double.
    pub fn read_f64(&mut self) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    /// Reads a length-prefixed byte string.
    ///
    /// Memory grows with the bytes actually present, so a corrupt length
    /// surfaces as [`TraceError::Truncated`] rather than a huge allocation.
    pub fn read_len_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_varint_u64()?;
        let mut bytes = Vec::new();
        let read = (&mut self.inner).take(len).read_to_end(&mut bytes)? as u64;
        self.position += read;
        if read < len {
            return Err(TraceError::Truncated(format!(
                "byte string declares {} bytes, stream ended after {}",
                len, read
            )));
        }
        Ok(bytes)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_len_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| TraceError::CorruptData(format!("Invalid UTF-8 in string: {}", e)))
    }

    /// Discards exactly `n` bytes.
    pub fn skip(&mut self, n: u64) -> Result<()> {
        let copied = io::copy(&mut (&mut self.inner).take(n), &mut io::sink())?;
        self.position += copied;
        if copied < n {
            return Err(TraceError::Truncated(format!(
                "skip of {} bytes stopped after {}",
                n, copied
            )));
        }
        Ok(())
    }

    /// Moves forward to the absolute position `target`.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::BackwardSeek`] if `target` is behind the current
    /// position.
    pub fn fast_forward(&mut self, target: u64) -> Result<()> {
        if target < self.position {
            return Err(TraceError::BackwardSeek {
                position: self.position,
                target,
            });
        }
        self.skip(target - self.position)
    }
}
