//! Block framing for trace files.
//!
//! ## Binary Layout
//!
//! ```text
//! Offset  Size     Field
//! ------  ----     -----
//! 0x00    1        flag (0x00 = DATA, 0x01 = STATE)
//! 0x01    varint   payload length in bytes
//! ..      varint   timestamp (zig-zag)
//! ..      length   payload: concatenated item encodings
//! ```
//!
//! A trace file is nothing but blocks back to back. Block timestamps never
//! decrease; a STATE block may share its timestamp with the DATA block that
//! follows it.

use crate::codec::varint::{self, MAX_VARINT64_LEN};
use crate::codec::{Input, Item};
use crate::error::{Result, TraceError};
use crate::Time;
use std::fmt;
use std::io::{BufWriter, Read, Write};

/// Opens a fresh stream over a trace file, positioned at its first byte.
///
/// Readers call it again whenever they need to move backward.
pub type InputOpener = Box<dyn Fn() -> Result<Box<dyn Read>>>;

/// Kind of block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockFlag {
    /// Events stamped with the block time.
    Data = 0,
    /// Full state snapshot valid just before the block time's events.
    State = 1,
}

impl BlockFlag {
    /// Creates a BlockFlag from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Data),
            1 => Some(Self::State),
            _ => None,
        }
    }
}

impl fmt::Display for BlockFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => f.write_str("DATA"),
            Self::State => f.write_str("STATE"),
        }
    }
}

/// Decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block kind.
    pub flag: BlockFlag,
    /// Payload length in bytes.
    pub length: u64,
    /// Block timestamp as stored.
    pub time: Time,
    /// Byte offset of the header in the trace file.
    pub offset: u64,
}

/// Counting block writer.
pub(crate) struct BlockSink {
    out: BufWriter<Box<dyn Write>>,
    position: u64,
    blocks: u64,
}

impl BlockSink {
    pub(crate) fn new(out: Box<dyn Write>) -> Self {
        Self {
            out: BufWriter::new(out),
            position: 0,
            blocks: 0,
        }
    }

    /// Byte offset the next block header will be written at.
    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn block_count(&self) -> u64 {
        self.blocks
    }

    /// Writes one framed block and returns its header offset.
    pub(crate) fn write_block(&mut self, flag: BlockFlag, time: Time, payload: &[u8]) -> Result<u64> {
        let offset = self.position;
        let mut header = [0u8; 1 + 2 * MAX_VARINT64_LEN];
        header[0] = flag as u8;
        let mut len = 1;
        let mut tmp = [0u8; MAX_VARINT64_LEN];
        let n = varint::encode_u64(payload.len() as u64, &mut tmp);
        header[len..len + n].copy_from_slice(&tmp[..n]);
        len += n;
        let n = varint::encode_u64(varint::zigzag_encode_i64(time), &mut tmp);
        header[len..len + n].copy_from_slice(&tmp[..n]);
        len += n;

        self.out.write_all(&header[..len])?;
        self.out.write_all(payload)?;
        self.position += (len + payload.len()) as u64;
        self.blocks += 1;
        Ok(offset)
    }

    pub(crate) fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

enum Cursor {
    /// Stream (re)opened or moved; the header at the position is not read yet.
    Start,
    /// Header read, payload not consumed.
    At(BlockHeader),
    /// No more blocks.
    Exhausted,
}

/// Block-level reader over a reopenable, forward-only stream.
pub struct BlockStream {
    opener: InputOpener,
    input: Input<Box<dyn Read>>,
    cursor: Cursor,
}

impl BlockStream {
    /// Opens the stream at the first block.
    pub fn open(opener: InputOpener) -> Result<Self> {
        let input = Input::new(opener()?);
        Ok(Self {
            opener,
            input,
            cursor: Cursor::Start,
        })
    }

    /// Reopens the underlying stream at offset 0.
    pub fn rewind(&mut self) -> Result<()> {
        self.input = Input::new((self.opener)()?);
        self.cursor = Cursor::Start;
        Ok(())
    }

    /// Header of the block under the cursor, or `None` once exhausted.
    pub fn current(&mut self) -> Result<Option<BlockHeader>> {
        if let Cursor::Start = self.cursor {
            self.load_header()?;
        }
        Ok(match self.cursor {
            Cursor::At(header) => Some(header),
            _ => None,
        })
    }

    fn load_header(&mut self) -> Result<()> {
        if self.input.at_end()? {
            self.cursor = Cursor::Exhausted;
            return Ok(());
        }
        let offset = self.input.position();
        let raw = self.input.read_u8()?;
        let flag = BlockFlag::from_u8(raw).ok_or(TraceError::InvalidFlag(raw))?;
        let length = self.input.read_varint_u64()?;
        let time = self.input.read_varint_i64()?;
        self.cursor = Cursor::At(BlockHeader {
            flag,
            length,
            time,
            offset,
        });
        Ok(())
    }

    /// Positions the cursor on the block header at `offset`.
    ///
    /// Moving backward reopens the stream.
    pub fn seek_offset(&mut self, offset: u64) -> Result<()> {
        match self.cursor {
            Cursor::At(header) if header.offset == offset => return Ok(()),
            Cursor::Start if self.input.position() == offset => return Ok(()),
            _ => {}
        }
        if offset < self.input.position() {
            self.rewind()?;
        }
        self.input.fast_forward(offset)?;
        self.cursor = Cursor::Start;
        Ok(())
    }

    /// Skips the current block without decoding its payload.
    pub fn skip_block(&mut self) -> Result<()> {
        if let Some(header) = self.current()? {
            self.input.skip(header.length)?;
            self.cursor = Cursor::Start;
        }
        Ok(())
    }

    /// Decodes the current block's payload and moves to the next block.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::CorruptData`] if the items do not consume exactly
    /// the declared payload length.
    pub fn read_payload<T: Item>(&mut self) -> Result<Vec<T>> {
        let Some(header) = self.current()? else {
            return Ok(Vec::new());
        };
        self.input.mark();
        let mut items = Vec::new();
        while self.input.bytes_since_mark() < header.length {
            items.push(T::decode(&mut self.input)?);
        }
        if self.input.bytes_since_mark() != header.length {
            return Err(TraceError::CorruptData(format!(
                "{} block at offset {} declares {} bytes, items used {}",
                header.flag,
                header.offset,
                header.length,
                self.input.bytes_since_mark()
            )));
        }
        self.cursor = Cursor::Start;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SharedBytes;

    fn stream_over(bytes: &SharedBytes) -> BlockStream {
        let bytes = bytes.clone();
        BlockStream::open(Box::new(move || Ok(Box::new(bytes.reader()) as Box<dyn Read>))).unwrap()
    }

    fn payload(items: &[i64]) -> Vec<u8> {
        let mut buf = crate::codec::ByteBuffer::new();
        for item in items {
            item.write(&mut buf).unwrap();
        }
        buf.as_slice().to_vec()
    }

    #[test]
    fn test_write_then_read_blocks() {
        let bytes = SharedBytes::default();
        let mut sink = BlockSink::new(Box::new(bytes.writer()));
        let first = sink.write_block(BlockFlag::State, 10, &payload(&[1, 2])).unwrap();
        let second = sink.write_block(BlockFlag::Data, 10, &payload(&[-3])).unwrap();
        assert_eq!(first, 0);
        assert!(second > first);
        assert_eq!(sink.block_count(), 2);
        sink.finish().unwrap();

        let mut stream = stream_over(&bytes);
        let header = stream.current().unwrap().unwrap();
        assert_eq!(header.flag, BlockFlag::State);
        assert_eq!(header.time, 10);
        assert_eq!(stream.read_payload::<i64>().unwrap(), vec![1, 2]);

        let header = stream.current().unwrap().unwrap();
        assert_eq!(header.offset, second);
        assert_eq!(stream.read_payload::<i64>().unwrap(), vec![-3]);
        assert!(stream.current().unwrap().is_none());
    }

    #[test]
    fn test_seek_backward_reopens() {
        let bytes = SharedBytes::default();
        let mut sink = BlockSink::new(Box::new(bytes.writer()));
        let a = sink.write_block(BlockFlag::Data, 1, &payload(&[1])).unwrap();
        let b = sink.write_block(BlockFlag::Data, 2, &payload(&[2])).unwrap();
        sink.finish().unwrap();

        let mut stream = stream_over(&bytes);
        stream.seek_offset(b).unwrap();
        assert_eq!(stream.read_payload::<i64>().unwrap(), vec![2]);
        stream.seek_offset(a).unwrap();
        assert_eq!(stream.current().unwrap().unwrap().time, 1);
        stream.skip_block().unwrap();
        assert_eq!(stream.current().unwrap().unwrap().time, 2);
    }

    #[test]
    fn test_length_mismatch_is_corrupt() {
        let bytes = SharedBytes::default();
        let mut sink = BlockSink::new(Box::new(bytes.writer()));
        // 300 encodes as two bytes; declare a payload of three.
        let mut body = payload(&[300]);
        body.push(0x80);
        sink.write_block(BlockFlag::Data, 1, &body).unwrap();
        sink.finish().unwrap();

        let mut stream = stream_over(&bytes);
        let err = stream.read_payload::<i64>().unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_corrupt_string_length_is_an_error() {
        let bytes = SharedBytes::default();
        let mut sink = BlockSink::new(Box::new(bytes.writer()));
        let mut body = vec![0xFF; 9];
        body.push(0x01);
        sink.write_block(BlockFlag::Data, 4, &body).unwrap();
        sink.finish().unwrap();

        let mut stream = stream_over(&bytes);
        let err = stream.read_payload::<String>().unwrap_err();
        assert!(err.is_corrupt(), "{err:?}");
    }

    #[test]
    fn test_unknown_flag() {
        let bytes = SharedBytes::from(vec![0x07, 0x00, 0x00]);
        let mut stream = stream_over(&bytes);
        assert!(matches!(stream.current(), Err(TraceError::InvalidFlag(7))));
    }
}
