//! Binary codec: varints, doubles, the write buffer and the streaming reader.
//!
//! Everything that reaches disk goes through these primitives:
//!
//! - [`ByteBuffer`]: bounded growable buffer that block payloads are built in
//! - [`Input`]: forward-only reader with lookahead, mark and skip
//! - [`Item`]: the per-domain encode/decode contract for trace payloads

pub mod buffer;
pub mod input;
pub mod varint;

pub use buffer::ByteBuffer;
pub use input::Input;

use crate::error::Result;
use std::io::Read;

/// A self-describing unit stored in a trace: an event or a state element.
///
/// Items are concatenated inside a block payload without separators, so
/// `decode` must consume exactly the bytes `write` produced.
pub trait Item: Clone + 'static {
    /// Appends the encoded item to `buf`.
    fn write(&self, buf: &mut ByteBuffer) -> Result<()>;

    /// Decodes one item from `input`.
    fn decode<R: Read>(input: &mut Input<R>) -> Result<Self>;
}

impl Item for String {
    fn write(&self, buf: &mut ByteBuffer) -> Result<()> {
        buf.write_str(self)
    }

    fn decode<R: Read>(input: &mut Input<R>) -> Result<Self> {
        input.read_string()
    }
}

impl Item for i64 {
    fn write(&self, buf: &mut ByteBuffer) -> Result<()> {
        buf.write_varint_i64(*self)
    }

    fn decode<R: Read>(input: &mut Input<R>) -> Result<Self> {
        input.read_varint_i64()
    }
}

impl Item for u64 {
    fn write(&self, buf: &mut ByteBuffer) -> Result<()> {
        buf.write_varint_u64(*self)
    }

    fn decode<R: Read>(input: &mut Input<R>) -> Result<Self> {
        input.read_varint_u64()
    }
}

impl Item for i32 {
    fn write(&self, buf: &mut ByteBuffer) -> Result<()> {
        buf.write_varint_i32(*self)
    }

    fn decode<R: Read>(input: &mut Input<R>) -> Result<Self> {
        input.read_varint_i32()
    }
}

impl Item for f64 {
    fn write(&self, buf: &mut ByteBuffer) -> Result<()> {
        buf.write_f64(*self)
    }

    fn decode<R: Read>(input: &mut Input<R>) -> Result<Self> {
        input.read_f64()
    }
}
