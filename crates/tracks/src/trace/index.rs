//! Sparse seek index: timestamp → byte offset of a block header.
//!
//! ## Binary Layout
//!
//! ```text
//! repeated:
//!   timestamp  signed varint (zig-zag)
//!   offset     unsigned varint
//! ```
//!
//! Entries are strictly increasing in time. The writer appends one entry
//! every `index_interval` events, so the index stays small enough to load
//! whole and a seek costs one binary search plus a bounded forward scan.

use crate::codec::varint::{self, MAX_VARINT64_LEN};
use crate::codec::Input;
use crate::error::{Result, TraceError};
use crate::Time;
use std::io::{BufWriter, Read, Write};

/// One seek-index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Timestamp of the indexed block (as stored, without reader offset).
    pub time: Time,
    /// Byte offset of the block header in the trace file.
    pub offset: u64,
}

impl IndexEntry {
    /// Creates an index entry.
    pub fn new(time: Time, offset: u64) -> Self {
        Self { time, offset }
    }
}

/// Appends index entries to an output stream.
pub struct IndexWriter {
    out: BufWriter<Box<dyn Write>>,
    last: Option<Time>,
    count: usize,
}

impl IndexWriter {
    /// Creates an index writer over `out`.
    pub fn new(out: Box<dyn Write>) -> Self {
        Self {
            out: BufWriter::new(out),
            last: None,
            count: 0,
        }
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::OrderingViolation`] if `time` is not strictly
    /// greater than the previous entry.
    pub fn append(&mut self, time: Time, offset: u64) -> Result<()> {
        if let Some(last) = self.last {
            if time <= last {
                return Err(TraceError::OrderingViolation { last, got: time });
            }
        }
        let mut tmp = [0u8; MAX_VARINT64_LEN];
        let n = varint::encode_u64(varint::zigzag_encode_i64(time), &mut tmp);
        self.out.write_all(&tmp[..n])?;
        let n = varint::encode_u64(offset, &mut tmp);
        self.out.write_all(&tmp[..n])?;
        self.last = Some(time);
        self.count += 1;
        Ok(())
    }

    /// Time of the last appended entry.
    pub fn last_time(&self) -> Option<Time> {
        self.last
    }

    /// Number of entries appended.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if nothing was appended.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Flushes and closes the stream.
    pub fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// In-memory sparse index used for floor lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeekIndex {
    entries: Vec<IndexEntry>,
}

impl SeekIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index from entries, validating their order.
    pub fn from_entries(entries: Vec<IndexEntry>) -> Result<Self> {
        for pair in entries.windows(2) {
            if pair[1].time <= pair[0].time {
                return Err(TraceError::CorruptData(format!(
                    "index entry {} not after {}",
                    pair[1].time, pair[0].time
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Loads a complete index from a stream.
    pub fn load<R: Read>(reader: R) -> Result<Self> {
        let mut input = Input::new(reader);
        let mut entries = Vec::new();
        while !input.at_end()? {
            let time = input.read_varint_i64()?;
            let offset = input.read_varint_u64()?;
            entries.push(IndexEntry::new(time, offset));
        }
        Self::from_entries(entries)
    }

    /// Returns the entry with the greatest time ≤ `time`.
    ///
    /// `None` means `time` precedes all indexed data.
    pub fn floor(&self, time: Time) -> Option<IndexEntry> {
        let idx = self.entries.partition_point(|e| e.time <= time);
        idx.checked_sub(1).map(|i| self.entries[i])
    }

    /// First entry.
    pub fn first(&self) -> Option<IndexEntry> {
        self.entries.first().copied()
    }

    /// Last entry.
    pub fn last(&self) -> Option<IndexEntry> {
        self.entries.last().copied()
    }

    /// All entries in time order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
