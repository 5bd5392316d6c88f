//! Error and Result types for trace storage and replay.

use crate::Time;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for trace operations.
pub type Result<T> = std::result::Result<T, TraceError>;

/// The error type for trace operations.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Malformed encoded data (bad varint, length mismatch, invalid UTF-8).
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// The stream ended in the middle of a value or block.
    #[error("Truncated data: {0}")]
    Truncated(String),

    /// Unknown block flag byte.
    #[error("Invalid block flag: {0:#04x}")]
    InvalidFlag(u8),

    /// Metadata document could not be parsed.
    #[error("Invalid metadata: {0}")]
    InvalidMeta(String),

    /// The write buffer would grow past its hard limit.
    #[error("Buffer overflow: {requested} bytes requested, limit is {limit}")]
    BufferOverflow {
        /// Total size that was requested.
        requested: usize,
        /// Configured hard limit.
        limit: usize,
    },

    /// A timestamp was written after a later one.
    #[error("Ordering violation: time {got} written after {last}")]
    OrderingViolation {
        /// Last accepted time.
        last: Time,
        /// Offending time.
        got: Time,
    },

    /// The requested trace does not exist.
    #[error("Trace not found: {0}")]
    NotFound(String),

    /// A writer is already open on the trace.
    #[error("Trace {0} already has an open writer")]
    WriterBusy(String),

    /// The trace has open sessions and cannot be modified.
    #[error("Trace {0} has open sessions")]
    TraceBusy(String),

    /// A stateful seek targeted a time before the first snapshot.
    #[error("Seek to {time} precedes trace start {start}")]
    SeekBeforeStart {
        /// Requested time.
        time: Time,
        /// Time of the first snapshot.
        start: Time,
    },

    /// A forward-only stream was asked to move backward.
    #[error("Cannot fast-forward from {position} back to {target}")]
    BackwardSeek {
        /// Current stream position.
        position: u64,
        /// Requested position.
        target: u64,
    },

    /// The handle was closed, possibly by its store.
    #[error("Handle for trace {0} is closed")]
    Closed(String),

    /// The trace type tag does not match the requested kind.
    #[error("Trace {name} has type {found:?}, expected {expected}")]
    TypeMismatch {
        /// Trace name.
        name: String,
        /// Requested type tag.
        expected: String,
        /// Type tag recorded in the metadata.
        found: Option<String>,
    },

    /// A configuration value is missing or out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A bus listener failed while handling a batch.
    #[error("Listener error: {0}")]
    Listener(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TraceError {
    /// Returns true if this error reports a missing trace.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true for format and corruption errors.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Self::CorruptData(_) | Self::Truncated(_) | Self::InvalidFlag(_) | Self::InvalidMeta(_)
        )
    }
}
