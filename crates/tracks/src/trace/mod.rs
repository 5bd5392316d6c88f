//! Trace files: block framing, the seek index, metadata, and the plain and
//! stateful readers and writers built on them.
//!
//! # Components
//!
//! - [`TraceWriter`] / [`TraceReader`]: time-ordered DATA blocks with a
//!   sparse seek index
//! - [`StatefulWriter`] / [`StatefulReader`]: the same plus periodic STATE
//!   snapshots, so a seek replays at most one snapshot interval
//! - [`TraceMeta`]: the `key: value` metadata document

pub mod block;
pub mod index;
pub mod meta;
pub mod reader;
pub mod stateful;
pub mod writer;

pub use block::{BlockFlag, BlockHeader, BlockStream, InputOpener};
pub use index::{IndexEntry, IndexWriter, SeekIndex};
pub use meta::{IdMap, TimeUnit, TraceMeta, DEFAULT_PRIORITY};
pub use reader::TraceReader;
pub use stateful::{StateReducer, StatefulReader, StatefulWriter};
pub use writer::{TraceWriter, WriterConfig, DEFAULT_INDEX_INTERVAL};
