//! Tracks - Alopex Event Trace Storage and Replay
//!
//! This crate stores timestamped event streams ("traces") in a compact
//! block format and replays one or many of them on a shared clock.
//!
//! # Components
//!
//! - [`TraceWriter`] / [`TraceReader`]: block files with a sparse seek index
//! - [`StatefulWriter`] / [`StatefulReader`]: event-sourced state with
//!   periodic snapshots for fast random access
//! - [`Bus`]: time-ordered delivery of batches to listeners
//! - [`Runner`]: merges several generators into one timeline
//! - [`Store`]: named traces on a directory or in memory
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_tracks::presence::{Presence, PresenceEvent};
//! use alopex_tracks::{Registry, Store, WriterConfig};
//!
//! let mut registry = Registry::new();
//! registry.register_stateful::<Presence>();
//! let store = Store::open_dir("traces", registry)?;
//!
//! let mut writer = store.create_stateful_writer::<Presence>("lobby", WriterConfig::default())?;
//! writer.append(0, &"alice,in".parse()?)?;
//! writer.append(12, &PresenceEvent::leave("alice"))?;
//! writer.close()?;
//!
//! let mut reader = store.open_stateful_reader::<Presence>("lobby")?;
//! reader.seek(5)?;
//! assert_eq!(reader.state(), vec!["alice".to_string()]);
//! ```

#![deny(missing_docs)]

pub mod bus;
pub mod codec;
pub mod error;
pub mod presence;
pub mod runner;
pub mod store;
pub mod trace;

/// Timestamp in trace ticks. The unit is recorded in the trace metadata.
pub type Time = i64;

pub use bus::{Bus, BusHandle, Listener, StatefulListener, Subscriber};
pub use codec::{ByteBuffer, Input, Item};
pub use error::{Result, TraceError};
pub use runner::{Generator, Runner, RunnerConfig};
pub use store::{Backend, DirBackend, MemBackend, Registry, StatefulTraceKind, Store, TraceKind};
pub use trace::{
    StateReducer, StatefulReader, StatefulWriter, TraceMeta, TraceReader, TraceWriter,
    WriterConfig,
};
