//! Block writer for event traces.

use crate::bus::Listener;
use crate::codec::buffer::{DEFAULT_BUFFER_LIMIT, DEFAULT_INITIAL_CAPACITY};
use crate::codec::{ByteBuffer, Item};
use crate::error::{Result, TraceError};
use crate::store::session::SessionGuard;
use crate::trace::block::{BlockFlag, BlockSink};
use crate::trace::index::IndexWriter;
use crate::trace::meta::{TraceMeta, DEFAULT_PRIORITY};
use crate::Time;
use std::io::Write;
use std::marker::PhantomData;
use tracing::debug;

/// Default number of events between seek-index entries (and snapshots).
pub const DEFAULT_INDEX_INTERVAL: usize = 10_000;

/// Configuration for trace writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Events between seek-index entries. Stateful writers also emit a
    /// snapshot at this cadence.
    pub index_interval: usize,
    /// Initial capacity of the block payload buffer.
    pub initial_buffer: usize,
    /// Hard limit on a single block payload.
    pub buffer_limit: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            index_interval: DEFAULT_INDEX_INTERVAL,
            initial_buffer: DEFAULT_INITIAL_CAPACITY,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }
}

impl WriterConfig {
    /// Creates a configuration with a custom index interval.
    pub fn with_index_interval(index_interval: usize) -> Self {
        Self {
            index_interval,
            ..Self::default()
        }
    }
}

/// Observed time statistics used to derive metadata.
#[derive(Debug, Default, Clone, Copy)]
struct TimeStats {
    min: Option<Time>,
    max: Option<Time>,
    max_gap: Option<Time>,
}

impl TimeStats {
    fn record(&mut self, time: Time) {
        if self.min.is_none() {
            self.min = Some(time);
        }
        if let Some(prev) = self.max {
            if time > prev {
                let gap = time - prev;
                self.max_gap = Some(self.max_gap.map_or(gap, |g| g.max(gap)));
            }
        }
        self.max = Some(self.max.map_or(time, |m| m.max(time)));
    }
}

/// Writes a trace as a sequence of time-ordered blocks.
///
/// Items stamped with the same time are buffered and written as one DATA
/// block when a later time arrives (or on [`TraceWriter::close`]). Every `index_interval` events the writer also
/// records a seek-index entry pointing at the next block header.
pub struct TraceWriter<E> {
    sink: BlockSink,
    index: IndexWriter,
    meta_out: Option<Box<dyn Write>>,
    meta: TraceMeta,
    config: WriterConfig,
    buffer: ByteBuffer,
    pending_time: Option<Time>,
    pending_count: usize,
    last_flushed: Option<Time>,
    since_index: usize,
    auto_index: bool,
    event_count: u64,
    stats: TimeStats,
    default_priority: i32,
    session: Option<SessionGuard>,
    _items: PhantomData<fn(&E)>,
}

impl<E> std::fmt::Debug for TraceWriter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter")
            .field("meta", &self.meta)
            .field("config", &self.config)
            .field("pending_time", &self.pending_time)
            .field("event_count", &self.event_count)
            .finish_non_exhaustive()
    }
}

impl<E: Item> TraceWriter<E> {
    /// Creates a writer over a trace stream and an index stream.
    ///
    /// `meta` holds the caller's explicit metadata; derived fields are
    /// filled on [`TraceWriter::close`].
    pub fn new(
        trace_out: Box<dyn Write>,
        index_out: Box<dyn Write>,
        meta: TraceMeta,
        config: WriterConfig,
    ) -> Self {
        let buffer = ByteBuffer::with_limits(config.initial_buffer, config.buffer_limit);
        Self {
            sink: BlockSink::new(trace_out),
            index: IndexWriter::new(index_out),
            meta_out: None,
            meta,
            config,
            buffer,
            pending_time: None,
            pending_count: 0,
            last_flushed: None,
            since_index: 0,
            auto_index: true,
            event_count: 0,
            stats: TimeStats::default(),
            default_priority: DEFAULT_PRIORITY,
            session: None,
            _items: PhantomData,
        }
    }

    /// Persists the metadata document to `out` on close.
    pub fn with_meta_output(mut self, out: Box<dyn Write>) -> Self {
        self.meta_out = Some(out);
        self
    }

    /// Priority recorded on close when the metadata does not set one.
    pub fn set_default_priority(&mut self, priority: i32) {
        self.default_priority = priority;
    }

    pub(crate) fn attach_session(&mut self, session: SessionGuard) {
        self.session = Some(session);
    }

    pub(crate) fn disable_auto_index(&mut self) {
        self.auto_index = false;
    }

    /// Caller-provided metadata.
    pub fn meta(&self) -> &TraceMeta {
        &self.meta
    }

    /// Mutable access to the caller-provided metadata.
    pub fn meta_mut(&mut self) -> &mut TraceMeta {
        &mut self.meta
    }

    /// Writer configuration.
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Number of events appended so far.
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Latest accepted time, buffered or flushed.
    pub fn last_time(&self) -> Option<Time> {
        self.pending_time.or(self.last_flushed)
    }

    fn ensure_open(&self) -> Result<()> {
        match &self.session {
            Some(session) => session.ensure_active(),
            None => Ok(()),
        }
    }

    pub(crate) fn check_order(&self, time: Time) -> Result<()> {
        match self.last_time() {
            Some(last) if time < last => Err(TraceError::OrderingViolation { last, got: time }),
            _ => Ok(()),
        }
    }

    /// Appends one event stamped `time`.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::OrderingViolation`] if `time` is earlier than
    /// the last accepted time.
    pub fn append(&mut self, time: Time, item: &E) -> Result<()> {
        self.ensure_open()?;
        self.check_order(time)?;
        if matches!(self.pending_time, Some(pending) if time > pending) {
            self.flush()?;
        }
        item.write(&mut self.buffer)?;
        self.pending_time = Some(time);
        self.pending_count += 1;
        self.event_count += 1;
        Ok(())
    }

    /// Appends a batch of events sharing one time.
    pub fn handle(&mut self, time: Time, items: &[E]) -> Result<()> {
        for item in items {
            self.append(time, item)?;
        }
        Ok(())
    }

    /// Writes the buffered events as one DATA block.
    ///
    /// Only called at a timestamp change or on close, so every timestamp
    /// maps to a single DATA block.
    pub(crate) fn flush(&mut self) -> Result<()> {
        let Some(time) = self.pending_time.take() else {
            return Ok(());
        };
        if self.auto_index
            && (self.index.is_empty() || self.since_index >= self.config.index_interval)
        {
            self.add_index_entry(time)?;
        }
        self.sink
            .write_block(BlockFlag::Data, time, self.buffer.as_slice())?;
        self.stats.record(time);
        self.buffer.clear();
        self.since_index += self.pending_count;
        self.pending_count = 0;
        self.last_flushed = Some(time);
        Ok(())
    }

    fn add_index_entry(&mut self, time: Time) -> Result<()> {
        if matches!(self.index.last_time(), Some(last) if last >= time) {
            return Ok(());
        }
        let offset = self.sink.position();
        self.index.append(time, offset)?;
        self.since_index = 0;
        debug!(time, offset, "Recorded seek index entry");
        Ok(())
    }

    /// Flushed events since the last index entry, counting the indexed block.
    pub(crate) fn since_index(&self) -> usize {
        self.since_index
    }

    /// Writes a STATE block at `time` and indexes it.
    ///
    /// Any buffered DATA must have been flushed first.
    pub(crate) fn write_state<S: Item>(&mut self, time: Time, states: &[S]) -> Result<()> {
        self.ensure_open()?;
        self.check_order(time)?;
        debug_assert!(self.pending_time.is_none(), "flush before writing state");
        self.add_index_entry(time)?;
        self.buffer.clear();
        for state in states {
            state.write(&mut self.buffer)?;
        }
        self.sink
            .write_block(BlockFlag::State, time, self.buffer.as_slice())?;
        self.buffer.clear();
        self.stats.record(time);
        self.last_flushed = Some(time);
        debug!(time, states = states.len(), "Wrote state snapshot");
        Ok(())
    }

    /// Flushes, closes both streams and persists the metadata.
    ///
    /// Derived values (observed min/max time, largest gap between distinct
    /// timestamps, default priority) only fill fields the caller left unset.
    /// A store-owned writer publishes the trace only here; dropping it
    /// unclosed keeps the previous trace. Returns the final metadata.
    pub fn close(mut self) -> Result<TraceMeta> {
        self.ensure_open()?;
        self.flush()?;
        let blocks = self.sink.block_count();
        let index_entries = self.index.len();
        self.sink.finish()?;
        self.index.finish()?;

        let derived = TraceMeta {
            min_time: self.stats.min,
            max_time: self.stats.max,
            max_update_interval: Some(self.stats.max_gap.unwrap_or(1).max(1)),
            default_priority: Some(self.default_priority),
            ..TraceMeta::default()
        };
        let mut meta = self.meta;
        meta.merge_derived(&derived);

        if let Some(mut out) = self.meta_out.take() {
            meta.write_to(&mut out)?;
            out.flush()?;
        }
        debug!(
            name = meta.name.as_deref().unwrap_or(""),
            blocks,
            index_entries,
            events = self.event_count,
            "Closed trace writer"
        );
        if let Some(mut session) = self.session.take() {
            session.commit_writer(&meta)?;
        }
        Ok(meta)
    }
}

impl<E: Item> Listener<E> for TraceWriter<E> {
    fn handle(&mut self, time: Time, items: &[E]) -> Result<()> {
        TraceWriter::handle(self, time, items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SharedBytes;
    use crate::trace::index::SeekIndex;

    fn writer(config: WriterConfig) -> (TraceWriter<i64>, SharedBytes, SharedBytes, SharedBytes) {
        let trace = SharedBytes::default();
        let index = SharedBytes::default();
        let meta = SharedBytes::default();
        let writer = TraceWriter::new(
            Box::new(trace.writer()),
            Box::new(index.writer()),
            TraceMeta::new("t", "ints"),
            config,
        )
        .with_meta_output(Box::new(meta.writer()));
        (writer, trace, index, meta)
    }

    #[test]
    fn test_same_time_items_share_a_block() {
        let (mut w, trace, _, _) = writer(WriterConfig::default());
        w.append(5, &1).unwrap();
        w.append(5, &2).unwrap();
        w.append(7, &3).unwrap();
        w.close().unwrap();

        // [flag][len=2][ts=5 -> 10][1 -> 2][2 -> 4] [flag][len=1][ts=7 -> 14][3 -> 6]
        assert_eq!(trace.to_vec(), vec![0, 2, 10, 2, 4, 0, 1, 14, 6]);
    }

    #[test]
    fn test_batches_at_one_time_share_a_block() {
        let (mut w, trace, _, _) = writer(WriterConfig::default());
        Listener::<i64>::handle(&mut w, 5, &[1]).unwrap();
        Listener::<i64>::handle(&mut w, 5, &[2, 3]).unwrap();
        Listener::<i64>::handle(&mut w, 6, &[]).unwrap();
        w.append(6, &4).unwrap();
        w.close().unwrap();

        // [flag][len=3][ts=5 -> 10][2][4][6] [flag][len=1][ts=6 -> 12][8]
        assert_eq!(trace.to_vec(), vec![0, 3, 10, 2, 4, 6, 0, 1, 12, 8]);
    }

    #[test]
    fn test_rejects_earlier_time() {
        let (mut w, _, _, _) = writer(WriterConfig::default());
        w.append(10, &1).unwrap();
        let err = w.append(9, &1).unwrap_err();
        assert!(matches!(
            err,
            TraceError::OrderingViolation { last: 10, got: 9 }
        ));
        // Equal time is fine.
        w.append(10, &2).unwrap();
    }

    #[test]
    fn test_index_cadence() {
        let (mut w, _, index, _) = writer(WriterConfig::with_index_interval(2));
        for t in 0..10 {
            w.append(t, &t).unwrap();
        }
        w.close().unwrap();
        let index = SeekIndex::load(index.reader()).unwrap();
        let times: Vec<Time> = index.entries().iter().map(|e| e.time).collect();
        assert_eq!(times, vec![0, 2, 4, 6, 8]);
        assert_eq!(index.first().unwrap().offset, 0);
    }

    #[test]
    fn test_close_derives_metadata() {
        let (mut w, _, _, meta_out) = writer(WriterConfig::default());
        w.meta_mut().max_time = Some(1_000);
        w.set_default_priority(7);
        for t in [3, 4, 9, 10] {
            w.append(t, &t).unwrap();
        }
        let meta = w.close().unwrap();
        assert_eq!(meta.min_time, Some(3));
        assert_eq!(meta.max_time, Some(1_000));
        assert_eq!(meta.max_update_interval, Some(5));
        assert_eq!(meta.default_priority, Some(7));

        let persisted = TraceMeta::parse(&String::from_utf8(meta_out.to_vec()).unwrap()).unwrap();
        assert_eq!(persisted, meta);
    }

    #[test]
    fn test_single_timestamp_interval_is_one() {
        let (mut w, _, _, _) = writer(WriterConfig::default());
        w.append(4, &1).unwrap();
        let meta = w.close().unwrap();
        assert_eq!(meta.max_update_interval, Some(1));
        assert_eq!(meta.time_bounds(), Some((4, 4)));
    }
}
