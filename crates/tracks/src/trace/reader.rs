//! Block reader for event traces.

use crate::bus::{Bus, BusHandle};
use crate::codec::Item;
use crate::error::Result;
use crate::runner::Generator;
use crate::store::session::SessionGuard;
use crate::trace::block::{BlockFlag, BlockHeader, BlockStream, InputOpener};
use crate::trace::index::SeekIndex;
use crate::trace::meta::TraceMeta;
use crate::Time;
use tracing::debug;

/// Sequential reader over a trace's DATA blocks.
///
/// The reader is either before its first block, positioned on a block
/// header, or exhausted. [`TraceReader::seek`] uses the sparse index to jump
/// near the target and then skips whole blocks by their declared length, so
/// only the returned blocks are ever decoded.
///
/// All times are shifted by the reader's offset (see
/// [`TraceReader::set_time_offset`]), letting several traces be replayed
/// relative to each other without rewriting them. STATE blocks are passed
/// over, so a plain reader can read the events of a stateful trace.
pub struct TraceReader<E> {
    pub(crate) stream: BlockStream,
    pub(crate) index: SeekIndex,
    pub(crate) meta: TraceMeta,
    pub(crate) offset: Time,
    pub(crate) current: Time,
    pub(crate) bus: Bus<E>,
    priority: i32,
    session: Option<SessionGuard>,
}

impl<E> std::fmt::Debug for TraceReader<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceReader")
            .field("meta", &self.meta)
            .field("offset", &self.offset)
            .field("current", &self.current)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl<E: Item> TraceReader<E> {
    /// Opens a reader over a trace stream with its loaded index.
    pub fn new(opener: InputOpener, index: SeekIndex, meta: TraceMeta) -> Result<Self> {
        let stream = BlockStream::open(opener)?;
        let current = meta.min_time.unwrap_or(Time::MIN);
        let priority = meta.priority();
        Ok(Self {
            stream,
            index,
            meta,
            offset: 0,
            current,
            bus: Bus::new(),
            priority,
            session: None,
        })
    }

    pub(crate) fn attach_session(&mut self, session: SessionGuard) {
        self.session = Some(session);
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match &self.session {
            Some(session) => session.ensure_active(),
            None => Ok(()),
        }
    }

    /// Trace metadata.
    pub fn meta(&self) -> &TraceMeta {
        &self.meta
    }

    /// The loaded seek index.
    pub fn index(&self) -> &SeekIndex {
        &self.index
    }

    /// Bus the reader publishes decoded batches on.
    pub fn bus(&self) -> &Bus<E> {
        &self.bus
    }

    /// Shifts every time reported by this reader by `offset`.
    pub fn set_time_offset(&mut self, offset: Time) {
        self.current = self.current.saturating_add(offset - self.offset);
        self.offset = offset;
    }

    /// Current time offset.
    pub fn time_offset(&self) -> Time {
        self.offset
    }

    /// Current time of the reader, after the last seek or increment.
    pub fn current_time(&self) -> Time {
        self.current
    }

    /// Scheduling priority, initially the trace's default priority.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Overrides the scheduling priority.
    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    /// Moves the stream so that the cursor sits on the first block whose
    /// stored time is ≥ `target`.
    pub(crate) fn position_at(&mut self, target: Time, start: u64) -> Result<()> {
        let reuse = match self.stream.current()? {
            Some(header) => header.offset >= start && header.time < target,
            None => false,
        };
        if !reuse {
            self.stream.seek_offset(start)?;
        }
        let mut skipped = 0u64;
        while let Some(header) = self.stream.current()? {
            if header.time >= target {
                break;
            }
            self.stream.skip_block()?;
            skipped += 1;
        }
        debug!(target, start, skipped, "Positioned trace reader");
        Ok(())
    }

    /// Positions the reader so the next batch is the first at or after `time`.
    ///
    /// Seeking is idempotent.
    pub fn seek(&mut self, time: Time) -> Result<()> {
        self.ensure_open()?;
        let target = time.saturating_sub(self.offset);
        let start = self.index.floor(target).map_or(0, |entry| entry.offset);
        self.position_at(target, start)?;
        self.current = time;
        Ok(())
    }

    fn next_data_header(&mut self) -> Result<Option<BlockHeader>> {
        while let Some(header) = self.stream.current()? {
            if header.flag == BlockFlag::Data {
                return Ok(Some(header));
            }
            self.stream.skip_block()?;
        }
        Ok(None)
    }

    /// Returns true if another DATA block remains.
    pub fn has_next(&mut self) -> Result<bool> {
        Ok(self.next_time()?.is_some())
    }

    /// Time of the next DATA block without decoding it.
    pub fn next_time(&mut self) -> Result<Option<Time>> {
        self.ensure_open()?;
        Ok(self
            .next_data_header()?
            .map(|header| header.time.saturating_add(self.offset)))
    }

    /// Decodes the next DATA block and advances past it.
    pub fn next_batch(&mut self) -> Result<Option<(Time, Vec<E>)>> {
        self.ensure_open()?;
        let Some(header) = self.next_data_header()? else {
            return Ok(None);
        };
        let items = self.stream.read_payload::<E>()?;
        Ok(Some((header.time.saturating_add(self.offset), items)))
    }

    /// Queues every remaining block stamped ≤ `until` on the bus.
    fn publish_through(&mut self, until: Time) -> Result<()> {
        while let Some(time) = self.next_time()? {
            if time > until {
                break;
            }
            if let Some((time, items)) = self.next_batch()? {
                self.bus.queue_all(time, items);
            }
        }
        Ok(())
    }

    /// Publishes every block stamped ≤ current + `dt`, then advances the
    /// current time by `dt`.
    pub fn incr(&mut self, dt: Time) -> Result<()> {
        let until = self.current.saturating_add(dt);
        self.publish_through(until)?;
        self.current = until;
        Ok(())
    }

    fn shifted_bounds(&self) -> Option<(Time, Time)> {
        self.meta
            .time_bounds()
            .map(|(min, max)| (min.saturating_add(self.offset), max.saturating_add(self.offset)))
    }
}

impl<E: Item> Generator for TraceReader<E> {
    fn seek(&mut self, time: Time) -> Result<()> {
        TraceReader::seek(self, time)?;
        self.publish_through(time)
    }

    fn incr(&mut self, dt: Time) -> Result<()> {
        TraceReader::incr(self, dt)
    }

    fn buses(&self) -> Vec<BusHandle> {
        vec![self.bus.handle()]
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn time_bounds(&self) -> Option<(Time, Time)> {
        self.shifted_bounds()
    }

    fn max_update_interval(&self) -> Option<Time> {
        self.meta.max_update_interval
    }
}
