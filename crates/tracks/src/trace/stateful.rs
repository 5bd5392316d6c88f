//! Snapshotting traces: event-sourced state with periodic STATE blocks.
//!
//! A stateful trace interleaves DATA blocks with STATE blocks holding the
//! full reduced state valid just before the events of the block time. The
//! seek index of such a trace points only at STATE blocks, so a seek is one
//! floor lookup, one snapshot decode and a replay bounded by the snapshot
//! interval.

use crate::bus::{Bus, BusHandle, Listener};
use crate::codec::Item;
use crate::error::{Result, TraceError};
use crate::runner::Generator;
use crate::trace::block::BlockFlag;
use crate::trace::meta::TraceMeta;
use crate::trace::reader::TraceReader;
use crate::trace::writer::TraceWriter;
use crate::Time;
use tracing::debug;

/// Folds events into a running state set.
///
/// `current` must list the state in a deterministic order: it is what gets
/// persisted in snapshots.
pub trait StateReducer {
    /// Event type.
    type Event: Item;
    /// State element type.
    type State: Item;

    /// Applies one event.
    fn apply(&mut self, time: Time, event: &Self::Event);

    /// Replaces the whole state with `states`.
    fn reset(&mut self, states: &[Self::State]);

    /// The current state.
    fn current(&self) -> Vec<Self::State>;
}

/// Writer for stateful traces.
pub struct StatefulWriter<R: StateReducer> {
    writer: TraceWriter<R::Event>,
    reducer: R,
    started: bool,
}

impl<R: StateReducer> StatefulWriter<R> {
    /// Wraps a plain writer. Its automatic indexing is replaced by snapshot
    /// indexing.
    pub fn new(mut writer: TraceWriter<R::Event>, reducer: R) -> Self {
        writer.disable_auto_index();
        Self {
            writer,
            reducer,
            started: false,
        }
    }

    /// Seeds the state and writes the first snapshot at `time`.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::InvalidConfig`] once anything has been written.
    pub fn set_init_state(&mut self, time: Time, states: &[R::State]) -> Result<()> {
        if self.started {
            return Err(TraceError::InvalidConfig(
                "initial state must precede every event".into(),
            ));
        }
        self.reducer.reset(states);
        self.writer.write_state(time, &self.reducer.current())?;
        self.started = true;
        Ok(())
    }

    /// Appends one event, applying it to the state.
    pub fn append(&mut self, time: Time, event: &R::Event) -> Result<()> {
        self.writer.check_order(time)?;
        if !self.started {
            self.writer.write_state(time, &self.reducer.current())?;
            self.started = true;
        } else if matches!(self.writer.last_time(), Some(last) if time > last) {
            self.writer.flush()?;
            if self.writer.since_index() >= self.writer.config().index_interval {
                self.writer.write_state(time, &self.reducer.current())?;
            }
        }
        self.writer.append(time, event)?;
        self.reducer.apply(time, event);
        Ok(())
    }

    /// Appends a batch of events sharing one time.
    pub fn handle(&mut self, time: Time, events: &[R::Event]) -> Result<()> {
        for event in events {
            self.append(time, event)?;
        }
        Ok(())
    }

    /// Current state after every appended event.
    pub fn state(&self) -> Vec<R::State> {
        self.reducer.current()
    }

    /// The wrapped writer.
    pub fn writer(&self) -> &TraceWriter<R::Event> {
        &self.writer
    }

    /// Mutable access to the wrapped writer.
    pub fn writer_mut(&mut self) -> &mut TraceWriter<R::Event> {
        &mut self.writer
    }

    /// Closes the trace. See [`TraceWriter::close`].
    pub fn close(self) -> Result<TraceMeta> {
        self.writer.close()
    }
}

impl<R: StateReducer> Listener<R::Event> for StatefulWriter<R> {
    fn handle(&mut self, time: Time, items: &[R::Event]) -> Result<()> {
        StatefulWriter::handle(self, time, items)
    }
}

/// Reader for stateful traces.
///
/// Publishes events on [`StatefulReader::event_bus`] and reconstructed
/// state on [`StatefulReader::state_bus`].
pub struct StatefulReader<R: StateReducer> {
    inner: TraceReader<R::Event>,
    reducer: R,
    state_bus: Bus<R::State>,
    started: bool,
}

impl<R: StateReducer> std::fmt::Debug for StatefulReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulReader")
            .field("meta", self.inner.meta())
            .field("current", &self.inner.current_time())
            .field("state_bus", &self.state_bus)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl<R: StateReducer> StatefulReader<R> {
    /// Wraps a plain reader over a stateful trace.
    pub fn new(inner: TraceReader<R::Event>, reducer: R) -> Self {
        Self {
            inner,
            reducer,
            state_bus: Bus::new(),
            started: false,
        }
    }

    /// The wrapped reader.
    pub fn reader(&self) -> &TraceReader<R::Event> {
        &self.inner
    }

    /// Trace metadata.
    pub fn meta(&self) -> &TraceMeta {
        self.inner.meta()
    }

    /// Bus carrying events.
    pub fn event_bus(&self) -> &Bus<R::Event> {
        self.inner.bus()
    }

    /// Bus carrying reconstructed state.
    pub fn state_bus(&self) -> &Bus<R::State> {
        &self.state_bus
    }

    /// Current reconstructed state.
    pub fn state(&self) -> Vec<R::State> {
        self.reducer.current()
    }

    /// Current time of the reader.
    pub fn current_time(&self) -> Time {
        self.inner.current_time()
    }

    /// Shifts every time reported by this reader by `offset`.
    pub fn set_time_offset(&mut self, offset: Time) {
        self.inner.set_time_offset(offset);
    }

    /// Scheduling priority.
    pub fn priority(&self) -> i32 {
        self.inner.priority()
    }

    /// Overrides the scheduling priority.
    pub fn set_priority(&mut self, priority: i32) {
        self.inner.set_priority(priority);
    }

    /// Reconstructs the state after every event stamped before `time` and
    /// positions the reader on the first block at or after `time`.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::SeekBeforeStart`] if `time` precedes the first
    /// snapshot.
    pub fn seek(&mut self, time: Time) -> Result<()> {
        self.inner.ensure_open()?;
        let offset = self.inner.time_offset();
        let target = time.saturating_sub(offset);
        let Some(snapshot) = self.inner.index.floor(target) else {
            return self.seek_without_snapshot(time);
        };

        self.inner.stream.seek_offset(snapshot.offset)?;
        match self.inner.stream.current()? {
            Some(header) if header.flag == BlockFlag::State => {}
            _ => {
                return Err(TraceError::CorruptData(format!(
                    "index entry at {} does not point at a STATE block",
                    snapshot.time
                )))
            }
        }
        let states = self.inner.stream.read_payload::<R::State>()?;
        self.reducer.reset(&states);

        let mut replayed = 0usize;
        while let Some(header) = self.inner.stream.current()? {
            if header.time >= target {
                break;
            }
            match header.flag {
                BlockFlag::Data => {
                    let events = self.inner.stream.read_payload::<R::Event>()?;
                    let at = header.time.saturating_add(offset);
                    for event in &events {
                        self.reducer.apply(at, event);
                    }
                    replayed += events.len();
                }
                BlockFlag::State => self.inner.stream.skip_block()?,
            }
        }
        debug!(time, snapshot = snapshot.time, replayed, "Reconstructed state");
        self.inner.current = time;
        self.started = true;
        Ok(())
    }

    fn seek_without_snapshot(&mut self, time: Time) -> Result<()> {
        match self.inner.index.first() {
            Some(first) => Err(TraceError::SeekBeforeStart {
                time,
                start: first.time.saturating_add(self.inner.time_offset()),
            }),
            None => {
                self.inner.stream.rewind()?;
                if self.inner.stream.current()?.is_some() {
                    return Err(TraceError::CorruptData(
                        "stateful trace has blocks but no snapshots".into(),
                    ));
                }
                self.reducer.reset(&[]);
                self.inner.current = time;
                self.started = true;
                Ok(())
            }
        }
    }

    /// Rewinds to the stream start with an empty state, so the first
    /// snapshot met while advancing seeds the reducer.
    fn rewind_before_start(&mut self, time: Time) -> Result<()> {
        self.inner.stream.rewind()?;
        self.reducer.reset(&[]);
        self.started = false;
        self.inner.current = time;
        debug!(time, "Rewound stateful reader before trace start");
        Ok(())
    }

    fn publish_through(&mut self, until: Time) -> Result<()> {
        self.inner.ensure_open()?;
        let offset = self.inner.time_offset();
        while let Some(header) = self.inner.stream.current()? {
            let at = header.time.saturating_add(offset);
            if at > until {
                break;
            }
            match header.flag {
                BlockFlag::Data => {
                    let events = self.inner.stream.read_payload::<R::Event>()?;
                    for event in &events {
                        self.reducer.apply(at, event);
                    }
                    self.inner.bus.queue_all(at, events);
                }
                BlockFlag::State if self.started => self.inner.stream.skip_block()?,
                BlockFlag::State => {
                    let states = self.inner.stream.read_payload::<R::State>()?;
                    self.reducer.reset(&states);
                    self.started = true;
                    self.state_bus.queue_all(at, states);
                }
            }
        }
        Ok(())
    }

    /// Applies and publishes every block stamped ≤ current + `dt`, then
    /// advances the current time by `dt`.
    pub fn incr(&mut self, dt: Time) -> Result<()> {
        let until = self.inner.current_time().saturating_add(dt);
        self.publish_through(until)?;
        self.inner.current = until;
        Ok(())
    }
}

impl<R: StateReducer> Generator for StatefulReader<R> {
    fn seek(&mut self, time: Time) -> Result<()> {
        match StatefulReader::seek(self, time) {
            Ok(()) => self.state_bus.queue_all(time, self.reducer.current()),
            Err(TraceError::SeekBeforeStart { .. }) => self.rewind_before_start(time)?,
            Err(err) => return Err(err),
        }
        self.publish_through(time)
    }

    fn incr(&mut self, dt: Time) -> Result<()> {
        StatefulReader::incr(self, dt)
    }

    fn buses(&self) -> Vec<BusHandle> {
        vec![self.state_bus.handle(), self.inner.bus.handle()]
    }

    fn priority(&self) -> i32 {
        self.inner.priority()
    }

    fn time_bounds(&self) -> Option<(Time, Time)> {
        Generator::time_bounds(&self.inner)
    }

    fn max_update_interval(&self) -> Option<Time> {
        Generator::max_update_interval(&self.inner)
    }
}
