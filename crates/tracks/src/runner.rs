//! Multi-trace playback.
//!
//! The [`Runner`] owns a clock and a set of [`Generator`]s. Generators
//! publish onto buses as the clock moves; the runner then drains those
//! buses in global time order, so listeners attached to different traces
//! observe one merged, deterministic timeline.
//!
//! Ties at the same timestamp are broken by generator priority (lower
//! first), then by the order in which the buses were registered.

use crate::bus::BusHandle;
use crate::error::{Result, TraceError};
use crate::trace::meta::DEFAULT_PRIORITY;
use crate::Time;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// A seekable stream that publishes onto buses.
pub trait Generator {
    /// Repositions at `time` and queues whatever is stamped exactly `time`.
    fn seek(&mut self, time: Time) -> Result<()>;

    /// Advances by `dt`, queueing everything up to the new time.
    fn incr(&mut self, dt: Time) -> Result<()>;

    /// Buses this generator publishes on.
    fn buses(&self) -> Vec<BusHandle>;

    /// Tie-break priority; lower is delivered first.
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// Earliest and latest time this generator has data for.
    fn time_bounds(&self) -> Option<(Time, Time)> {
        None
    }

    /// Largest gap between consecutive timestamps, used to pick a step.
    fn max_update_interval(&self) -> Option<Time> {
        None
    }
}

impl<G: Generator + ?Sized> Generator for Box<G> {
    fn seek(&mut self, time: Time) -> Result<()> {
        (**self).seek(time)
    }

    fn incr(&mut self, dt: Time) -> Result<()> {
        (**self).incr(dt)
    }

    fn buses(&self) -> Vec<BusHandle> {
        (**self).buses()
    }

    fn priority(&self) -> i32 {
        (**self).priority()
    }

    fn time_bounds(&self) -> Option<(Time, Time)> {
        (**self).time_bounds()
    }

    fn max_update_interval(&self) -> Option<Time> {
        (**self).max_update_interval()
    }
}

/// Shared generators stay reachable by the caller while the runner drives
/// them.
impl<G: Generator + ?Sized> Generator for Rc<RefCell<G>> {
    fn seek(&mut self, time: Time) -> Result<()> {
        self.borrow_mut().seek(time)
    }

    fn incr(&mut self, dt: Time) -> Result<()> {
        self.borrow_mut().incr(dt)
    }

    fn buses(&self) -> Vec<BusHandle> {
        self.borrow().buses()
    }

    fn priority(&self) -> i32 {
        self.borrow().priority()
    }

    fn time_bounds(&self) -> Option<(Time, Time)> {
        self.borrow().time_bounds()
    }

    fn max_update_interval(&self) -> Option<Time> {
        self.borrow().max_update_interval()
    }
}

/// Runner configuration. Unset values are derived from the generators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Clock increment per [`Runner::incr`].
    pub step: Option<Time>,
    /// Start of playback.
    pub min: Option<Time>,
    /// End of playback.
    pub max: Option<Time>,
}

impl RunnerConfig {
    /// Configuration with a fixed step.
    pub fn with_step(step: Time) -> Self {
        Self {
            step: Some(step),
            ..Self::default()
        }
    }
}

struct Slot {
    bus: BusHandle,
    /// Index of the first generator that exposed the bus.
    owner: usize,
}

/// Drives generators and drains their buses in time order.
pub struct Runner {
    config: RunnerConfig,
    generators: Vec<Box<dyn Generator>>,
    slots: Vec<Slot>,
    clock: Option<Time>,
}

impl Runner {
    /// Creates a runner with no generators.
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            generators: Vec::new(),
            slots: Vec::new(),
            clock: None,
        }
    }

    /// Adds a generator. Buses it shares with an earlier generator keep
    /// that generator's priority.
    ///
    /// Priorities are read each time buses are drained, so a shared
    /// generator may change its priority during playback.
    pub fn add<G: Generator + 'static>(&mut self, generator: G) {
        let owner = self.generators.len();
        for bus in generator.buses() {
            if !self.slots.iter().any(|slot| slot.bus.same_bus(&bus)) {
                self.slots.push(Slot { bus, owner });
            }
        }
        self.generators.push(Box::new(generator));
    }

    /// Number of generators.
    pub fn generator_count(&self) -> usize {
        self.generators.len()
    }

    /// Number of distinct buses.
    pub fn bus_count(&self) -> usize {
        self.slots.len()
    }

    /// Current clock, `None` before the first seek.
    pub fn clock(&self) -> Option<Time> {
        self.clock
    }

    /// Configuration as given.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Configured step, or the smallest update interval of any generator.
    pub fn step(&self) -> Option<Time> {
        self.config.step.or_else(|| {
            self.generators
                .iter()
                .filter_map(|g| g.max_update_interval())
                .min()
        })
    }

    /// Configured bounds, completed with the union of generator bounds.
    pub fn bounds(&self) -> Option<(Time, Time)> {
        let union = self
            .generators
            .iter()
            .filter_map(|g| g.time_bounds())
            .reduce(|(lo, hi), (min, max)| (lo.min(min), hi.max(max)));
        let min = self.config.min.or(union.map(|(min, _)| min))?;
        let max = self.config.max.or(union.map(|(_, max)| max))?;
        Some((min, max))
    }

    fn resolved_step(&self) -> Result<Time> {
        match self.step() {
            Some(step) if step > 0 => Ok(step),
            Some(step) => Err(TraceError::InvalidConfig(format!(
                "step must be positive, got {step}"
            ))),
            None => Err(TraceError::InvalidConfig(
                "no step configured and no generator reports an update interval".into(),
            )),
        }
    }

    /// Delivers pending batches stamped before `limit` (or at it, if
    /// `inclusive`), earliest first.
    fn drain(&self, limit: Time, inclusive: bool) -> Result<usize> {
        let mut delivered = 0;
        loop {
            let next = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(idx, slot)| {
                    let time = slot.bus.next_time()?;
                    let due = if inclusive { time <= limit } else { time < limit };
                    let priority = self.generators[slot.owner].priority();
                    due.then_some((time, priority, idx))
                })
                .min();
            let Some((_, _, idx)) = next else {
                return Ok(delivered);
            };
            self.slots[idx].bus.signal_next()?;
            delivered += 1;
        }
    }

    /// Resets every bus, seeks every generator to `time` and delivers what
    /// is stamped at or before `time`.
    pub fn seek(&mut self, time: Time) -> Result<()> {
        for slot in &self.slots {
            slot.bus.reset();
        }
        for generator in &mut self.generators {
            generator.seek(time)?;
        }
        self.clock = Some(time);
        let delivered = self.drain(time, true)?;
        debug!(time, delivered, "Runner seek");
        Ok(())
    }

    /// Advances the clock by one step (clamped to the maximum) and delivers
    /// what is stamped before the new clock. Returns the new clock.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::InvalidConfig`] before the first seek or when
    /// no step can be derived.
    pub fn incr(&mut self) -> Result<Time> {
        let clock = self.clock.ok_or_else(|| {
            TraceError::InvalidConfig("runner must seek before advancing".into())
        })?;
        let step = self.resolved_step()?;
        let dt = match self.bounds() {
            Some((_, max)) => step.min(max.saturating_sub(clock)).max(0),
            None => step,
        };
        for generator in &mut self.generators {
            generator.incr(dt)?;
        }
        let clock = clock.saturating_add(dt);
        self.clock = Some(clock);
        self.drain(clock, false)?;
        Ok(clock)
    }

    /// Plays from the minimum to the maximum, delivering every event once.
    pub fn run(&mut self) -> Result<()> {
        self.resolved_step()?;
        let (min, max) = self.bounds().ok_or_else(|| {
            TraceError::InvalidConfig("no time bounds configured or reported".into())
        })?;
        debug!(min, max, generators = self.generators.len(), "Runner start");
        self.seek(min)?;
        let mut clock = min;
        while clock < max {
            clock = self.incr()?;
        }
        self.drain(max, true)?;
        debug!(clock, "Runner finished");
        Ok(())
    }
}
