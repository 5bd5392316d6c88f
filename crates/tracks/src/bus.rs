//! Time-ordered publish/subscribe channel between generators and listeners.
//!
//! A [`Bus`] buffers batches keyed by timestamp. Whoever drives it (usually
//! the [`Runner`](crate::runner::Runner)) pops the earliest batch with
//! [`Bus::signal_next`], which hands it synchronously to every listener in
//! registration order.

use crate::error::Result;
use crate::Time;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Receives batches from a bus.
pub trait Listener<T> {
    /// Handles all items published at `time`.
    fn handle(&mut self, time: Time, items: &[T]) -> Result<()>;
}

impl<T, F> Listener<T> for F
where
    F: FnMut(Time, &[T]) -> Result<()>,
{
    fn handle(&mut self, time: Time, items: &[T]) -> Result<()> {
        self(time, items)
    }
}

/// A shared listener, so its owner can still reach it (e.g. to close a
/// writer) after handing a clone to a bus.
impl<T, L> Listener<T> for Rc<RefCell<L>>
where
    L: Listener<T>,
{
    fn handle(&mut self, time: Time, items: &[T]) -> Result<()> {
        self.borrow_mut().handle(time, items)
    }
}

/// Listener holding state derived from what it received.
///
/// Reset whenever the bus is reset, e.g. when playback seeks.
pub trait StatefulListener<T>: Listener<T> {
    /// Discards derived state.
    fn reset(&mut self);
}

/// A registered listener, tagged with whether it needs resets.
pub enum Subscriber<T> {
    /// Listener without derived state.
    Plain(Box<dyn Listener<T>>),
    /// Listener that is reset together with the bus.
    Stateful(Box<dyn StatefulListener<T>>),
}

impl<T> Subscriber<T> {
    fn handle(&mut self, time: Time, items: &[T]) -> Result<()> {
        match self {
            Self::Plain(listener) => listener.handle(time, items),
            Self::Stateful(listener) => listener.handle(time, items),
        }
    }

    fn reset(&mut self) {
        if let Self::Stateful(listener) = self {
            listener.reset();
        }
    }
}

struct BusInner<T> {
    pending: RefCell<BTreeMap<Time, Vec<T>>>,
    subscribers: RefCell<Vec<Subscriber<T>>>,
}

/// Shared handle to a bus. Clones refer to the same bus.
pub struct Bus<T> {
    inner: Rc<BusInner<T>>,
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Bus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Bus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("pending", &self.inner.pending.borrow().len())
            .field("subscribers", &self.inner.subscribers.borrow().len())
            .finish()
    }
}

impl<T> Bus<T> {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(BusInner {
                pending: RefCell::new(BTreeMap::new()),
                subscribers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Queues one item at `time`.
    pub fn queue(&self, time: Time, item: T) {
        self.inner
            .pending
            .borrow_mut()
            .entry(time)
            .or_default()
            .push(item);
    }

    /// Queues a batch at `time`. An empty batch is still delivered.
    pub fn queue_all<I>(&self, time: Time, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        self.inner
            .pending
            .borrow_mut()
            .entry(time)
            .or_default()
            .extend(items);
    }

    /// Registers a subscriber.
    ///
    /// Must not be called from inside a listener of the same bus.
    pub fn subscribe(&self, subscriber: Subscriber<T>) {
        self.inner.subscribers.borrow_mut().push(subscriber);
    }

    /// Registers a plain listener.
    pub fn add_listener<L>(&self, listener: L)
    where
        L: Listener<T> + 'static,
    {
        self.subscribe(Subscriber::Plain(Box::new(listener)));
    }

    /// Registers a listener that is reset with the bus.
    pub fn add_stateful_listener<L>(&self, listener: L)
    where
        L: StatefulListener<T> + 'static,
    {
        self.subscribe(Subscriber::Stateful(Box::new(listener)));
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }

    /// Earliest pending time.
    pub fn next_time(&self) -> Option<Time> {
        self.inner.next_time()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.inner.pending.borrow().is_empty()
    }

    /// Delivers the earliest pending batch. Returns false if none was pending.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first listener failure; later listeners do
    /// not see the batch.
    pub fn signal_next(&self) -> Result<bool> {
        self.inner.signal_next()
    }

    /// Delivers everything pending, including batches queued while
    /// delivering.
    pub fn flush(&self) -> Result<()> {
        while self.signal_next()? {}
        Ok(())
    }

    /// Delivers pending batches stamped ≤ `max`.
    pub fn flush_until(&self, max: Time) -> Result<()> {
        while matches!(self.next_time(), Some(time) if time <= max) {
            self.signal_next()?;
        }
        Ok(())
    }

    /// Drops everything pending and resets stateful listeners.
    pub fn reset(&self) {
        self.inner.reset();
    }

    /// Returns true if both handles refer to the same bus.
    pub fn ptr_eq(&self, other: &Bus<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: 'static> Bus<T> {
    /// Type-erased handle for the runner.
    pub fn handle(&self) -> BusHandle {
        BusHandle(Rc::clone(&self.inner) as Rc<dyn Dispatch>)
    }
}

/// Type-erased view of a bus.
pub trait Dispatch {
    /// Earliest pending time.
    fn next_time(&self) -> Option<Time>;
    /// Delivers the earliest pending batch.
    fn signal_next(&self) -> Result<bool>;
    /// Drops everything pending and resets stateful listeners.
    fn reset(&self);
}

impl<T> Dispatch for BusInner<T> {
    fn next_time(&self) -> Option<Time> {
        self.pending.borrow().keys().next().copied()
    }

    fn signal_next(&self) -> Result<bool> {
        let Some((time, items)) = self.pending.borrow_mut().pop_first() else {
            return Ok(false);
        };
        for subscriber in self.subscribers.borrow_mut().iter_mut() {
            subscriber.handle(time, &items)?;
        }
        Ok(true)
    }

    fn reset(&self) {
        self.pending.borrow_mut().clear();
        for subscriber in self.subscribers.borrow_mut().iter_mut() {
            subscriber.reset();
        }
    }
}

/// Shared, type-erased bus handle. Equality is identity.
#[derive(Clone)]
pub struct BusHandle(Rc<dyn Dispatch>);

impl BusHandle {
    /// Returns true if both handles refer to the same bus.
    pub fn same_bus(&self, other: &BusHandle) -> bool {
        Rc::as_ptr(&self.0) as *const u8 == Rc::as_ptr(&other.0) as *const u8
    }
}

impl PartialEq for BusHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_bus(other)
    }
}

impl Eq for BusHandle {}

impl fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BusHandle")
            .field(&(Rc::as_ptr(&self.0) as *const u8))
            .finish()
    }
}

impl std::ops::Deref for BusHandle {
    type Target = dyn Dispatch;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TraceError;

    type Log = Rc<RefCell<Vec<(Time, Vec<u32>)>>>;

    fn recorder(bus: &Bus<u32>) -> Log {
        let log: Log = Rc::default();
        let sink = Rc::clone(&log);
        bus.add_listener(move |time: Time, items: &[u32]| {
            sink.borrow_mut().push((time, items.to_vec()));
            Ok(())
        });
        log
    }

    struct Counter {
        seen: Rc<RefCell<usize>>,
    }

    impl Listener<u32> for Counter {
        fn handle(&mut self, _time: Time, items: &[u32]) -> Result<()> {
            *self.seen.borrow_mut() += items.len();
            Ok(())
        }
    }

    impl StatefulListener<u32> for Counter {
        fn reset(&mut self) {
            *self.seen.borrow_mut() = 0;
        }
    }

    #[test]
    fn test_delivers_in_time_order() {
        let bus = Bus::new();
        let log = recorder(&bus);
        bus.queue(20, 2);
        bus.queue(10, 1);
        bus.queue_all(10, vec![3, 4]);
        assert_eq!(bus.next_time(), Some(10));
        bus.flush().unwrap();
        assert_eq!(*log.borrow(), vec![(10, vec![1, 3, 4]), (20, vec![2])]);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_flush_until_is_inclusive() {
        let bus = Bus::new();
        let log = recorder(&bus);
        for t in [1, 2, 3] {
            bus.queue(t, t as u32);
        }
        bus.flush_until(2).unwrap();
        assert_eq!(log.borrow().len(), 2);
        assert_eq!(bus.next_time(), Some(3));
    }

    #[test]
    fn test_listener_failure_stops_delivery() {
        let bus = Bus::new();
        bus.add_listener(|_: Time, _: &[u32]| Err(TraceError::Listener("boom".into())));
        let log = recorder(&bus);
        bus.queue(1, 1);
        assert!(matches!(bus.signal_next(), Err(TraceError::Listener(_))));
        assert!(log.borrow().is_empty());
        assert!(!bus.signal_next().unwrap());
    }

    #[test]
    fn test_reset_clears_and_resets_stateful_listeners() {
        let bus = Bus::new();
        let seen = Rc::new(RefCell::new(0));
        bus.add_stateful_listener(Counter {
            seen: Rc::clone(&seen),
        });
        bus.queue_all(1, vec![1, 2, 3]);
        bus.flush().unwrap();
        assert_eq!(*seen.borrow(), 3);
        bus.queue(2, 9);
        bus.handle().reset();
        assert!(bus.is_empty());
        assert_eq!(*seen.borrow(), 0);
    }

    #[test]
    fn test_listener_may_queue_on_its_own_bus() {
        let bus: Bus<u32> = Bus::new();
        let echo = bus.clone();
        bus.add_listener(move |time: Time, items: &[u32]| {
            if items[0] < 3 {
                echo.queue(time + 1, items[0] + 1);
            }
            Ok(())
        });
        let log = recorder(&bus);
        bus.queue(0, 0);
        bus.flush().unwrap();
        assert_eq!(log.borrow().len(), 4);
    }

    #[test]
    fn test_handles_compare_by_identity() {
        let a: Bus<u32> = Bus::new();
        let b: Bus<u32> = Bus::new();
        assert_eq!(a.handle(), a.clone().handle());
        assert_ne!(a.handle(), b.handle());
        assert!(a.ptr_eq(&a.clone()));
    }
}
