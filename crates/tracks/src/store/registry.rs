//! Explicit table of trace kinds known to a store.

use crate::codec::Item;
use crate::trace::meta::DEFAULT_PRIORITY;
use crate::trace::stateful::StateReducer;
use std::any::{self, Any};
use std::collections::BTreeMap;
use std::fmt;

/// A kind of trace: a type tag bound to an event type.
pub trait TraceKind: 'static {
    /// Tag persisted as the metadata `type`.
    const TAG: &'static str;
    /// Priority recorded for new traces of this kind.
    const DEFAULT_PRIORITY: i32 = DEFAULT_PRIORITY;
    /// Event type.
    type Event: Item;
}

/// A kind whose traces carry snapshots.
pub trait StatefulTraceKind: TraceKind {
    /// State element type.
    type State: Item;
    /// Reducer folding events into state.
    type Reducer: StateReducer<Event = Self::Event, State = Self::State> + 'static;

    /// Creates a reducer with an empty state.
    fn reducer() -> Self::Reducer;
}

type ReducerFactory = Box<dyn Fn() -> Box<dyn Any>>;

/// Registered facts about one kind.
pub struct KindDescriptor {
    tag: &'static str,
    event_type: &'static str,
    stateful: bool,
    default_priority: i32,
    reducer: Option<ReducerFactory>,
}

impl KindDescriptor {
    /// Type tag.
    pub fn tag(&self) -> &str {
        self.tag
    }

    /// Rust name of the event type.
    pub fn event_type(&self) -> &str {
        self.event_type
    }

    /// Returns true if traces of this kind carry snapshots.
    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    /// Priority for new traces of this kind.
    pub fn default_priority(&self) -> i32 {
        self.default_priority
    }

    /// Creates a fresh reducer for a stateful kind.
    pub fn new_reducer(&self) -> Option<Box<dyn Any>> {
        self.reducer.as_ref().map(|factory| factory())
    }
}

impl fmt::Debug for KindDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindDescriptor")
            .field("tag", &self.tag)
            .field("event_type", &self.event_type)
            .field("stateful", &self.stateful)
            .field("default_priority", &self.default_priority)
            .finish()
    }
}

/// Maps type tags to kinds. Populated once when the store is composed.
#[derive(Debug, Default)]
pub struct Registry {
    kinds: BTreeMap<&'static str, KindDescriptor>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plain kind. A later registration of the same tag wins.
    pub fn register<K: TraceKind>(&mut self) -> &mut Self {
        self.kinds.insert(
            K::TAG,
            KindDescriptor {
                tag: K::TAG,
                event_type: any::type_name::<K::Event>(),
                stateful: false,
                default_priority: K::DEFAULT_PRIORITY,
                reducer: None,
            },
        );
        self
    }

    /// Registers a stateful kind.
    pub fn register_stateful<K: StatefulTraceKind>(&mut self) -> &mut Self {
        self.kinds.insert(
            K::TAG,
            KindDescriptor {
                tag: K::TAG,
                event_type: any::type_name::<K::Event>(),
                stateful: true,
                default_priority: K::DEFAULT_PRIORITY,
                reducer: Some(Box::new(|| Box::new(K::reducer()) as Box<dyn Any>)),
            },
        );
        self
    }

    /// Looks up a tag.
    pub fn get(&self, tag: &str) -> Option<&KindDescriptor> {
        self.kinds.get(tag)
    }

    /// Returns true if the tag is registered.
    pub fn contains(&self, tag: &str) -> bool {
        self.kinds.contains_key(tag)
    }

    /// Registered tags in order.
    pub fn tags(&self) -> impl Iterator<Item = &str> + '_ {
        self.kinds.keys().copied()
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{Presence, PresenceReducer};

    struct Numbers;

    impl TraceKind for Numbers {
        const TAG: &'static str = "numbers";
        type Event = i64;
    }

    #[test]
    fn test_register_kinds() {
        let mut registry = Registry::new();
        registry.register::<Numbers>().register_stateful::<Presence>();
        assert_eq!(registry.tags().collect::<Vec<_>>(), vec!["numbers", "presence"]);

        let numbers = registry.get("numbers").unwrap();
        assert!(!numbers.is_stateful());
        assert_eq!(numbers.default_priority(), DEFAULT_PRIORITY);
        assert!(numbers.new_reducer().is_none());

        let presence = registry.get("presence").unwrap();
        assert!(presence.is_stateful());
        assert_eq!(presence.default_priority(), 10);
        let reducer = presence.new_reducer().unwrap();
        assert!(reducer.downcast::<PresenceReducer>().is_ok());
    }
}
