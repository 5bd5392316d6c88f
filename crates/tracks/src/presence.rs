//! Presence traces: who is currently present.
//!
//! Events are parsed from `"<id>,in"`, `"<id>,out"` or `"<id>,<other>"`;
//! the state is the ordered set of ids that joined and have not left.

use crate::codec::{ByteBuffer, Input, Item};
use crate::error::{Result, TraceError};
use crate::store::{StatefulTraceKind, TraceKind};
use crate::trace::stateful::StateReducer;
use crate::Time;
use std::collections::BTreeSet;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

const JOIN: u8 = 0;
const LEAVE: u8 = 1;
const OTHER: u8 = 2;

/// What happened to an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PresenceAction {
    /// The id became present.
    Join,
    /// The id left.
    Leave,
    /// Anything else; does not change presence.
    Other(String),
}

/// One presence event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresenceEvent {
    /// Subject id.
    pub id: String,
    /// What happened.
    pub action: PresenceAction,
}

impl PresenceEvent {
    /// `id` joins.
    pub fn join(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: PresenceAction::Join,
        }
    }

    /// `id` leaves.
    pub fn leave(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: PresenceAction::Leave,
        }
    }
}

impl FromStr for PresenceEvent {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self> {
        let (id, action) = s
            .split_once(',')
            .ok_or_else(|| TraceError::CorruptData(format!("presence event {s:?} has no action")))?;
        let action = match action.trim() {
            "in" => PresenceAction::Join,
            "out" => PresenceAction::Leave,
            other => PresenceAction::Other(other.to_string()),
        };
        Ok(Self {
            id: id.trim().to_string(),
            action,
        })
    }
}

impl fmt::Display for PresenceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            PresenceAction::Join => write!(f, "{},in", self.id),
            PresenceAction::Leave => write!(f, "{},out", self.id),
            PresenceAction::Other(other) => write!(f, "{},{}", self.id, other),
        }
    }
}

impl Item for PresenceEvent {
    fn write(&self, buf: &mut ByteBuffer) -> Result<()> {
        buf.write_str(&self.id)?;
        match &self.action {
            PresenceAction::Join => buf.write_u8(JOIN),
            PresenceAction::Leave => buf.write_u8(LEAVE),
            PresenceAction::Other(other) => {
                buf.write_u8(OTHER)?;
                buf.write_str(other)
            }
        }
    }

    fn decode<R: Read>(input: &mut Input<R>) -> Result<Self> {
        let id = input.read_string()?;
        let action = match input.read_u8()? {
            JOIN => PresenceAction::Join,
            LEAVE => PresenceAction::Leave,
            OTHER => PresenceAction::Other(input.read_string()?),
            tag => {
                return Err(TraceError::CorruptData(format!(
                    "unknown presence action {tag}"
                )))
            }
        };
        Ok(Self { id, action })
    }
}

/// Ids currently present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceReducer {
    present: BTreeSet<String>,
}

impl PresenceReducer {
    /// Returns true if `id` is present.
    pub fn contains(&self, id: &str) -> bool {
        self.present.contains(id)
    }
}

impl StateReducer for PresenceReducer {
    type Event = PresenceEvent;
    type State = String;

    fn apply(&mut self, _time: Time, event: &PresenceEvent) {
        match event.action {
            PresenceAction::Join => {
                self.present.insert(event.id.clone());
            }
            PresenceAction::Leave => {
                self.present.remove(&event.id);
            }
            PresenceAction::Other(_) => {}
        }
    }

    fn reset(&mut self, states: &[String]) {
        self.present = states.iter().cloned().collect();
    }

    fn current(&self) -> Vec<String> {
        self.present.iter().cloned().collect()
    }
}

/// The presence trace kind.
#[derive(Debug)]
pub struct Presence;

impl TraceKind for Presence {
    const TAG: &'static str = "presence";
    const DEFAULT_PRIORITY: i32 = 10;
    type Event = PresenceEvent;
}

impl StatefulTraceKind for Presence {
    type State = String;
    type Reducer = PresenceReducer;

    fn reducer() -> PresenceReducer {
        PresenceReducer::default()
    }
}
