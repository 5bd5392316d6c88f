//! Trace metadata document, time units and id maps.
//!
//! Metadata is stored as plain text, one `key: value` per line:
//!
//! ```text
//! # written by alopex-tracks
//! name: campus
//! type: presence
//! time_unit: s
//! min_time: 0
//! max_time: 86400
//! max_update_interval: 60
//! default_priority: 10
//! ```
//!
//! Blank lines and lines starting with `#` or `;` are ignored. Keys that are
//! not recognised are preserved in [`TraceMeta::extra`].

use crate::error::{Result, TraceError};
use crate::Time;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// Metadata key for the trace name.
pub const NAME_KEY: &str = "name";
/// Metadata key for the type tag.
pub const TYPE_KEY: &str = "type";
/// Metadata key for the free-text description.
pub const DESCRIPTION_KEY: &str = "description";
/// Metadata key for the tick unit.
pub const TIME_UNIT_KEY: &str = "time_unit";
/// Metadata key for the first timestamp.
pub const MIN_TIME_KEY: &str = "min_time";
/// Metadata key for the last timestamp.
pub const MAX_TIME_KEY: &str = "max_time";
/// Metadata key for the largest gap between distinct timestamps.
pub const MAX_UPDATE_INTERVAL_KEY: &str = "max_update_interval";
/// Metadata key for the default scheduling priority.
pub const DEFAULT_PRIORITY_KEY: &str = "default_priority";
/// Metadata key for the id map string.
pub const ID_MAP_KEY: &str = "id_map";

/// Priority given to traces whose kind does not choose one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Unit of one tick of trace time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimeUnit {
    /// Seconds.
    #[default]
    Seconds,
    /// Milliseconds.
    Millis,
    /// Microseconds.
    Micros,
    /// Nanoseconds.
    Nanos,
}

impl TimeUnit {
    /// Number of ticks in one second.
    pub fn ticks_per_second(self) -> i64 {
        match self {
            Self::Seconds => 1,
            Self::Millis => 1_000,
            Self::Micros => 1_000_000,
            Self::Nanos => 1_000_000_000,
        }
    }

    /// Converts `time` expressed in `self` into `target` units.
    ///
    /// Converting to a coarser unit truncates toward negative infinity.
    pub fn convert(self, time: Time, target: TimeUnit) -> Time {
        let from = self.ticks_per_second();
        let to = target.ticks_per_second();
        if from == to {
            time
        } else if to > from {
            time.saturating_mul(to / from)
        } else {
            time.div_euclid(from / to)
        }
    }

    /// Short suffix used in metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seconds => "s",
            Self::Millis => "ms",
            Self::Micros => "us",
            Self::Nanos => "ns",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "s" => Ok(Self::Seconds),
            "ms" => Ok(Self::Millis),
            "us" => Ok(Self::Micros),
            "ns" => Ok(Self::Nanos),
            other => Err(TraceError::InvalidMeta(format!("unknown time unit {other:?}"))),
        }
    }
}

/// Bijection between internal integer ids and external names.
///
/// Persisted as space-separated `internal:external` pairs, e.g. `0:alice 1:bob`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    by_id: BTreeMap<i64, String>,
    by_name: BTreeMap<String, i64>,
}

impl IdMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::InvalidMeta`] if the id or the name is already
    /// mapped.
    pub fn insert(&mut self, id: i64, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.by_id.contains_key(&id) || self.by_name.contains_key(&name) {
            return Err(TraceError::InvalidMeta(format!(
                "duplicate id map entry {id}:{name}"
            )));
        }
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(TraceError::InvalidMeta(format!("invalid id name {name:?}")));
        }
        self.by_name.insert(name.clone(), id);
        self.by_id.insert(id, name);
        Ok(())
    }

    /// External name of an internal id.
    pub fn name(&self, id: i64) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Internal id of an external name.
    pub fn id(&self, name: &str) -> Option<i64> {
        self.by_name.get(name).copied()
    }

    /// Number of mappings.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (id, name) in &self.by_id {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{id}:{name}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for IdMap {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self> {
        let mut map = Self::new();
        for pair in s.split_whitespace() {
            let (id, name) = pair
                .split_once(':')
                .ok_or_else(|| TraceError::InvalidMeta(format!("bad id map entry {pair:?}")))?;
            let id = id
                .parse::<i64>()
                .map_err(|e| TraceError::InvalidMeta(format!("bad id in {pair:?}: {e}")))?;
            map.insert(id, name)?;
        }
        Ok(map)
    }
}

/// Persisted attributes of a trace.
///
/// Every field is optional: a writer fills the derived ones (time bounds,
/// update interval, priority) on close unless the caller set them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceMeta {
    /// Trace name.
    pub name: Option<String>,
    /// Type tag, resolved through the store registry.
    pub trace_type: Option<String>,
    /// Free-text description.
    pub description: Option<String>,
    /// Unit of one tick.
    pub time_unit: Option<TimeUnit>,
    /// First timestamp.
    pub min_time: Option<Time>,
    /// Last timestamp.
    pub max_time: Option<Time>,
    /// Largest gap between consecutive distinct timestamps.
    pub max_update_interval: Option<Time>,
    /// Scheduling priority; lower runs first at equal time.
    pub default_priority: Option<i32>,
    /// Mapping between internal ids and external names.
    pub id_map: Option<IdMap>,
    /// Unrecognised keys, kept verbatim.
    pub extra: BTreeMap<String, String>,
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| TraceError::InvalidMeta(format!("{key}: {value:?}: {e}")))
}

impl TraceMeta {
    /// Creates metadata with a name and type tag.
    pub fn new(name: impl Into<String>, trace_type: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            trace_type: Some(trace_type.into()),
            ..Self::default()
        }
    }

    /// Parses a metadata document.
    pub fn parse(text: &str) -> Result<Self> {
        let mut meta = Self::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                TraceError::InvalidMeta(format!("line {}: expected `key: value`", lineno + 1))
            })?;
            let key = key.trim();
            let value = value.trim();
            match key {
                NAME_KEY => meta.name = Some(value.to_string()),
                TYPE_KEY => meta.trace_type = Some(value.to_string()),
                DESCRIPTION_KEY => meta.description = Some(value.to_string()),
                TIME_UNIT_KEY => meta.time_unit = Some(value.parse()?),
                MIN_TIME_KEY => meta.min_time = Some(parse_num(key, value)?),
                MAX_TIME_KEY => meta.max_time = Some(parse_num(key, value)?),
                MAX_UPDATE_INTERVAL_KEY => meta.max_update_interval = Some(parse_num(key, value)?),
                DEFAULT_PRIORITY_KEY => meta.default_priority = Some(parse_num(key, value)?),
                ID_MAP_KEY => meta.id_map = Some(value.parse()?),
                _ => {
                    meta.extra.insert(key.to_string(), value.to_string());
                }
            }
        }
        Ok(meta)
    }

    /// Reads and parses a metadata document from a stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::InvalidData => {
                    TraceError::InvalidMeta("metadata is not UTF-8".to_string())
                }
                _ => e.into(),
            })?;
        Self::parse(&text)
    }

    /// Writes the metadata document.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(self.to_string().as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Fills unset fields from `derived`, keeping explicit values.
    pub fn merge_derived(&mut self, derived: &TraceMeta) {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(value);
            }
        }
        fill(&mut self.name, &derived.name);
        fill(&mut self.trace_type, &derived.trace_type);
        fill(&mut self.description, &derived.description);
        fill(&mut self.time_unit, &derived.time_unit);
        fill(&mut self.min_time, &derived.min_time);
        fill(&mut self.max_time, &derived.max_time);
        fill(&mut self.max_update_interval, &derived.max_update_interval);
        fill(&mut self.default_priority, &derived.default_priority);
        fill(&mut self.id_map, &derived.id_map);
        for (key, value) in &derived.extra {
            self.extra.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    /// Priority, falling back to [`DEFAULT_PRIORITY`].
    pub fn priority(&self) -> i32 {
        self.default_priority.unwrap_or(DEFAULT_PRIORITY)
    }

    /// Time bounds if both are known.
    pub fn time_bounds(&self) -> Option<(Time, Time)> {
        Some((self.min_time?, self.max_time?))
    }
}

impl fmt::Display for TraceMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn line<T: fmt::Display>(f: &mut fmt::Formatter<'_>, key: &str, value: &Option<T>) -> fmt::Result {
            match value {
                Some(v) => writeln!(f, "{key}: {v}"),
                None => Ok(()),
            }
        }
        line(f, NAME_KEY, &self.name)?;
        line(f, TYPE_KEY, &self.trace_type)?;
        line(f, DESCRIPTION_KEY, &self.description)?;
        line(f, TIME_UNIT_KEY, &self.time_unit)?;
        line(f, MIN_TIME_KEY, &self.min_time)?;
        line(f, MAX_TIME_KEY, &self.max_time)?;
        line(f, MAX_UPDATE_INTERVAL_KEY, &self.max_update_interval)?;
        line(f, DEFAULT_PRIORITY_KEY, &self.default_priority)?;
        line(f, ID_MAP_KEY, &self.id_map)?;
        for (key, value) in &self.extra {
            writeln!(f, "{key}: {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_comments() {
        let text = "\
# header comment
; another comment

name: campus
type : presence
time_unit: ms
min_time: -5
max_time: 120
max_update_interval: 30
default_priority: 10
id_map: 0:alice 1:bob
source: crawdad
";
        let meta = TraceMeta::parse(text).unwrap();
        assert_eq!(meta.name.as_deref(), Some("campus"));
        assert_eq!(meta.trace_type.as_deref(), Some("presence"));
        assert_eq!(meta.time_unit, Some(TimeUnit::Millis));
        assert_eq!(meta.time_bounds(), Some((-5, 120)));
        assert_eq!(meta.max_update_interval, Some(30));
        assert_eq!(meta.priority(), 10);
        let ids = meta.id_map.as_ref().unwrap();
        assert_eq!(ids.name(1), Some("bob"));
        assert_eq!(ids.id("alice"), Some(0));
        assert_eq!(meta.extra.get("source").map(String::as_str), Some("crawdad"));
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let mut meta = TraceMeta::new("links", "edges");
        meta.description = Some("bluetooth: class 2".to_string());
        meta.time_unit = Some(TimeUnit::Seconds);
        meta.min_time = Some(0);
        meta.max_time = Some(99);
        meta.extra.insert("origin".to_string(), "ns2".to_string());
        let parsed = TraceMeta::parse(&meta.to_string()).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_invalid_lines() {
        assert!(matches!(
            TraceMeta::parse("just text"),
            Err(TraceError::InvalidMeta(_))
        ));
        assert!(matches!(
            TraceMeta::parse("min_time: soon"),
            Err(TraceError::InvalidMeta(_))
        ));
        assert!(matches!(
            TraceMeta::parse("time_unit: fortnight"),
            Err(TraceError::InvalidMeta(_))
        ));
    }

    #[test]
    fn test_merge_keeps_explicit_values() {
        let mut meta = TraceMeta::new("a", "presence");
        meta.max_time = Some(500);
        let derived = TraceMeta {
            min_time: Some(0),
            max_time: Some(12),
            default_priority: Some(10),
            ..TraceMeta::default()
        };
        meta.merge_derived(&derived);
        assert_eq!(meta.time_bounds(), Some((0, 500)));
        assert_eq!(meta.default_priority, Some(10));
    }

    #[test]
    fn test_time_unit_conversion() {
        assert_eq!(TimeUnit::Seconds.convert(3, TimeUnit::Millis), 3_000);
        assert_eq!(TimeUnit::Millis.convert(3_999, TimeUnit::Seconds), 3);
        assert_eq!(TimeUnit::Millis.convert(-1, TimeUnit::Seconds), -1);
        assert_eq!(TimeUnit::Nanos.ticks_per_second(), 1_000_000_000);
        assert_eq!("us".parse::<TimeUnit>().unwrap(), TimeUnit::Micros);
    }

    #[test]
    fn test_id_map_rejects_duplicates() {
        assert!("0:a 0:b".parse::<IdMap>().is_err());
        assert!("0:a 1:a".parse::<IdMap>().is_err());
        assert!("x:a".parse::<IdMap>().is_err());
        let map: IdMap = "2:c 1:b".parse().unwrap();
        assert_eq!(map.to_string(), "1:b 2:c");
        assert_eq!(map.len(), 2);
    }
}
