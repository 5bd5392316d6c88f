//! Named trace storage.
//!
//! A [`Store`] couples a [`Backend`] with a [`Registry`] of trace kinds. It
//! keeps a catalog of every discovered trace's metadata and a session table
//! of open readers and writers, which enforces a single writer per trace
//! and blocks deletion or renaming of traces in use.

pub mod backend;
pub mod memory;
pub mod registry;
pub mod session;

pub use backend::{Backend, DirBackend, TraceFile};
pub use memory::{MemBackend, SharedBytes};
pub use registry::{KindDescriptor, Registry, StatefulTraceKind, TraceKind};
pub use session::{SessionGuard, SessionInfo, SessionKind};

use crate::error::{Result, TraceError};
use crate::trace::index::SeekIndex;
use crate::trace::meta::TraceMeta;
use crate::trace::reader::TraceReader;
use crate::trace::stateful::{StatefulReader, StatefulWriter};
use crate::trace::writer::{TraceWriter, WriterConfig};
use session::Sessions;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, warn};

/// Suffix of the trace a writer fills until it is closed.
pub const STAGING_SUFFIX: &str = ".staging";

fn staging_name(name: &str) -> String {
    format!("{name}{STAGING_SUFFIX}")
}

pub(crate) struct StoreInner {
    backend: Rc<dyn Backend>,
    registry: Registry,
    pub(crate) catalog: RefCell<BTreeMap<String, TraceMeta>>,
    pub(crate) sessions: RefCell<Sessions>,
    closed: Cell<bool>,
}

/// A collection of named traces.
pub struct Store {
    inner: Rc<StoreInner>,
}

impl Store {
    /// Opens a store over `backend`, discovering its traces.
    ///
    /// Traces whose metadata cannot be loaded are logged and skipped.
    pub fn open<B: Backend + 'static>(backend: B, registry: Registry) -> Result<Self> {
        let store = Self {
            inner: Rc::new(StoreInner {
                backend: Rc::new(backend),
                registry,
                catalog: RefCell::new(BTreeMap::new()),
                sessions: RefCell::new(Sessions::default()),
                closed: Cell::new(false),
            }),
        };
        store.refresh()?;
        Ok(store)
    }

    /// Opens a directory store.
    pub fn open_dir(root: impl AsRef<Path>, registry: Registry) -> Result<Self> {
        Self::open(DirBackend::new(root)?, registry)
    }

    /// Opens an in-memory store.
    pub fn in_memory(registry: Registry) -> Result<Self> {
        Self::open(MemBackend::new(), registry)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.get() {
            Err(TraceError::Closed("store".to_string()))
        } else {
            Ok(())
        }
    }

    fn load_meta(&self, name: &str) -> Result<TraceMeta> {
        let mut input = self.inner.backend.open_input(name, TraceFile::Meta)?;
        let mut meta = TraceMeta::read_from(&mut input)?;
        if meta.trace_type.is_none() {
            return Err(TraceError::InvalidMeta(format!("trace {name} has no type")));
        }
        meta.name.get_or_insert_with(|| name.to_string());
        Ok(meta)
    }

    /// Rebuilds the catalog from the backend.
    pub fn refresh(&self) -> Result<()> {
        self.ensure_open()?;
        let mut catalog = BTreeMap::new();
        for name in self.inner.backend.list()? {
            if name.ends_with(STAGING_SUFFIX) {
                debug!("Ignoring staging trace {}", name);
                continue;
            }
            match self.load_meta(&name) {
                Ok(meta) => {
                    catalog.insert(name, meta);
                }
                Err(e) => {
                    warn!("Skipping trace {} due to metadata error: {:?}", name, e);
                }
            }
        }
        debug!("Discovered {} traces", catalog.len());
        *self.inner.catalog.borrow_mut() = catalog;
        Ok(())
    }

    /// The kind registry.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Names of catalogued traces.
    pub fn names(&self) -> Vec<String> {
        self.inner.catalog.borrow().keys().cloned().collect()
    }

    /// Returns true if the trace is catalogued.
    pub fn has_trace(&self, name: &str) -> bool {
        self.inner.catalog.borrow().contains_key(name)
    }

    /// Metadata of a catalogued trace.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::NotFound`] for unknown names.
    pub fn meta(&self, name: &str) -> Result<TraceMeta> {
        self.inner
            .catalog
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| TraceError::NotFound(name.to_string()))
    }

    /// Sessions that are currently open.
    pub fn open_sessions(&self) -> Vec<SessionInfo> {
        self.inner.sessions.borrow().live()
    }

    /// Returns true after [`Store::close`].
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    fn session(&self, name: &str, kind: SessionKind) -> Result<SessionGuard> {
        let id = self.inner.sessions.borrow_mut().acquire(name, kind)?;
        debug!("Opened {} session {} on {}", kind, id, name);
        Ok(SessionGuard::new(Rc::downgrade(&self.inner), id))
    }

    fn check_name(name: &str) -> Result<()> {
        backend::validate_name(name)?;
        if name.ends_with(STAGING_SUFFIX) {
            return Err(TraceError::InvalidConfig(format!(
                "trace name {name:?} uses the reserved suffix {STAGING_SUFFIX}"
            )));
        }
        Ok(())
    }

    fn descriptor(&self, tag: &str) -> Result<&KindDescriptor> {
        self.inner
            .registry
            .get(tag)
            .ok_or_else(|| TraceError::InvalidConfig(format!("trace kind {tag} is not registered")))
    }

    fn check_kind(&self, name: &str, meta: &TraceMeta, tag: &str) -> Result<()> {
        if meta.trace_type.as_deref() == Some(tag) {
            Ok(())
        } else {
            Err(TraceError::TypeMismatch {
                name: name.to_string(),
                expected: tag.to_string(),
                found: meta.trace_type.clone(),
            })
        }
    }

    fn new_writer<K: TraceKind>(&self, name: &str, config: WriterConfig) -> Result<TraceWriter<K::Event>> {
        self.ensure_open()?;
        let descriptor = self.descriptor(K::TAG)?;
        if config.index_interval == 0 {
            return Err(TraceError::InvalidConfig("index interval must be positive".into()));
        }
        Self::check_name(name)?;
        let staging = staging_name(name);
        let session = self
            .session(name, SessionKind::Writer)?
            .with_staging(staging.clone());
        let backend = &self.inner.backend;
        let mut writer = TraceWriter::new(
            backend.open_output(&staging, TraceFile::Trace)?,
            backend.open_output(&staging, TraceFile::Index)?,
            TraceMeta::new(name, K::TAG),
            config,
        )
        .with_meta_output(backend.open_output(&staging, TraceFile::Meta)?);
        writer.set_default_priority(descriptor.default_priority());
        writer.attach_session(session);
        Ok(writer)
    }

    /// Creates (or replaces) a plain trace.
    ///
    /// The writer fills a staging trace that replaces `name` and enters the
    /// catalog when the writer is closed. Dropping the writer unclosed
    /// discards the staging trace.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::WriterBusy`] if a writer is open on `name` and
    /// [`TraceError::TraceBusy`] if readers are.
    pub fn create_writer<K: TraceKind>(&self, name: &str, config: WriterConfig) -> Result<TraceWriter<K::Event>> {
        if self.descriptor(K::TAG)?.is_stateful() {
            return Err(TraceError::InvalidConfig(format!(
                "trace kind {} is stateful",
                K::TAG
            )));
        }
        self.new_writer::<K>(name, config)
    }

    /// Creates (or replaces) a stateful trace.
    pub fn create_stateful_writer<K: StatefulTraceKind>(
        &self,
        name: &str,
        config: WriterConfig,
    ) -> Result<StatefulWriter<K::Reducer>> {
        let reducer = self.reducer::<K>(name)?;
        let writer = self.new_writer::<K>(name, config)?;
        Ok(StatefulWriter::new(writer, reducer))
    }

    fn reducer<K: StatefulTraceKind>(&self, name: &str) -> Result<K::Reducer> {
        let mismatch = || TraceError::TypeMismatch {
            name: name.to_string(),
            expected: K::TAG.to_string(),
            found: Some(K::TAG.to_string()),
        };
        let reducer = self.descriptor(K::TAG)?.new_reducer().ok_or_else(mismatch)?;
        reducer
            .downcast::<K::Reducer>()
            .map(|reducer| *reducer)
            .map_err(|_| mismatch())
    }

    fn new_reader<K: TraceKind>(&self, name: &str) -> Result<TraceReader<K::Event>> {
        self.ensure_open()?;
        let meta = self.meta(name)?;
        self.check_kind(name, &meta, K::TAG)?;
        let session = self.session(name, SessionKind::Reader)?;

        let backend = Rc::clone(&self.inner.backend);
        let index = SeekIndex::load(backend.open_input(name, TraceFile::Index)?)?;
        let trace = name.to_string();
        let opener = Box::new(move || backend.open_input(&trace, TraceFile::Trace));
        let mut reader = TraceReader::new(opener, index, meta)?;
        reader.attach_session(session);
        Ok(reader)
    }

    /// Opens a reader on a plain (or stateful, events only) trace.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::NotFound`] for unknown names and
    /// [`TraceError::TypeMismatch`] if the trace is of another kind.
    pub fn open_reader<K: TraceKind>(&self, name: &str) -> Result<TraceReader<K::Event>> {
        self.new_reader::<K>(name)
    }

    /// Opens a snapshot-aware reader on a stateful trace.
    pub fn open_stateful_reader<K: StatefulTraceKind>(&self, name: &str) -> Result<StatefulReader<K::Reducer>> {
        let reader = self.new_reader::<K>(name)?;
        let reducer = self.reducer::<K>(name)?;
        Ok(StatefulReader::new(reader, reducer))
    }

    /// Deletes a trace.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::TraceBusy`] while sessions are open on it.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if self.inner.sessions.borrow().is_busy(name) {
            return Err(TraceError::TraceBusy(name.to_string()));
        }
        self.inner.backend.delete(name)?;
        self.inner.catalog.borrow_mut().remove(name);
        debug!("Deleted trace {}", name);
        Ok(())
    }

    /// Renames a trace, updating the name recorded in its metadata.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.ensure_open()?;
        Self::check_name(to)?;
        {
            let sessions = self.inner.sessions.borrow();
            if sessions.is_busy(from) {
                return Err(TraceError::TraceBusy(from.to_string()));
            }
            if sessions.is_busy(to) {
                return Err(TraceError::TraceBusy(to.to_string()));
            }
        }
        self.inner.backend.rename(from, to)?;
        let mut catalog = self.inner.catalog.borrow_mut();
        if let Some(mut meta) = catalog.remove(from) {
            meta.name = Some(to.to_string());
            meta.write_to(&mut self.inner.backend.open_output(to, TraceFile::Meta)?)?;
            catalog.insert(to.to_string(), meta);
        }
        debug!("Renamed trace {} to {}", from, to);
        Ok(())
    }

    /// Closes the store, revoking every open session.
    ///
    /// Revoked handles fail with [`TraceError::Closed`].
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        for session in self.inner.sessions.borrow_mut().revoke_all() {
            warn!(
                "Force-closing {} session {} on trace {}",
                session.kind, session.id, session.trace
            );
        }
        debug!("Closed store");
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("traces", &self.names())
            .field("sessions", &self.open_sessions().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{Presence, PresenceEvent};
    use std::io::Write;

    struct Numbers;

    impl TraceKind for Numbers {
        const TAG: &'static str = "numbers";
        type Event = i64;
    }

    fn store() -> (Store, MemBackend) {
        let backend = MemBackend::new();
        let mut registry = Registry::new();
        registry.register::<Numbers>().register_stateful::<Presence>();
        (Store::open(backend.clone(), registry).unwrap(), backend)
    }

    fn write_numbers(store: &Store, name: &str, times: &[i64]) {
        let mut writer = store.create_writer::<Numbers>(name, WriterConfig::default()).unwrap();
        for &t in times {
            writer.append(t, &t).unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_writer_close_catalogues_trace() {
        let (store, backend) = store();
        let writer = store.create_writer::<Numbers>("n", WriterConfig::default()).unwrap();
        assert!(!store.has_trace("n"));
        assert_eq!(store.open_sessions().len(), 1);
        drop(writer);
        assert!(store.open_sessions().is_empty());

        write_numbers(&store, "n", &[1, 2, 3]);
        let meta = store.meta("n").unwrap();
        assert_eq!(meta.time_bounds(), Some((1, 3)));
        assert_eq!(meta.trace_type.as_deref(), Some("numbers"));
        assert!(backend.contents("n", TraceFile::Meta).unwrap().starts_with(b"name: n"));
    }

    #[test]
    fn test_dropped_writer_keeps_previous_trace() {
        let (store, backend) = store();
        write_numbers(&store, "n", &[1, 2, 3]);

        let mut writer = store.create_writer::<Numbers>("n", WriterConfig::default()).unwrap();
        writer.append(4, &4).unwrap();
        assert!(backend.exists("n.staging").unwrap());
        drop(writer);

        assert!(!backend.exists("n.staging").unwrap());
        assert_eq!(store.meta("n").unwrap().time_bounds(), Some((1, 3)));
        let mut reader = store.open_reader::<Numbers>("n").unwrap();
        reader.seek(1).unwrap();
        assert_eq!(reader.next_batch().unwrap(), Some((1, vec![1])));
        drop(reader);
        store.refresh().unwrap();
        assert_eq!(store.names(), vec!["n".to_string()]);

        // A closed replacement takes over.
        write_numbers(&store, "n", &[7]);
        assert_eq!(store.meta("n").unwrap().time_bounds(), Some((7, 7)));
        assert_eq!(backend.list().unwrap(), vec!["n".to_string()]);
    }

    #[test]
    fn test_staging_names_are_reserved() {
        let (store, backend) = store();
        assert!(matches!(
            store.create_writer::<Numbers>("n.staging", WriterConfig::default()),
            Err(TraceError::InvalidConfig(_))
        ));
        write_numbers(&store, "n", &[1]);
        assert!(matches!(
            store.rename("n", "m.staging"),
            Err(TraceError::InvalidConfig(_))
        ));
        // Leftovers from an interrupted writer are not traces.
        backend
            .insert("m.staging", TraceFile::Meta, b"type: numbers\n".to_vec())
            .unwrap();
        store.refresh().unwrap();
        assert_eq!(store.names(), vec!["n".to_string()]);
    }

    #[test]
    fn test_single_writer_per_trace() {
        let (store, _) = store();
        let _writer = store.create_writer::<Numbers>("n", WriterConfig::default()).unwrap();
        let err = store.create_writer::<Numbers>("n", WriterConfig::default()).unwrap_err();
        assert!(matches!(err, TraceError::WriterBusy(name) if name == "n"));
        store.create_writer::<Numbers>("m", WriterConfig::default()).unwrap();
    }

    #[test]
    fn test_unknown_trace_is_not_found() {
        let (store, _) = store();
        assert!(store.meta("missing").unwrap_err().is_not_found());
        assert!(store.open_reader::<Numbers>("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_type_mismatch() {
        let (store, _) = store();
        write_numbers(&store, "n", &[1]);
        let err = store.open_stateful_reader::<Presence>("n").unwrap_err();
        assert!(matches!(
            err,
            TraceError::TypeMismatch { expected, found: Some(found), .. }
                if expected == "presence" && found == "numbers"
        ));
    }

    #[test]
    fn test_busy_trace_cannot_be_deleted_or_renamed() {
        let (store, _) = store();
        write_numbers(&store, "n", &[1, 2]);
        let reader = store.open_reader::<Numbers>("n").unwrap();
        assert!(matches!(store.delete("n"), Err(TraceError::TraceBusy(_))));
        assert!(matches!(store.rename("n", "x"), Err(TraceError::TraceBusy(_))));
        assert!(matches!(
            store.create_writer::<Numbers>("n", WriterConfig::default()),
            Err(TraceError::TraceBusy(_))
        ));
        drop(reader);

        store.rename("n", "x").unwrap();
        assert_eq!(store.names(), vec!["x".to_string()]);
        assert_eq!(store.meta("x").unwrap().name.as_deref(), Some("x"));
        store.delete("x").unwrap();
        assert!(store.names().is_empty());
    }

    #[test]
    fn test_discovery_skips_broken_traces() {
        let backend = MemBackend::new();
        backend.insert("bad", TraceFile::Meta, b"min_time: soon\n".to_vec()).unwrap();
        backend.insert("untyped", TraceFile::Meta, b"name: untyped\n".to_vec()).unwrap();
        backend
            .insert("good", TraceFile::Meta, b"type: numbers\n".to_vec())
            .unwrap();
        let store = Store::open(backend, Registry::new()).unwrap();
        assert_eq!(store.names(), vec!["good".to_string()]);
        assert_eq!(store.meta("good").unwrap().name.as_deref(), Some("good"));
    }

    #[test]
    fn test_close_revokes_open_handles() {
        let (store, _) = store();
        write_numbers(&store, "n", &[1, 2]);
        let mut reader = store.open_reader::<Numbers>("n").unwrap();
        let mut writer = store
            .create_stateful_writer::<Presence>("p", WriterConfig::default())
            .unwrap();
        assert_eq!(store.open_sessions().len(), 2);

        store.close();
        assert!(store.open_sessions().is_empty());
        assert!(matches!(reader.next_batch(), Err(TraceError::Closed(_))));
        let event = PresenceEvent::join("A");
        assert!(matches!(writer.append(0, &event), Err(TraceError::Closed(_))));
        assert!(matches!(
            store.open_reader::<Numbers>("n"),
            Err(TraceError::Closed(_))
        ));
    }

    #[test]
    fn test_reader_reads_what_was_written() {
        let (store, backend) = store();
        write_numbers(&store, "n", &[5, 6, 7]);
        let mut reader = store.open_reader::<Numbers>("n").unwrap();
        reader.seek(6).unwrap();
        assert_eq!(reader.next_batch().unwrap(), Some((6, vec![6])));

        // A second store over the same backend sees the persisted trace.
        let mut registry = Registry::new();
        registry.register::<Numbers>();
        let other = Store::open(backend.clone(), registry).unwrap();
        assert_eq!(other.meta("n").unwrap(), store.meta("n").unwrap());
        backend
            .open_output("junk", TraceFile::Trace)
            .unwrap()
            .write_all(b"x")
            .unwrap();
        other.refresh().unwrap();
        assert_eq!(other.names(), vec!["n".to_string()]);
    }
}
