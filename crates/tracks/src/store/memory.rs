//! In-memory storage: shared byte buffers and a backend built on them.

use crate::error::{Result, TraceError};
use crate::store::backend::{validate_name, Backend, TraceFile};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::rc::Rc;

/// A growable byte buffer shared between writers and readers.
///
/// Readers see a snapshot of the contents at the time they were opened.
#[derive(Clone, Default)]
pub struct SharedBytes {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl SharedBytes {
    /// Returns a writer appending to the buffer.
    pub fn writer(&self) -> SharedWriter {
        SharedWriter {
            bytes: Rc::clone(&self.bytes),
        }
    }

    /// Returns a reader over the current contents.
    pub fn reader(&self) -> Cursor<Vec<u8>> {
        Cursor::new(self.to_vec())
    }

    /// Copies the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.borrow().clone()
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.borrow().len()
    }

    /// Returns true if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.bytes.borrow().is_empty()
    }

    /// Discards the contents.
    pub fn clear(&self) {
        self.bytes.borrow_mut().clear();
    }
}

impl From<Vec<u8>> for SharedBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Rc::new(RefCell::new(bytes)),
        }
    }
}

impl fmt::Debug for SharedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBytes").field("len", &self.len()).finish()
    }
}

/// Appending writer returned by [`SharedBytes::writer`].
pub struct SharedWriter {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MemTrace {
    meta: SharedBytes,
    trace: SharedBytes,
    index: SharedBytes,
}

impl MemTrace {
    fn file(&self, file: TraceFile) -> &SharedBytes {
        match file {
            TraceFile::Meta => &self.meta,
            TraceFile::Trace => &self.trace,
            TraceFile::Index => &self.index,
        }
    }
}

/// Backend keeping every trace in memory.
///
/// Clones share the same traces, so a backend can be seeded, handed to a
/// store and inspected afterwards.
#[derive(Clone, Default)]
pub struct MemBackend {
    traces: Rc<RefCell<BTreeMap<String, MemTrace>>>,
}

impl MemBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` as one file of trace `name`, creating the trace.
    pub fn insert(&self, name: &str, file: TraceFile, bytes: Vec<u8>) -> Result<()> {
        validate_name(name)?;
        let mut traces = self.traces.borrow_mut();
        let trace = traces.entry(name.to_string()).or_default();
        let target = trace.file(file);
        target.clear();
        target.writer().write_all(&bytes)?;
        Ok(())
    }

    /// Copies one file of trace `name`.
    pub fn contents(&self, name: &str, file: TraceFile) -> Option<Vec<u8>> {
        self.traces
            .borrow()
            .get(name)
            .map(|trace| trace.file(file).to_vec())
    }
}

impl fmt::Debug for MemBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBackend")
            .field("traces", &self.traces.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Backend for MemBackend {
    fn list(&self) -> Result<Vec<String>> {
        Ok(self.traces.borrow().keys().cloned().collect())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.traces.borrow().contains_key(name))
    }

    fn open_input(&self, name: &str, file: TraceFile) -> Result<Box<dyn Read>> {
        let traces = self.traces.borrow();
        let trace = traces
            .get(name)
            .ok_or_else(|| TraceError::NotFound(name.to_string()))?;
        Ok(Box::new(trace.file(file).reader()))
    }

    fn open_output(&self, name: &str, file: TraceFile) -> Result<Box<dyn Write>> {
        validate_name(name)?;
        let mut traces = self.traces.borrow_mut();
        let trace = traces.entry(name.to_string()).or_default();
        let target = trace.file(file);
        target.clear();
        Ok(Box::new(target.writer()))
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.traces
            .borrow_mut()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TraceError::NotFound(name.to_string()))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        validate_name(to)?;
        let mut traces = self.traces.borrow_mut();
        if traces.contains_key(to) {
            return Err(TraceError::InvalidConfig(format!("trace {to} already exists")));
        }
        let trace = traces
            .remove(from)
            .ok_or_else(|| TraceError::NotFound(from.to_string()))?;
        traces.insert(to.to_string(), trace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_is_a_snapshot() {
        let bytes = SharedBytes::default();
        let mut writer = bytes.writer();
        writer.write_all(b"abc").unwrap();
        let mut reader = bytes.reader();
        writer.write_all(b"def").unwrap();

        let mut seen = String::new();
        reader.read_to_string(&mut seen).unwrap();
        assert_eq!(seen, "abc");
        assert_eq!(bytes.len(), 6);
    }

    #[test]
    fn test_backend_files() {
        let backend = MemBackend::new();
        backend.open_output("a", TraceFile::Trace).unwrap().write_all(&[1, 2]).unwrap();
        backend.insert("a", TraceFile::Meta, b"type: x\n".to_vec()).unwrap();
        assert!(backend.exists("a").unwrap());
        assert_eq!(backend.contents("a", TraceFile::Trace), Some(vec![1, 2]));

        // Reopening for output truncates.
        backend.open_output("a", TraceFile::Trace).unwrap();
        assert_eq!(backend.contents("a", TraceFile::Trace), Some(vec![]));
        assert_eq!(backend.contents("a", TraceFile::Meta), Some(b"type: x\n".to_vec()));
    }

    #[test]
    fn test_backend_rename_and_delete() {
        let backend = MemBackend::new();
        backend.insert("a", TraceFile::Meta, Vec::new()).unwrap();
        backend.insert("b", TraceFile::Meta, Vec::new()).unwrap();
        assert!(backend.rename("a", "b").is_err());
        backend.rename("a", "c").unwrap();
        assert_eq!(backend.list().unwrap(), vec!["b".to_string(), "c".to_string()]);
        backend.delete("c").unwrap();
        assert!(backend.delete("c").unwrap_err().is_not_found());
        assert!(backend.open_input("c", TraceFile::Meta).err().unwrap().is_not_found());
    }
}
