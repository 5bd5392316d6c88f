//! Storage backends: where a trace's three files live.

use crate::error::{Result, TraceError};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Metadata document file name.
pub const META_FILE: &str = "info";
/// Block file name.
pub const TRACE_FILE: &str = "trace";
/// Seek index file name.
pub const INDEX_FILE: &str = "index";

/// One of the files making up a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceFile {
    /// Metadata document.
    Meta,
    /// Block stream.
    Trace,
    /// Seek index.
    Index,
}

impl TraceFile {
    /// File name inside a trace directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Meta => META_FILE,
            Self::Trace => TRACE_FILE,
            Self::Index => INDEX_FILE,
        }
    }
}

impl fmt::Display for TraceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Byte-stream access to named traces.
///
/// The engine never touches storage except through these calls.
pub trait Backend {
    /// Names of all traces, sorted.
    fn list(&self) -> Result<Vec<String>>;

    /// Returns true if the trace exists.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Opens one file of a trace for reading from its start.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::NotFound`] if the trace or file is missing.
    fn open_input(&self, name: &str, file: TraceFile) -> Result<Box<dyn Read>>;

    /// Opens one file of a trace for writing, creating the trace and
    /// truncating the file.
    fn open_output(&self, name: &str, file: TraceFile) -> Result<Box<dyn Write>>;

    /// Removes a trace with all its files.
    fn delete(&self, name: &str) -> Result<()>;

    /// Renames a trace. The target must not exist.
    fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Rejects names that cannot be used as a single path component.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(TraceError::InvalidConfig(format!("invalid trace name {name:?}")))
    }
}

/// Backend storing each trace as a directory holding `info`, `trace` and
/// `index`.
#[derive(Debug, Clone)]
pub struct DirBackend {
    root: PathBuf,
}

impl DirBackend {
    /// Opens (creating if needed) a store directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Store directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one trace.
    pub fn trace_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn not_found(name: &str, err: io::Error) -> TraceError {
        match err.kind() {
            io::ErrorKind::NotFound => TraceError::NotFound(name.to_string()),
            _ => err.into(),
        }
    }
}

impl Backend for DirBackend {
    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        Ok(self.trace_dir(name).is_dir())
    }

    fn open_input(&self, name: &str, file: TraceFile) -> Result<Box<dyn Read>> {
        validate_name(name)?;
        let path = self.trace_dir(name).join(file.file_name());
        let handle = File::open(&path).map_err(|e| Self::not_found(name, e))?;
        Ok(Box::new(BufReader::new(handle)))
    }

    fn open_output(&self, name: &str, file: TraceFile) -> Result<Box<dyn Write>> {
        validate_name(name)?;
        let dir = self.trace_dir(name);
        fs::create_dir_all(&dir)?;
        let path = dir.join(file.file_name());
        debug!("Opening {} for writing", path.display());
        Ok(Box::new(File::create(&path)?))
    }

    fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let dir = self.trace_dir(name);
        fs::remove_dir_all(&dir).map_err(|e| Self::not_found(name, e))?;
        debug!("Removed trace directory {}", dir.display());
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        validate_name(from)?;
        validate_name(to)?;
        let target = self.trace_dir(to);
        if target.exists() {
            return Err(TraceError::InvalidConfig(format!("trace {to} already exists")));
        }
        fs::rename(self.trace_dir(from), &target).map_err(|e| Self::not_found(from, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dir_layout() {
        let temp_dir = TempDir::new().unwrap();
        let backend = DirBackend::new(temp_dir.path()).unwrap();
        backend
            .open_output("walk", TraceFile::Meta)
            .unwrap()
            .write_all(b"type: presence\n")
            .unwrap();
        backend.open_output("walk", TraceFile::Trace).unwrap();
        assert!(temp_dir.path().join("walk").join("info").is_file());
        assert!(temp_dir.path().join("walk").join("trace").is_file());

        // Stray files next to trace directories are not traces.
        fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();
        assert_eq!(backend.list().unwrap(), vec!["walk".to_string()]);
        assert!(backend.exists("walk").unwrap());
    }

    #[test]
    fn test_missing_files_are_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let backend = DirBackend::new(temp_dir.path()).unwrap();
        let err = backend.open_input("nope", TraceFile::Index).err().unwrap();
        assert!(err.is_not_found());
        assert!(backend.delete("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_rename_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let backend = DirBackend::new(temp_dir.path()).unwrap();
        backend.open_output("a", TraceFile::Trace).unwrap();
        backend.open_output("b", TraceFile::Trace).unwrap();
        assert!(matches!(
            backend.rename("a", "b"),
            Err(TraceError::InvalidConfig(_))
        ));
        backend.rename("a", "c").unwrap();
        assert_eq!(backend.list().unwrap(), vec!["b".to_string(), "c".to_string()]);
        backend.delete("b").unwrap();
        assert!(!backend.exists("b").unwrap());
    }

    #[test]
    fn test_rejects_path_like_names() {
        for name in ["", ".", "..", "a/b", "a\\b"] {
            assert!(validate_name(name).is_err(), "{name:?}");
        }
        validate_name("walk-2").unwrap();
    }
}
