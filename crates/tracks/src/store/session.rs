//! Open-handle bookkeeping for a store.

use crate::error::{Result, TraceError};
use crate::store::StoreInner;
use crate::trace::meta::TraceMeta;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Weak;
use tracing::{debug, warn};

/// Kind of open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// A reader.
    Reader,
    /// A writer; at most one per trace.
    Writer,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader => f.write_str("reader"),
            Self::Writer => f.write_str("writer"),
        }
    }
}

/// Public view of an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session id, unique within the store.
    pub id: u64,
    /// Trace the handle is open on.
    pub trace: String,
    /// Reader or writer.
    pub kind: SessionKind,
}

#[derive(Debug)]
struct Entry {
    trace: String,
    kind: SessionKind,
    revoked: bool,
}

/// Session table owned by the store.
#[derive(Debug, Default)]
pub(crate) struct Sessions {
    next_id: u64,
    open: BTreeMap<u64, Entry>,
}

impl Sessions {
    /// Records a new session after checking for conflicts.
    pub(crate) fn acquire(&mut self, trace: &str, kind: SessionKind) -> Result<u64> {
        for entry in self.open.values().filter(|e| !e.revoked && e.trace == trace) {
            match (entry.kind, kind) {
                (SessionKind::Writer, _) => return Err(TraceError::WriterBusy(trace.to_string())),
                (SessionKind::Reader, SessionKind::Writer) => {
                    return Err(TraceError::TraceBusy(trace.to_string()))
                }
                (SessionKind::Reader, SessionKind::Reader) => {}
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.open.insert(
            id,
            Entry {
                trace: trace.to_string(),
                kind,
                revoked: false,
            },
        );
        Ok(id)
    }

    pub(crate) fn release(&mut self, id: u64) -> Option<SessionInfo> {
        self.open.remove(&id).map(|entry| SessionInfo {
            id,
            trace: entry.trace,
            kind: entry.kind,
        })
    }

    /// Returns true if any live session is open on `trace`.
    pub(crate) fn is_busy(&self, trace: &str) -> bool {
        self.open.values().any(|e| !e.revoked && e.trace == trace)
    }

    pub(crate) fn live(&self) -> Vec<SessionInfo> {
        self.open
            .iter()
            .filter(|(_, e)| !e.revoked)
            .map(|(&id, e)| SessionInfo {
                id,
                trace: e.trace.clone(),
                kind: e.kind,
            })
            .collect()
    }

    /// Revokes every live session and returns what was revoked.
    pub(crate) fn revoke_all(&mut self) -> Vec<SessionInfo> {
        let revoked = self.live();
        for entry in self.open.values_mut() {
            entry.revoked = true;
        }
        revoked
    }

    fn check(&self, id: u64) -> Result<()> {
        match self.open.get(&id) {
            Some(entry) if !entry.revoked => Ok(()),
            Some(entry) => Err(TraceError::Closed(entry.trace.clone())),
            None => Err(TraceError::Closed(format!("session {id}"))),
        }
    }

    fn trace(&self, id: u64) -> Option<&str> {
        self.open.get(&id).map(|e| e.trace.as_str())
    }
}

/// Ties a reader or writer to its store session.
///
/// Dropping the guard releases the session. A writer guard also owns the
/// staging trace the writer fills; dropping it before
/// [`SessionGuard::commit_writer`] discards the staging trace and leaves the
/// published trace untouched.
pub struct SessionGuard {
    store: Weak<StoreInner>,
    id: u64,
    staging: Option<String>,
}

impl SessionGuard {
    pub(crate) fn new(store: Weak<StoreInner>, id: u64) -> Self {
        Self {
            store,
            id,
            staging: None,
        }
    }

    pub(crate) fn with_staging(mut self, staging: String) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fails with [`TraceError::Closed`] once the store revoked the session
    /// or was dropped.
    pub fn ensure_active(&self) -> Result<()> {
        match self.store.upgrade() {
            Some(store) => store.sessions.borrow().check(self.id),
            None => Err(TraceError::Closed(format!("session {} (store dropped)", self.id))),
        }
    }

    /// Replaces the published trace with the staging trace and catalogues
    /// the writer's final metadata.
    pub(crate) fn commit_writer(&mut self, meta: &TraceMeta) -> Result<()> {
        self.ensure_active()?;
        let Some(store) = self.store.upgrade() else {
            return Err(TraceError::Closed(format!("session {} (store dropped)", self.id)));
        };
        let Some(trace) = store.sessions.borrow().trace(self.id).map(str::to_string) else {
            return Err(TraceError::Closed(format!("session {}", self.id)));
        };
        if let Some(staging) = &self.staging {
            if store.backend.exists(&trace)? {
                store.backend.delete(&trace)?;
            }
            store.backend.rename(staging, &trace)?;
            debug!("Published staging trace {} as {}", staging, trace);
        }
        self.staging = None;
        debug!("Cataloguing closed trace {}", trace);
        store.catalog.borrow_mut().insert(trace, meta.clone());
        Ok(())
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        if let Some(staging) = self.staging.take() {
            match store.backend.delete(&staging) {
                Ok(()) => debug!("Discarded unfinished staging trace {}", staging),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Failed to discard staging trace {}: {:?}", staging, e),
            }
        }
        let released = store.sessions.borrow_mut().release(self.id);
        if let Some(info) = released {
            debug!("Released {} session {} on {}", info.kind, info.id, info.trace);
        }
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("id", &self.id)
            .field("staging", &self.staging)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflicts() {
        let mut sessions = Sessions::default();
        let r1 = sessions.acquire("a", SessionKind::Reader).unwrap();
        sessions.acquire("a", SessionKind::Reader).unwrap();
        assert!(matches!(
            sessions.acquire("a", SessionKind::Writer),
            Err(TraceError::TraceBusy(_))
        ));
        let w = sessions.acquire("b", SessionKind::Writer).unwrap();
        assert!(matches!(
            sessions.acquire("b", SessionKind::Writer),
            Err(TraceError::WriterBusy(_))
        ));
        assert!(matches!(
            sessions.acquire("b", SessionKind::Reader),
            Err(TraceError::WriterBusy(_))
        ));
        assert!(sessions.is_busy("a"));
        sessions.release(w);
        assert!(!sessions.is_busy("b"));
        assert!(sessions.check(r1).is_ok());
    }

    #[test]
    fn test_revoked_sessions_stop_conflicting() {
        let mut sessions = Sessions::default();
        let id = sessions.acquire("a", SessionKind::Writer).unwrap();
        assert_eq!(sessions.revoke_all().len(), 1);
        assert!(matches!(sessions.check(id), Err(TraceError::Closed(_))));
        assert!(sessions.live().is_empty());
        assert!(!sessions.is_busy("a"));
    }
}
