//! Where the two coordination documents live.
//!
//! A backend hands out whole-document snapshots and runs read-modify-write
//! closures under its exclusive lock. Documents are only written back when
//! the closure succeeds and actually changed them.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Raw text of the task list and the session registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Documents {
    pub tasks: String,
    pub sessions: String,
}

pub trait Backend: Send + Sync {
    /// A consistent snapshot of both documents.
    fn read(&self) -> Result<Documents>;

    /// Run `f` against both documents while holding the write lock. On
    /// success the changed documents are persisted before the lock is
    /// released; on error nothing is written.
    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Documents) -> Result<T>;
}

/// In-process backend for tests and embedding. Clones share the same
/// documents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    docs: Arc<Mutex<Documents>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(tasks: impl Into<String>, sessions: impl Into<String>) -> Self {
        Self {
            docs: Arc::new(Mutex::new(Documents {
                tasks: tasks.into(),
                sessions: sessions.into(),
            })),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Documents>> {
        self.docs.lock().map_err(|_| Error::StoreUnavailable {
            context: "in-memory documents".into(),
            source: "mutex poisoned by a panicking writer".into(),
        })
    }
}

impl Backend for MemoryStore {
    fn read(&self) -> Result<Documents> {
        Ok(self.lock()?.clone())
    }

    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Documents) -> Result<T>,
    {
        let mut guard = self.lock()?;
        let mut working = guard.clone();
        let out = f(&mut working)?;
        if working != *guard {
            *guard = working;
        }
        Ok(out)
    }
}
