//! Per-thread cache of compiled statements.
//!
//! The engine forbids using one compiled statement from two threads, so the
//! cache key is `(StatementId, ThreadId)`: every thread compiles its own copy
//! of a logical statement the first time it asks for it.
//!
//! Entries live until the connection closes, so every thread that ever
//! prepared a statement keeps its copies until then. Owners that run many
//! short-lived threads release them with `finalize_thread` once each thread
//! has finished.

use crate::ffi;
use projectdb_core::{Result, StatementId};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};
use std::thread::ThreadId;

/// A compiled statement owned by the cache.
struct RawStatement(NonNull<ffi::sqlite3_stmt>);

// SAFETY: the cache only moves the pointer between threads to finalize it;
// the statement itself is only stepped by the thread recorded in its key.
unsafe impl Send for RawStatement {}

/// Maps (statement, thread) to a compiled statement handle.
#[derive(Default)]
pub struct StatementCache {
    entries: Mutex<HashMap<(StatementId, ThreadId), RawStatement>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached statement for `(id, thread)`, compiling it on a miss.
    ///
    /// A failed compilation inserts nothing, so other threads and later
    /// attempts are unaffected.
    pub(crate) fn get_or_prepare(
        &self,
        id: StatementId,
        thread: ThreadId,
        compile: impl FnOnce() -> Result<NonNull<ffi::sqlite3_stmt>>,
    ) -> Result<NonNull<ffi::sqlite3_stmt>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&(id, thread)) {
            return Ok(existing.0);
        }
        let stmt = compile()?;
        entries.insert((id, thread), RawStatement(stmt));
        tracing::debug!(statement = %id, ?thread, "compiled statement");
        Ok(stmt)
    }

    /// Number of compiled statements held.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of statements compiled for `thread`.
    pub fn len_for_thread(&self, thread: ThreadId) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(_, owner)| *owner == thread)
            .count()
    }

    /// Finalize every cached statement; returns how many were released.
    pub(crate) fn finalize_all(&self) -> usize {
        let drained: Vec<_> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        finalize(drained)
    }

    /// Finalize the statements compiled for `thread`.
    pub(crate) fn finalize_thread(&self, thread: ThreadId) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<_> = entries.keys().filter(|(_, owner)| *owner == thread).copied().collect();
        let removed: Vec<_> = keys
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|stmt| (key, stmt)))
            .collect();
        drop(entries);
        finalize(removed)
    }
}

fn finalize(statements: Vec<((StatementId, ThreadId), RawStatement)>) -> usize {
    let count = statements.len();
    for ((id, _), stmt) in statements {
        // SAFETY: the statement came from sqlite3_prepare_v3 and is
        // finalized exactly once, here.
        let rc = unsafe { ffi::sqlite3_finalize(stmt.0.as_ptr()) };
        if rc != ffi::SQLITE_OK {
            // The rc repeats the statement's last step error; the handle is released anyway.
            tracing::debug!(statement = %id, rc, "finalize reported a prior error");
        }
    }
    count
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.len())
            .finish()
    }
}
