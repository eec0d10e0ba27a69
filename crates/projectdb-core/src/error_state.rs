//! Shared record of the most recent connection failure.
//!
//! One [`ErrorState`] is shared (via `Arc`) by every view of a connection,
//! including the checkpoint worker, so whichever thread fails last is what
//! diagnostics report. The record may outlive the connection that produced it.

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

/// A point-in-time copy of the error record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorSnapshot {
    /// Human-readable description of what failed
    pub message: String,
    /// Text reported by the engine, empty when none was available
    pub engine_message: String,
    /// Engine result code, if the failure came from the engine
    pub engine_code: Option<i32>,
    /// Recent diagnostic log lines captured at the time of the failure
    pub log: String,
}

impl ErrorSnapshot {
    /// True when no failure has been recorded.
    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.engine_code.is_none()
    }
}

/// Thread-safe holder of the last failure.
#[derive(Debug, Default)]
pub struct ErrorState {
    inner: Mutex<ErrorSnapshot>,
}

/// Reference-counted handle shared between a connection and its observers.
pub type SharedErrorState = Arc<ErrorState>;

impl ErrorState {
    /// Create an empty, shareable error record.
    pub fn shared() -> SharedErrorState {
        Arc::new(Self::default())
    }

    /// Replace the whole record atomically.
    pub fn set(
        &self,
        message: impl Into<String>,
        engine_message: impl Into<String>,
        engine_code: Option<i32>,
        log: impl Into<String>,
    ) {
        let snapshot = ErrorSnapshot {
            message: message.into(),
            engine_message: engine_message.into(),
            engine_code,
            log: log.into(),
        };
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Copy out the current record.
    pub fn snapshot(&self) -> ErrorSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn message(&self) -> String {
        self.snapshot().message
    }

    pub fn engine_message(&self) -> String {
        self.snapshot().engine_message
    }

    pub fn engine_code(&self) -> Option<i32> {
        self.snapshot().engine_code
    }

    pub fn log(&self) -> String {
        self.snapshot().log
    }

    /// Forget the recorded failure.
    pub fn clear(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = ErrorSnapshot::default();
    }

    /// Render the record as JSON for diagnostic dumps.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn set_replaces_every_field() {
        let state = ErrorState::shared();
        assert!(state.snapshot().is_empty());

        state.set("Failed to open", "unable to open database file", Some(14), "");
        state.set("Failed to prepare", "", None, "line");

        let snap = state.snapshot();
        assert_eq!(snap.message, "Failed to prepare");
        assert_eq!(snap.engine_message, "");
        assert_eq!(snap.engine_code, None);
        assert_eq!(snap.log, "line");
    }

    #[test]
    fn writes_from_another_thread_are_visible() {
        let state = ErrorState::shared();
        let worker = Arc::clone(&state);
        thread::spawn(move || worker.set("checkpoint failed", "disk is full", Some(13), ""))
            .join()
            .unwrap();

        assert_eq!(state.message(), "checkpoint failed");
        assert_eq!(state.engine_code(), Some(13));
    }

    #[test]
    fn json_dump_and_clear() {
        let state = ErrorState::default();
        state.set("boom", "SQL logic error", Some(1), "");
        let json: serde_json::Value = serde_json::from_str(&state.to_json()).unwrap();
        assert_eq!(json["engine_code"], 1);
        assert_eq!(json["engine_message"], "SQL logic error");

        state.clear();
        assert!(state.snapshot().is_empty());
    }
}
