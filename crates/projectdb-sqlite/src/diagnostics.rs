//! Process-wide rolling diagnostic log.
//!
//! Collects the engine's own log stream (`SQLITE_CONFIG_LOG`) together with
//! the errors this crate records, so an error report can carry the lines that
//! led up to a failure.

use crate::ffi;
use std::collections::VecDeque;
use std::ffi::{c_char, c_int, c_void};
use std::sync::{Mutex, Once, OnceLock, PoisonError};

const CAPACITY: usize = 200;

fn buffer() -> &'static Mutex<VecDeque<String>> {
    static LOG: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();
    LOG.get_or_init(|| Mutex::new(VecDeque::with_capacity(CAPACITY)))
}

/// Append one line, evicting the oldest once full.
pub fn record(line: impl Into<String>) {
    let mut log = buffer().lock().unwrap_or_else(PoisonError::into_inner);
    if log.len() == CAPACITY {
        log.pop_front();
    }
    log.push_back(line.into());
}

/// The newest `lines` entries, oldest first, joined with newlines.
pub fn recent(lines: usize) -> String {
    let log = buffer().lock().unwrap_or_else(PoisonError::into_inner);
    let skip = log.len().saturating_sub(lines);
    log.iter()
        .skip(skip)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n")
}

unsafe extern "C" fn engine_log(_arg: *mut c_void, code: c_int, message: *const c_char) {
    // SAFETY: the engine passes a NUL-terminated message valid for this call
    let message = unsafe { ffi::text(message) }.unwrap_or_default();
    record(format!("sqlite({code}): {message}"));
}

/// Route the engine's log stream into the buffer.
///
/// The engine only accepts this before its first initialisation; later calls
/// report `SQLITE_MISUSE`, in which case only this crate's own records are kept.
pub fn install_engine_log() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let callback: unsafe extern "C" fn(*mut c_void, c_int, *const c_char) = engine_log;
        // SAFETY: SQLITE_CONFIG_LOG takes a callback and a user pointer
        let rc = unsafe {
            ffi::sqlite3_config(ffi::SQLITE_CONFIG_LOG, callback, std::ptr::null_mut::<c_void>())
        };
        if rc != ffi::SQLITE_OK {
            tracing::debug!(rc, "engine log hook not installed; engine already initialised");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_returns_newest_lines_in_order() {
        record("diag-test-a");
        record("diag-test-b");
        record("diag-test-c");
        let all = recent(CAPACITY);
        let a = all.find("diag-test-a").unwrap();
        let c = all.find("diag-test-c").unwrap();
        assert!(a < c);
        assert!(recent(0).is_empty());
    }
}
