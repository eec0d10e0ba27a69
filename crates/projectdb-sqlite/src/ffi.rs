//! Thin helpers over the raw `libsqlite3-sys` bindings.
//!
//! Everything that has to turn engine pointers into Rust strings, or engine
//! result codes into messages, lives here so the rest of the crate keeps its
//! `unsafe` blocks short.

pub use libsqlite3_sys::{
    SQLITE_BLOB, SQLITE_BUSY, SQLITE_CANTOPEN, SQLITE_CHECKPOINT_PASSIVE, SQLITE_CONFIG_LOG,
    SQLITE_DONE, SQLITE_ERROR, SQLITE_FLOAT, SQLITE_FULL, SQLITE_INTEGER, SQLITE_LOCKED,
    SQLITE_MISUSE, SQLITE_NULL, SQLITE_OK, SQLITE_OPEN_CREATE, SQLITE_OPEN_FULLMUTEX,
    SQLITE_OPEN_READWRITE, SQLITE_PREPARE_PERSISTENT, SQLITE_ROW, SQLITE_TEXT, sqlite3,
    sqlite3_stmt,
};
pub use libsqlite3_sys::{
    sqlite3_bind_blob, sqlite3_bind_double, sqlite3_bind_int, sqlite3_bind_int64,
    sqlite3_bind_null, sqlite3_bind_parameter_count, sqlite3_bind_text, sqlite3_busy_timeout,
    sqlite3_changes, sqlite3_clear_bindings, sqlite3_close,
    sqlite3_column_blob, sqlite3_column_bytes, sqlite3_column_count, sqlite3_column_double,
    sqlite3_column_int64, sqlite3_column_name, sqlite3_column_text, sqlite3_column_type,
    sqlite3_config, sqlite3_db_filename, sqlite3_errcode, sqlite3_errmsg, sqlite3_errstr,
    sqlite3_exec, sqlite3_finalize, sqlite3_free, sqlite3_last_insert_rowid,
    sqlite3_libversion, sqlite3_libversion_number, sqlite3_next_stmt, sqlite3_open_v2,
    sqlite3_prepare_v3, sqlite3_reset, sqlite3_sql, sqlite3_step, sqlite3_wal_checkpoint_v2,
    sqlite3_wal_hook,
};

use projectdb_core::{Error, StatementError, StatementErrorKind};
use std::ffi::{CStr, CString, c_char, c_int};
use std::path::Path;

/// Flags used for both the primary and the checkpoint handle.
///
/// Serialized mode lets reader threads share the primary handle safely.
pub const OPEN_FLAGS: c_int = SQLITE_OPEN_READWRITE | SQLITE_OPEN_CREATE | SQLITE_OPEN_FULLMUTEX;

/// Get the SQLite library version as a string.
pub fn version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a static string
    unsafe {
        let ptr = sqlite3_libversion();
        CStr::from_ptr(ptr).to_str().unwrap_or("unknown")
    }
}

/// Get the SQLite library version as a number.
pub fn version_number() -> i32 {
    // SAFETY: sqlite3_libversion_number is always safe to call
    unsafe { sqlite3_libversion_number() }
}

/// Convert an SQLite result code to a human-readable string.
pub fn error_string(code: c_int) -> &'static str {
    // SAFETY: sqlite3_errstr returns a static string for any code
    unsafe {
        let ptr = sqlite3_errstr(code);
        if ptr.is_null() {
            return "unknown error";
        }
        CStr::from_ptr(ptr).to_str().unwrap_or("unknown error")
    }
}

/// Copy a possibly-null engine string.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string valid for the call.
pub unsafe fn text(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        // SAFETY: caller guarantees a valid NUL-terminated string
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }
}

/// Last error message and code reported on `db`.
///
/// # Safety
/// `db` must be a valid, open connection handle.
pub unsafe fn last_error(db: *mut sqlite3) -> (String, c_int) {
    // SAFETY: db is valid per the caller
    unsafe {
        let message = text(sqlite3_errmsg(db)).unwrap_or_default();
        (message, sqlite3_errcode(db))
    }
}

/// Convert SQL text for the engine.
pub fn sql_cstring(sql: &str) -> Result<CString, Error> {
    CString::new(sql).map_err(|_| {
        Error::Statement(StatementError {
            kind: StatementErrorKind::InvalidSql,
            sql: Some(sql.to_string()),
            message: "SQL contains null byte".to_string(),
            engine_code: None,
            source: None,
        })
    })
}

/// Convert a filesystem path for the engine.
pub fn path_cstring(path: &Path) -> Option<CString> {
    CString::new(path.to_string_lossy().as_bytes()).ok()
}

/// Run a batch of SQL on `db`, returning the engine message on failure.
///
/// # Safety
/// `db` must be a valid, open connection handle.
pub unsafe fn exec(db: *mut sqlite3, sql: &CStr) -> Result<(), (String, c_int)> {
    let mut errmsg: *mut c_char = std::ptr::null_mut();
    // SAFETY: db is valid per the caller, sql is NUL-terminated
    let rc = unsafe { sqlite3_exec(db, sql.as_ptr(), None, std::ptr::null_mut(), &raw mut errmsg) };
    if rc == SQLITE_OK {
        return Ok(());
    }
    let message = if errmsg.is_null() {
        error_string(rc).to_string()
    } else {
        // SAFETY: errmsg was allocated by sqlite3_exec and must be freed by us
        unsafe {
            let msg = text(errmsg).unwrap_or_default();
            sqlite3_free(errmsg.cast());
            msg
        }
    };
    Err((message, rc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let v = version();
        assert!(v.starts_with('3'));
        assert!(version_number() >= 3_000_000);
    }

    #[test]
    fn test_error_string() {
        assert_eq!(error_string(SQLITE_OK), "not an error");
        assert_eq!(error_string(SQLITE_BUSY), "database is locked");
        assert_eq!(error_string(SQLITE_FULL), "database or disk is full");
    }

    #[test]
    fn nul_in_sql_is_rejected() {
        let err = sql_cstring("SELECT 1\0; DROP TABLE t").unwrap_err();
        assert!(matches!(
            err,
            Error::Statement(StatementError {
                kind: StatementErrorKind::InvalidSql,
                ..
            })
        ));
    }
}
