//! Borrowed access to compiled statements.

use crate::connection::Connection;
use crate::ffi;
use crate::types::{bind_value, column_name, read_column};
use projectdb_core::{ColumnInfo, Result, Row, StatementErrorKind, StatementId, Value};
use std::ffi::c_int;
use std::ptr::NonNull;
use std::sync::Arc;

/// A cached statement checked out by the current thread.
///
/// The handle stays owned by the connection's cache; this borrow only
/// resets, binds and steps it. It cannot leave the thread that prepared it.
pub struct CachedStatement<'conn> {
    conn: &'conn Connection,
    id: StatementId,
    stmt: NonNull<ffi::sqlite3_stmt>,
}

impl<'conn> CachedStatement<'conn> {
    pub(crate) fn new(conn: &'conn Connection, id: StatementId, stmt: NonNull<ffi::sqlite3_stmt>) -> Self {
        Self { conn, id, stmt }
    }

    pub fn id(&self) -> StatementId {
        self.id
    }

    /// Raw handle, for callers that step the statement themselves.
    pub fn as_ptr(&self) -> *mut ffi::sqlite3_stmt {
        self.stmt.as_ptr()
    }

    /// SQL text the statement was compiled from.
    pub fn sql(&self) -> Option<String> {
        // SAFETY: stmt is a live statement owned by the cache
        unsafe { ffi::text(ffi::sqlite3_sql(self.stmt.as_ptr())) }
    }

    /// Rewind the statement and clear its bindings.
    pub fn reset(&self) {
        // SAFETY: stmt is a live statement owned by the cache
        unsafe {
            ffi::sqlite3_reset(self.stmt.as_ptr());
            ffi::sqlite3_clear_bindings(self.stmt.as_ptr());
        }
    }

    /// Bind one parameter (1-based).
    pub fn bind(&self, index: usize, value: &Value) -> Result<()> {
        bind_one(self.conn, self.stmt.as_ptr(), index, value)
    }

    /// Reset, then bind `params` to positions 1..=n.
    pub fn bind_all(&self, params: &[Value]) -> Result<()> {
        self.reset();
        bind_params(self.conn, self.stmt.as_ptr(), params)
    }

    /// Run to completion; returns the number of rows changed.
    #[tracing::instrument(level = "trace", skip(self, params), fields(statement = %self.id))]
    pub fn execute(&self, params: &[Value]) -> Result<u64> {
        self.bind_all(params)?;
        let result = run_to_completion(self.conn, self.stmt.as_ptr());
        self.reset();
        result
    }

    /// Run and collect every result row.
    #[tracing::instrument(level = "trace", skip(self, params), fields(statement = %self.id))]
    pub fn query(&self, params: &[Value]) -> Result<Vec<Row>> {
        self.bind_all(params)?;
        let result = collect_rows(self.conn, self.stmt.as_ptr(), None);
        self.reset();
        result
    }

    /// Run and return the first row, if any.
    pub fn query_row(&self, params: &[Value]) -> Result<Option<Row>> {
        self.bind_all(params)?;
        let result = collect_rows(self.conn, self.stmt.as_ptr(), Some(1));
        self.reset();
        result.map(|rows| rows.into_iter().next())
    }
}

impl std::fmt::Debug for CachedStatement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStatement")
            .field("id", &self.id)
            .field("thread", &std::thread::current().id())
            .finish_non_exhaustive()
    }
}

fn bind_one(conn: &Connection, stmt: *mut ffi::sqlite3_stmt, index: usize, value: &Value) -> Result<()> {
    let Ok(position) = c_int::try_from(index) else {
        return Err(conn.statement_error(
            StatementErrorKind::Bind,
            None,
            format!("Parameter index {index} out of range"),
        ));
    };
    // SAFETY: stmt is live; the engine range-checks the index
    let rc = unsafe { bind_value(stmt, position, value) };
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(conn.statement_error(
            StatementErrorKind::Bind,
            None,
            format!("Failed to bind parameter {index}"),
        ))
    }
}

pub(crate) fn bind_params(conn: &Connection, stmt: *mut ffi::sqlite3_stmt, params: &[Value]) -> Result<()> {
    // SAFETY: stmt is live
    let expected = unsafe { ffi::sqlite3_bind_parameter_count(stmt) } as usize;
    if params.len() > expected {
        return Err(conn.statement_error(
            StatementErrorKind::Bind,
            None,
            format!("Expected at most {expected} parameters, got {}", params.len()),
        ));
    }
    for (i, value) in params.iter().enumerate() {
        bind_one(conn, stmt, i + 1, value)?;
    }
    Ok(())
}

/// Step until done, ignoring any rows.
pub(crate) fn run_to_completion(conn: &Connection, stmt: *mut ffi::sqlite3_stmt) -> Result<u64> {
    loop {
        // SAFETY: stmt is live and bound
        match unsafe { ffi::sqlite3_step(stmt) } {
            ffi::SQLITE_ROW => {}
            ffi::SQLITE_DONE => return Ok(conn.changes()),
            _ => return Err(conn.statement_error(StatementErrorKind::Step, sql_of(stmt), "Failed to execute statement")),
        }
    }
}

/// Step and convert rows, stopping after `limit` rows when given.
pub(crate) fn collect_rows(conn: &Connection, stmt: *mut ffi::sqlite3_stmt, limit: Option<usize>) -> Result<Vec<Row>> {
    // SAFETY: stmt is live
    let count = unsafe { ffi::sqlite3_column_count(stmt) };
    let names = (0..count)
        // SAFETY: i is within the column count
        .map(|i| unsafe { column_name(stmt, i) }.unwrap_or_else(|| format!("column{i}")))
        .collect();
    let columns = Arc::new(ColumnInfo::new(names));

    let mut rows = Vec::new();
    loop {
        if limit.is_some_and(|max| rows.len() >= max) {
            return Ok(rows);
        }
        // SAFETY: stmt is live and bound
        match unsafe { ffi::sqlite3_step(stmt) } {
            ffi::SQLITE_ROW => {
                // SAFETY: stmt is positioned on a row; i is within the column count
                let values = (0..count).map(|i| unsafe { read_column(stmt, i) }).collect();
                rows.push(Row::with_columns(Arc::clone(&columns), values));
            }
            ffi::SQLITE_DONE => return Ok(rows),
            _ => return Err(conn.statement_error(StatementErrorKind::Step, sql_of(stmt), "Failed to run query")),
        }
    }
}

fn sql_of(stmt: *mut ffi::sqlite3_stmt) -> Option<String> {
    // SAFETY: stmt is live
    unsafe { ffi::text(ffi::sqlite3_sql(stmt)) }
}
