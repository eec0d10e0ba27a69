//! The project database connection.
//!
//! A `Connection` owns one primary engine handle, the per-thread statement
//! cache built on it, and the checkpoint worker that keeps the write-ahead log
//! short. It is `Sync`: reader threads may prepare and step their own cached
//! statements while the owning thread commits. Closing needs `&mut self`, so
//! no borrowed statement or transaction scope can outlive the handle.

use crate::cache::StatementCache;
use crate::checkpoint::{
    CheckpointCoordinator, CheckpointFailureCallback, CheckpointPhase, CheckpointStats,
    FailureNotifier, WalCheckpointer, wal_commit_hook,
};
use crate::statement::{CachedStatement, bind_params, collect_rows, run_to_completion};
use crate::{diagnostics, ffi};
use projectdb_core::{
    ConnectionConfig, Error, ErrorSnapshot, ErrorState, FatalConsistencyError, FatalKind, Mode,
    OpenError, OpenErrorKind, Project, Result, Row, SharedErrorState, StatementError,
    StatementErrorKind, StatementId, Value,
};
use std::ffi::{CStr, c_int, c_uint};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Whether `open` created the file or found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStatus {
    Created,
    Existing,
}

/// An owned primary engine handle, closed on drop.
///
/// Moves between connections through `detach_native_handle` and
/// `assign_native_handle`.
pub struct NativeHandle {
    db: NonNull<ffi::sqlite3>,
}

// SAFETY: handles are opened with SQLITE_OPEN_FULLMUTEX, so the engine
// serializes every call made through them.
unsafe impl Send for NativeHandle {}
// SAFETY: see above
unsafe impl Sync for NativeHandle {}

impl NativeHandle {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout_ms: u32) -> Result<Self> {
        let path = path.as_ref();
        let Some(c_path) = ffi::path_cstring(path) else {
            return Err(Error::Open(OpenError {
                kind: OpenErrorKind::InvalidPath,
                path: Some(path.display().to_string()),
                message: "Database path contains a null byte".to_string(),
                engine_code: None,
                source: None,
            }));
        };
        open_raw(&c_path, busy_timeout_ms)
            .map(|db| Self { db })
            .map_err(|(message, code)| {
                Error::Open(OpenError {
                    kind: OpenErrorKind::CannotOpen,
                    path: Some(path.display().to_string()),
                    message: format!("Failed to open database: {message}"),
                    engine_code: Some(code),
                    source: None,
                })
            })
    }

    /// Adopt a raw handle.
    ///
    /// # Safety
    /// `db` must be null or an open handle that nothing else will close.
    pub unsafe fn from_raw(db: *mut ffi::sqlite3) -> Option<Self> {
        NonNull::new(db).map(|db| Self { db })
    }

    pub fn as_ptr(&self) -> *mut ffi::sqlite3 {
        self.db.as_ptr()
    }

    /// Give up ownership without closing.
    pub fn into_raw(self) -> *mut ffi::sqlite3 {
        let db = self.db.as_ptr();
        std::mem::forget(self);
        db
    }

    /// File behind the main schema; `None` for in-memory and temporary databases.
    pub fn filename(&self) -> Option<PathBuf> {
        // SAFETY: db is open; the returned string lives as long as the handle
        let name = unsafe { ffi::text(ffi::sqlite3_db_filename(self.db.as_ptr(), c"main".as_ptr())) }?;
        if name.is_empty() {
            None
        } else {
            Some(PathBuf::from(name))
        }
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        let db = self.db.as_ptr();
        // SAFETY: we own the handle and nothing can use it after drop
        unsafe {
            if ffi::sqlite3_close(db) == ffi::SQLITE_OK {
                return;
            }
            for sql in finalize_leftovers(db) {
                tracing::warn!(sql = %sql, "statement finalized when its handle was dropped");
            }
            ffi::sqlite3_close(db);
        }
    }
}

impl std::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("filename", &self.filename())
            .finish()
    }
}

/// Finalize every statement still compiled on `db`; returns their SQL.
///
/// # Safety
/// `db` must be open, and none of its statements may be used afterwards.
unsafe fn finalize_leftovers(db: *mut ffi::sqlite3) -> Vec<String> {
    let mut leftovers = Vec::new();
    loop {
        // SAFETY: db is open; finalize unlinks the statement, so always restart from the head
        let stmt = unsafe { ffi::sqlite3_next_stmt(db, ptr::null_mut()) };
        if stmt.is_null() {
            return leftovers;
        }
        // SAFETY: stmt is live until finalized here
        unsafe {
            leftovers.push(ffi::text(ffi::sqlite3_sql(stmt)).unwrap_or_default());
            ffi::sqlite3_finalize(stmt);
        }
    }
}

fn open_raw(c_path: &CStr, busy_timeout_ms: u32) -> std::result::Result<NonNull<ffi::sqlite3>, (String, c_int)> {
    let mut db: *mut ffi::sqlite3 = ptr::null_mut();
    // SAFETY: valid pointers; the return value is checked below
    let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &raw mut db, ffi::OPEN_FLAGS, ptr::null()) };
    if rc != ffi::SQLITE_OK {
        let message = if db.is_null() {
            ffi::error_string(rc).to_string()
        } else {
            // SAFETY: the engine returns a handle even on failure; it must be closed
            unsafe {
                let (message, _) = ffi::last_error(db);
                ffi::sqlite3_close(db);
                message
            }
        };
        return Err((message, rc));
    }
    let Some(db) = NonNull::new(db) else {
        return Err((ffi::error_string(ffi::SQLITE_MISUSE).to_string(), ffi::SQLITE_MISUSE));
    };
    let timeout = c_int::try_from(busy_timeout_ms).unwrap_or(c_int::MAX);
    // SAFETY: db is open
    unsafe {
        ffi::sqlite3_busy_timeout(db.as_ptr(), timeout);
    }
    Ok(db)
}

fn apply_mode(db: *mut ffi::sqlite3, mode: Mode, schema: &str) -> std::result::Result<(), (String, c_int)> {
    let sql = mode
        .pragmas(schema)
        .map_err(|e| (e.to_string(), ffi::SQLITE_ERROR))?;
    let sql = ffi::sql_cstring(&sql).map_err(|e| (e.to_string(), ffi::SQLITE_ERROR))?;
    // SAFETY: db is open per the caller
    unsafe { ffi::exec(db, &sql) }
}

fn install_hook(db: *mut ffi::sqlite3, coordinator: &CheckpointCoordinator) {
    // SAFETY: db is open; the hook data stays valid until the hook is
    // removed in stop_checkpointer, before the coordinator is dropped.
    unsafe {
        ffi::sqlite3_wal_hook(db, Some(wal_commit_hook), coordinator.hook_data());
    }
}

fn relabel(error: Error, message: &str) -> Error {
    match error {
        Error::Statement(mut e) => {
            e.message = format!("{message}: {}", e.message);
            Error::Statement(e)
        }
        other => other,
    }
}

/// A finalize-on-drop statement for one-off SQL.
struct Transient(NonNull<ffi::sqlite3_stmt>);

impl Drop for Transient {
    fn drop(&mut self) {
        // SAFETY: compiled by Connection::compile and finalized only here
        unsafe {
            ffi::sqlite3_finalize(self.0.as_ptr());
        }
    }
}

/// One project file's connection.
pub struct Connection {
    db: Option<NativeHandle>,
    path: Option<PathBuf>,
    config: ConnectionConfig,
    statements: StatementCache,
    checkpoint: Option<CheckpointCoordinator>,
    errors: SharedErrorState,
    bypass: AtomicBool,
    savepoints: AtomicU64,
    open_scopes: AtomicUsize,
    project: Weak<Project>,
    on_checkpoint_failure: Option<CheckpointFailureCallback>,
}

impl Connection {
    /// A closed connection for `project`.
    ///
    /// `on_checkpoint_failure` runs on the project's owning thread, at its
    /// next `dispatch_pending`, after a background checkpoint fails.
    pub fn new(project: &Arc<Project>, on_checkpoint_failure: impl Fn() + Send + Sync + 'static) -> Self {
        Self::for_project(Arc::downgrade(project), Some(Arc::new(on_checkpoint_failure)))
    }

    pub fn for_project(project: Weak<Project>, on_checkpoint_failure: Option<CheckpointFailureCallback>) -> Self {
        Self {
            db: None,
            path: None,
            config: ConnectionConfig::default(),
            statements: StatementCache::new(),
            checkpoint: None,
            errors: ErrorState::shared(),
            bypass: AtomicBool::new(false),
            savepoints: AtomicU64::new(0),
            open_scopes: AtomicUsize::new(0),
            project,
            on_checkpoint_failure,
        }
    }

    /// A closed connection tied to no project; checkpoint failures are only recorded.
    pub fn detached() -> Self {
        Self::for_project(Weak::new(), None)
    }

    #[must_use]
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Record errors into an existing state, e.g. one that outlives this connection.
    #[must_use]
    pub fn with_error_state(mut self, errors: SharedErrorState) -> Self {
        self.errors = errors;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.db.is_some()
    }

    pub fn project(&self) -> Option<Arc<Project>> {
        self.project.upgrade()
    }

    /// Open the primary handle, configure safe mode and start checkpointing.
    ///
    /// On failure the connection stays closed and the error is recorded.
    #[tracing::instrument(level = "info", skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<OpenStatus> {
        let path = path.as_ref();
        if self.db.is_some() {
            return Err(self.open_error(OpenErrorKind::AlreadyOpen, path, "Connection is already open".to_string(), None));
        }
        self.config.validate()?;
        diagnostics::install_engine_log();

        let Some(c_path) = ffi::path_cstring(path) else {
            return Err(self.open_error(
                OpenErrorKind::InvalidPath,
                path,
                "Project file path contains a null byte".to_string(),
                None,
            ));
        };

        let existed = path.is_file();
        let db = open_raw(&c_path, self.config.busy_timeout_ms).map_err(|(engine, code)| {
            self.open_error(
                OpenErrorKind::CannotOpen,
                path,
                format!("Failed to open the project file {}", path.display()),
                Some((engine, code)),
            )
        })?;
        let handle = NativeHandle { db };

        if let Err((engine, code)) = apply_mode(handle.as_ptr(), Mode::Safe, "main") {
            return Err(self.open_error(
                OpenErrorKind::Configure,
                path,
                "Failed to set safe mode on the project file".to_string(),
                Some((engine, code)),
            ));
        }

        let coordinator = self.start_checkpointer(path)?;
        install_hook(handle.as_ptr(), &coordinator);

        self.db = Some(handle);
        self.path = Some(path.to_path_buf());
        self.checkpoint = Some(coordinator);
        tracing::info!(created = !existed, "project database opened");
        Ok(if existed {
            OpenStatus::Existing
        } else {
            OpenStatus::Created
        })
    }

    /// Stop the worker, release cached statements and close the handle.
    ///
    /// Returns false if the engine refused a clean close. Statements it still
    /// held are then logged and finalized, the handle is closed and the
    /// error recorded. Closing a closed connection is a no-op.
    #[tracing::instrument(level = "info", skip(self), fields(path = ?self.path))]
    pub fn close(&mut self) -> bool {
        let Some(handle) = self.db.take() else {
            return true;
        };
        self.stop_checkpointer(handle.as_ptr());
        let finalized = self.statements.finalize_all();
        let clean = self.close_primary(handle);
        self.path = None;
        tracing::info!(finalized, clean, "project database closed");
        clean
    }

    /// Give up the primary handle without closing it.
    ///
    /// The connection is closed afterwards; cached statements are finalized
    /// and the worker joined.
    pub fn detach_native_handle(&mut self) -> Option<NativeHandle> {
        let handle = self.db.take()?;
        self.stop_checkpointer(handle.as_ptr());
        let finalized = self.statements.finalize_all();
        self.path = None;
        tracing::debug!(finalized, "native handle detached");
        Some(handle)
    }

    /// Take ownership of `handle` as the primary handle.
    ///
    /// Any current handle is closed first. File-backed handles are put in
    /// safe mode and get a checkpoint worker; if either fails, `handle` is
    /// closed and the connection stays closed.
    pub fn assign_native_handle(&mut self, handle: NativeHandle) -> Result<()> {
        if self.is_open() {
            self.close();
        }
        let path = handle.filename();
        let coordinator = match &path {
            Some(path) => {
                if let Err((engine, code)) = apply_mode(handle.as_ptr(), Mode::Safe, "main") {
                    return Err(self.open_error(
                        OpenErrorKind::Configure,
                        path,
                        "Failed to set safe mode on the project file".to_string(),
                        Some((engine, code)),
                    ));
                }
                Some(self.start_checkpointer(path)?)
            }
            None => None,
        };
        if let Some(coordinator) = &coordinator {
            install_hook(handle.as_ptr(), coordinator);
        }
        tracing::debug!(path = ?path, "native handle assigned");
        self.db = Some(handle);
        self.path = path;
        self.checkpoint = coordinator;
        Ok(())
    }

    /// Durable settings: normal locking, normal sync, write-ahead log.
    ///
    /// On `main` this also restarts the checkpoint worker if fast mode
    /// stopped it.
    pub fn safe_mode(&mut self, schema: &str) -> Result<()> {
        self.set_mode(Mode::Safe, schema)
    }

    /// Throughput settings for scratch work: no sync, no journal.
    ///
    /// On `main` the checkpoint worker is stopped and its handle closed
    /// first, since leaving the write-ahead log needs the file to itself.
    /// It stays stopped until `safe_mode("main")`.
    pub fn fast_mode(&mut self, schema: &str) -> Result<()> {
        self.set_mode(Mode::Fast, schema)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn set_mode(&mut self, mode: Mode, schema: &str) -> Result<()> {
        let db = self.require_open()?;
        let sql = ffi::sql_cstring(&mode.pragmas(schema)?)?;
        let on_main = schema == "main";
        if on_main && mode == Mode::Fast {
            self.stop_checkpointer(db);
        }

        // The wal_autocheckpoint pragma replaces the WAL hook, so put ours back.
        let apply = || {
            // SAFETY: db is open
            unsafe { ffi::exec(db, &sql) }?;
            if let Some(coordinator) = &self.checkpoint {
                install_hook(db, coordinator);
            }
            Ok::<(), (String, c_int)>(())
        };
        let result = match &self.checkpoint {
            Some(coordinator) => coordinator.quiesce(apply),
            None => apply(),
        };

        if let Err((engine, code)) = result {
            let message = format!("Failed to set {} mode on {schema}", mode.as_str());
            self.record_failure(&message, engine.clone(), Some(code));
            if on_main && mode == Mode::Fast {
                if let Err(e) = self.resume_checkpointer() {
                    tracing::warn!(error = %e, "checkpoint worker not restarted");
                }
            }
            return Err(Error::Statement(StatementError {
                kind: StatementErrorKind::Step,
                sql: Some(sql.to_string_lossy().into_owned()),
                message: format!("{message}: {engine}"),
                engine_code: Some(code),
                source: None,
            }));
        }
        if on_main && mode == Mode::Safe {
            self.resume_checkpointer()?;
        }
        Ok(())
    }

    /// The calling thread's compiled copy of `id`, compiling `sql` on first use.
    ///
    /// A compile failure records the engine error and caches nothing.
    pub fn prepare_statement(&self, id: StatementId, sql: &str) -> Result<CachedStatement<'_>> {
        let db = self.require_open()?;
        let thread = std::thread::current().id();
        let stmt = self.statements.get_or_prepare(id, thread, || {
            self.compile(db, sql)
                .map_err(|e| relabel(e, &format!("Failed to prepare statement {id}")))
        })?;
        Ok(CachedStatement::new(self, id, stmt))
    }

    fn compile(&self, db: *mut ffi::sqlite3, sql: &str) -> Result<NonNull<ffi::sqlite3_stmt>> {
        let c_sql = ffi::sql_cstring(sql)?;
        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        // SAFETY: db is open, c_sql is NUL-terminated
        let rc = unsafe {
            ffi::sqlite3_prepare_v3(
                db,
                c_sql.as_ptr(),
                -1,
                ffi::SQLITE_PREPARE_PERSISTENT as c_uint,
                &raw mut stmt,
                ptr::null_mut(),
            )
        };
        match NonNull::new(stmt) {
            Some(stmt) if rc == ffi::SQLITE_OK => Ok(stmt),
            Some(stmt) => {
                // SAFETY: stmt was just compiled and is not cached
                unsafe { ffi::sqlite3_finalize(stmt.as_ptr()) };
                Err(self.statement_error(StatementErrorKind::Prepare, Some(sql.to_string()), "Failed to prepare statement"))
            }
            None if rc == ffi::SQLITE_OK => Err(self.statement_error(
                StatementErrorKind::Prepare,
                Some(sql.to_string()),
                "Statement is empty",
            )),
            None => Err(self.statement_error(StatementErrorKind::Prepare, Some(sql.to_string()), "Failed to prepare statement")),
        }
    }

    /// Run a batch of SQL with no parameters.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let db = self.require_open()?;
        let c_sql = ffi::sql_cstring(sql)?;
        // SAFETY: db is open
        unsafe { ffi::exec(db, &c_sql) }.map_err(|(engine, code)| {
            let message = "Failed to execute SQL".to_string();
            self.record_failure(&message, engine.clone(), Some(code));
            Error::Statement(StatementError {
                kind: StatementErrorKind::Step,
                sql: Some(sql.to_string()),
                message: format!("{message}: {engine}"),
                engine_code: Some(code),
                source: None,
            })
        })
    }

    /// Run one uncached statement; returns the number of rows changed.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let db = self.require_open()?;
        let stmt = Transient(self.compile(db, sql)?);
        bind_params(self, stmt.0.as_ptr(), params)?;
        run_to_completion(self, stmt.0.as_ptr())
    }

    /// Run one uncached query and collect its rows.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let db = self.require_open()?;
        let stmt = Transient(self.compile(db, sql)?);
        bind_params(self, stmt.0.as_ptr(), params)?;
        collect_rows(self, stmt.0.as_ptr(), None)
    }

    /// Rows changed by the most recent statement on the primary handle.
    pub fn changes(&self) -> u64 {
        match &self.db {
            // SAFETY: the handle is open
            Some(handle) => u64::try_from(unsafe { ffi::sqlite3_changes(handle.as_ptr()) }).unwrap_or(0),
            None => 0,
        }
    }

    /// Row id of the most recent insert on the primary handle.
    pub fn last_insert_rowid(&self) -> i64 {
        match &self.db {
            // SAFETY: the handle is open
            Some(handle) => unsafe { ffi::sqlite3_last_insert_rowid(handle.as_ptr()) },
            None => 0,
        }
    }

    /// Make transaction scopes inert; used while bulk work manages its own transaction.
    pub fn set_bypass(&self, bypass: bool) {
        self.bypass.store(bypass, Ordering::Relaxed);
    }

    pub fn should_bypass(&self) -> bool {
        self.bypass.load(Ordering::Relaxed)
    }

    /// Record `message` (and optional engine details) without asking the engine.
    pub fn set_error(&self, message: &str, engine_message: Option<&str>, engine_code: Option<i32>) {
        self.errors
            .set(message, engine_message.unwrap_or_default(), engine_code, String::new());
        tracing::debug!(message, engine_message, engine_code, "error recorded");
    }

    /// Record `message`, filling missing engine details from the primary
    /// handle, and append it to the diagnostic log.
    pub fn set_db_error(&self, message: &str, engine_message: Option<&str>, engine_code: Option<i32>) {
        let (engine_message, engine_code) = self.engine_details(engine_message, engine_code);
        self.record_failure(message, engine_message, engine_code);
    }

    fn engine_details(&self, engine_message: Option<&str>, engine_code: Option<i32>) -> (String, Option<i32>) {
        match (engine_message, &self.db) {
            (Some(text), _) => (text.to_string(), engine_code),
            (None, Some(handle)) => {
                // SAFETY: the handle is open
                let (text, code) = unsafe { ffi::last_error(handle.as_ptr()) };
                (text, engine_code.or(Some(code)))
            }
            (None, None) => (String::new(), engine_code),
        }
    }

    fn record_failure(&self, message: &str, engine_message: String, engine_code: Option<i32>) {
        diagnostics::record(match engine_code {
            Some(code) => format!("{message} ({code}): {engine_message}"),
            None => format!("{message}: {engine_message}"),
        });
        let log = diagnostics::recent(self.config.diagnostic_lines);
        tracing::warn!(message, engine_message = %engine_message, engine_code, "project database error");
        self.errors.set(message, engine_message, engine_code, log);
    }

    /// Record the failure and build the statement error for it.
    pub(crate) fn statement_error(&self, kind: StatementErrorKind, sql: Option<String>, message: impl Into<String>) -> Error {
        let message = message.into();
        let (engine_message, engine_code) = self.engine_details(None, None);
        self.record_failure(&message, engine_message.clone(), engine_code);
        Error::Statement(StatementError {
            kind,
            sql,
            message: format!("{message}: {engine_message}"),
            engine_code,
            source: None,
        })
    }

    fn open_error(&self, kind: OpenErrorKind, path: &Path, message: String, engine: Option<(String, c_int)>) -> Error {
        let (engine_message, engine_code) = match engine {
            Some((text, code)) => (text, Some(code)),
            None => (String::new(), None),
        };
        self.record_failure(&message, engine_message.clone(), engine_code);
        let message = if engine_message.is_empty() {
            message
        } else {
            format!("{message}: {engine_message}")
        };
        Error::Open(OpenError {
            kind,
            path: Some(path.display().to_string()),
            message,
            engine_code,
            source: None,
        })
    }

    /// Escalate a failed read or write the caller cannot recover from.
    ///
    /// Records the engine's last error and returns the fatal error to
    /// propagate; a failed write means the document may be inconsistent.
    pub fn consistency_failure(&self, write: bool) -> Error {
        let (kind, message) = if write {
            (FatalKind::Write, "Failed to write to the project file")
        } else {
            (FatalKind::Read, "Failed to read from the project file")
        };
        let (engine_message, engine_code) = self.engine_details(None, None);
        self.record_failure(message, engine_message.clone(), engine_code);
        tracing::error!(?kind, engine_message = %engine_message, engine_code, "project file consistency failure");
        Error::Fatal(FatalConsistencyError {
            kind,
            message: message.to_string(),
            engine_message: (!engine_message.is_empty()).then_some(engine_message),
            engine_code,
        })
    }

    /// The shared error record; may outlive this connection.
    pub fn error_state(&self) -> SharedErrorState {
        Arc::clone(&self.errors)
    }

    pub fn last_error(&self) -> ErrorSnapshot {
        self.errors.snapshot()
    }

    /// Compiled statements held across all threads.
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// Finalize the statements compiled for `thread`, which must have finished.
    ///
    /// Cached statements otherwise stay until `close`, one set per thread
    /// that ever prepared one. Needs `&mut self`, so no borrowed statement
    /// can still be live. Returns how many were released.
    pub fn release_thread_statements(&mut self, thread: std::thread::ThreadId) -> usize {
        let released = self.statements.finalize_thread(thread);
        tracing::debug!(?thread, released, "thread statements released");
        released
    }

    /// Compiled statements held for the calling thread.
    pub fn thread_statement_count(&self) -> usize {
        self.statements.len_for_thread(std::thread::current().id())
    }

    /// Engine handles currently held: the primary plus the checkpoint handle.
    pub fn native_handle_count(&self) -> usize {
        usize::from(self.db.is_some())
            + usize::from(self.checkpoint.as_ref().is_some_and(CheckpointCoordinator::holds_target))
    }

    pub fn checkpoint_phase(&self) -> Option<CheckpointPhase> {
        self.checkpoint.as_ref().map(CheckpointCoordinator::phase)
    }

    pub fn checkpoint_stats(&self) -> Option<CheckpointStats> {
        self.checkpoint.as_ref().map(CheckpointCoordinator::stats)
    }

    /// Ask the worker for a pass now instead of waiting for the next commit.
    pub fn request_checkpoint(&self) {
        if let Some(coordinator) = &self.checkpoint {
            coordinator.signal();
        }
    }

    /// Wait until no checkpoint is pending or running.
    pub fn wait_for_checkpoint(&self, timeout: std::time::Duration) -> bool {
        self.checkpoint
            .as_ref()
            .is_none_or(|coordinator| coordinator.wait_idle(timeout))
    }

    pub(crate) fn next_savepoint(&self, label: &str) -> String {
        let seq = self.savepoints.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{label}_{seq}")
    }

    /// Count a newly opened savepoint scope; returns its nesting depth.
    pub(crate) fn enter_scope(&self) -> usize {
        self.open_scopes.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn leave_scope(&self) {
        self.open_scopes.fetch_sub(1, Ordering::AcqRel);
    }

    /// Savepoint scopes currently open on this connection.
    pub fn scope_depth(&self) -> usize {
        self.open_scopes.load(Ordering::Acquire)
    }

    fn require_open(&self) -> Result<*mut ffi::sqlite3> {
        match &self.db {
            Some(handle) => Ok(handle.as_ptr()),
            None => {
                let message = "Connection is not open";
                self.set_error(message, None, None);
                Err(Error::Statement(StatementError {
                    kind: StatementErrorKind::NotOpen,
                    sql: None,
                    message: message.to_string(),
                    engine_code: None,
                    source: None,
                }))
            }
        }
    }

    fn start_checkpointer(&self, path: &Path) -> Result<CheckpointCoordinator> {
        let Some(c_path) = ffi::path_cstring(path) else {
            return Err(self.open_error(
                OpenErrorKind::InvalidPath,
                path,
                "Checkpoint path contains a null byte".to_string(),
                None,
            ));
        };
        let secondary = open_raw(&c_path, self.config.busy_timeout_ms).map_err(|(engine, code)| {
            self.open_error(
                OpenErrorKind::Checkpointer,
                path,
                "Failed to open the checkpoint connection".to_string(),
                Some((engine, code)),
            )
        })?;
        // SAFETY: secondary was just opened and is owned by nothing else
        let target = unsafe { WalCheckpointer::from_raw(secondary) };
        if let Err((engine, code)) = apply_mode(secondary.as_ptr(), Mode::Safe, "main") {
            drop(target);
            return Err(self.open_error(
                OpenErrorKind::Checkpointer,
                path,
                "Failed to configure the checkpoint connection".to_string(),
                Some((engine, code)),
            ));
        }
        let notifier = FailureNotifier::new(
            self.project.clone(),
            self.on_checkpoint_failure.clone(),
            Arc::clone(&self.errors),
            self.config.diagnostic_lines,
            path.display().to_string(),
        );
        CheckpointCoordinator::start(
            Box::new(target),
            self.config.wal_threshold_pages,
            self.config.checkpoint.clone(),
            notifier,
        )
        .map_err(|e| {
            let message = "Failed to start the checkpoint thread".to_string();
            self.record_failure(&message, e.to_string(), None);
            Error::Open(OpenError {
                kind: OpenErrorKind::Checkpointer,
                path: Some(path.display().to_string()),
                message,
                engine_code: None,
                source: Some(Box::new(e)),
            })
        })
    }

    /// Start a worker for the open file-backed handle if none is running.
    fn resume_checkpointer(&mut self) -> Result<()> {
        if self.checkpoint.is_some() {
            return Ok(());
        }
        let (Some(db), Some(path)) = (self.db.as_ref().map(NativeHandle::as_ptr), self.path.clone()) else {
            return Ok(());
        };
        let coordinator = self.start_checkpointer(&path)?;
        install_hook(db, &coordinator);
        self.checkpoint = Some(coordinator);
        tracing::debug!("checkpoint worker restarted");
        Ok(())
    }

    fn stop_checkpointer(&mut self, db: *mut ffi::sqlite3) {
        // SAFETY: db is open; clearing the hook first means no commit can
        // touch the coordinator's state once it is dropped.
        unsafe {
            ffi::sqlite3_wal_hook(db, None, ptr::null_mut());
        }
        if let Some(mut coordinator) = self.checkpoint.take() {
            if !coordinator.shutdown() {
                tracing::warn!("checkpoint worker did not stop cleanly");
            }
        }
    }

    fn close_primary(&self, handle: NativeHandle) -> bool {
        let db = handle.into_raw();
        // SAFETY: we own db; every cached statement has been finalized
        let rc = unsafe { ffi::sqlite3_close(db) };
        if rc == ffi::SQLITE_OK {
            return true;
        }

        // SAFETY: a refused close leaves the handle open
        let (engine_message, _) = unsafe { ffi::last_error(db) };
        self.record_failure("Failed to close the project file", engine_message, Some(rc));
        // SAFETY: the cache is empty, so nothing can reach the leftovers
        for sql in unsafe { finalize_leftovers(db) } {
            diagnostics::record(format!("unfinalized statement: {sql}"));
            tracing::warn!(sql = %sql, "unfinalized statement at close");
        }
        // SAFETY: db is open and now has no statements
        let rc = unsafe { ffi::sqlite3_close(db) };
        if rc != ffi::SQLITE_OK {
            tracing::error!(rc, "project file handle could not be closed");
        }
        false
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("statements", &self.statements)
            .field("checkpoint", &self.checkpoint)
            .field("bypass", &self.should_bypass())
            .finish_non_exhaustive()
    }
}
