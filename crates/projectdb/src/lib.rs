//! ProjectDB - per-document SQLite storage with background WAL checkpointing.
//!
//! Each open document (`Project`) owns one `ConnectionHolder`. The holder
//! keeps the document's `Connection`, which provides:
//!
//! - a primary handle in safe (WAL) or fast mode
//! - a statement cache with one compiled copy per thread
//! - nested `TransactionScope`s built on savepoints
//! - a checkpoint worker that folds the WAL back into the file off the
//!   committing thread, reporting failures back to the document's own thread
//!
//! # Quick Start
//!
//! ```ignore
//! use projectdb::prelude::*;
//!
//! let (project, holder) = projectdb::open_project("song", "song.db", ConnectionConfig::default(), || {
//!     eprintln!("background checkpoint failed");
//! })?;
//!
//! holder.with_connection(|conn| -> Result<()> {
//!     conn.execute_batch("CREATE TABLE IF NOT EXISTS sampleblocks (blockid INTEGER PRIMARY KEY, samples BLOB);")?;
//!     let mut scope = TransactionScope::begin(conn, "add_block")?;
//!     conn.prepare_statement(StatementId::InsertSampleBlock, "INSERT INTO sampleblocks (samples) VALUES (?1);")?
//!         .execute(&[Value::Bytes(vec![0; 1024])])?;
//!     scope.commit()
//! });
//!
//! // Later, on the thread that created the project:
//! project.dispatch_pending();
//! ```

pub use projectdb_core::{
    Attachment, CheckpointError, CheckpointErrorKind, CheckpointPolicy, ColumnInfo, ConfigError,
    ConnectionConfig, Error, ErrorSnapshot, ErrorState, FatalConsistencyError, FatalKind,
    FromValue, Mode, OpenError, OpenErrorKind, Project, Result, Row, SharedErrorState,
    StatementError, StatementErrorKind, StatementId, TransactionError, TransactionErrorKind,
    TypeError, Value, is_identifier,
};
pub use projectdb_sqlite::{
    CachedStatement, CheckpointAttempt, CheckpointCoordinator, CheckpointFailureCallback,
    CheckpointPhase, CheckpointStats, CheckpointTarget, Connection, ConnectionHolder,
    FailureNotifier, NativeHandle, OpenStatus, TransactionScope, diagnostics, sqlite_version,
};

use std::path::Path;
use std::sync::Arc;

/// Create a project named `name`, open `path` as its storage and return both.
///
/// The calling thread becomes the project's owning thread: it is where
/// `on_checkpoint_failure` runs, via `Project::dispatch_pending`.
pub fn open_project(
    name: &str,
    path: impl AsRef<Path>,
    config: ConnectionConfig,
    on_checkpoint_failure: impl Fn() + Send + Sync + 'static,
) -> Result<(Arc<Project>, Arc<ConnectionHolder>)> {
    let path = path.as_ref();
    let project = Project::new(name);
    let holder = ConnectionHolder::get(&project);
    let status = holder.open(path, config, on_checkpoint_failure)?;
    tracing::info!(project = name, path = %path.display(), ?status, "project opened");
    Ok((project, holder))
}

/// Everything needed to work with a project connection.
pub mod prelude {
    pub use crate::{
        // Documents
        Attachment,
        ConnectionHolder,
        Project,
        // Connection
        CachedStatement,
        Connection,
        ConnectionConfig,
        Mode,
        OpenStatus,
        StatementId,
        TransactionScope,
        // Values
        FromValue,
        Row,
        Value,
        // Errors
        Error,
        Result,
    };
}
