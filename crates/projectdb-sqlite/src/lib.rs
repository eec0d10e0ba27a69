//! SQLite connection management for ProjectDB.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! One `Connection` per open project file. It owns the primary engine handle,
//! a statement cache keyed by statement and thread, and a worker thread that
//! checkpoints the write-ahead log through a second handle so commits never
//! wait on it.
//!
//! # Example
//!
//! ```rust,ignore
//! use projectdb_core::{Project, StatementId, Value};
//! use projectdb_sqlite::{ConnectionHolder, TransactionScope};
//!
//! let project = Project::new("song");
//! let holder = ConnectionHolder::get(&project);
//! holder.open("song.db", Default::default(), || eprintln!("checkpoint failed"))?;
//!
//! holder.with_connection(|conn| -> projectdb_core::Result<()> {
//!     let mut scope = TransactionScope::begin(conn, "insert_block")?;
//!     conn.prepare_statement(StatementId::InsertSampleBlock, "INSERT INTO sampleblock (samples) VALUES (?1);")?
//!         .execute(&[Value::Bytes(vec![0; 64])])?;
//!     scope.commit()
//! });
//!
//! // On the owning thread, run deferred failure callbacks.
//! project.dispatch_pending();
//! ```
//!
//! # Thread Safety
//!
//! `Connection` is `Send` and `Sync`. The primary handle is opened in
//! serialized mode; every thread that prepares a statement gets its own
//! compiled copy, and `CachedStatement` cannot be sent to another thread.

pub mod cache;
pub mod checkpoint;
pub mod connection;
pub mod diagnostics;
pub mod ffi;
pub mod holder;
pub mod statement;
pub mod transaction;
pub mod types;

pub use cache::StatementCache;
pub use checkpoint::{
    CheckpointAttempt, CheckpointCoordinator, CheckpointFailureCallback, CheckpointPhase,
    CheckpointStats, CheckpointTarget, FailureNotifier, WalCheckpointer,
};
pub use connection::{Connection, NativeHandle, OpenStatus};
pub use holder::ConnectionHolder;
pub use statement::CachedStatement;
pub use transaction::TransactionScope;

/// Get the SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

/// Get the SQLite library version number.
pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}
