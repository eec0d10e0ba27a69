//! Core types for the ProjectDB connection manager.
//!
//! This crate holds everything that does not touch the storage engine:
//!
//! - `Error` and the per-kind error structs
//! - `ErrorState`, the shared record of the most recent failure
//! - `StatementId`, the closed set of cacheable statements
//! - `Mode` and `ConnectionConfig`
//! - `Value` / `Row` for parameters and results
//! - `Project`, the document that owns a connection slot and runs deferred calls

pub mod config;
pub mod error;
pub mod error_state;
pub mod project;
pub mod row;
pub mod statement;
pub mod value;

pub use config::{CheckpointPolicy, ConnectionConfig, Mode, is_identifier};
pub use error::{
    CheckpointError, CheckpointErrorKind, ConfigError, Error, FatalConsistencyError, FatalKind,
    OpenError, OpenErrorKind, Result, StatementError, StatementErrorKind, TransactionError,
    TransactionErrorKind, TypeError, is_busy_code,
};
pub use error_state::{ErrorSnapshot, ErrorState, SharedErrorState};
pub use project::{Attachment, Project};
pub use row::{ColumnInfo, FromValue, Row};
pub use statement::StatementId;
pub use value::Value;
