//! Error types for project-database operations.

use std::fmt;

/// SQLite primary result code for "database is locked".
const ENGINE_BUSY: i32 = 5;
/// SQLite primary result code for "database table is locked".
const ENGINE_LOCKED: i32 = 6;

/// The primary error type for all connection operations.
#[derive(Debug)]
pub enum Error {
    /// The primary handle could not be opened or configured
    Open(OpenError),
    /// Prepare, bind or step failure on a single statement
    Statement(StatementError),
    /// Savepoint start, release or rollback failure
    Transaction(TransactionError),
    /// Non-busy failure of a background checkpoint
    Checkpoint(CheckpointError),
    /// Unrecoverable failure; the connection must not be used further
    Fatal(FatalConsistencyError),
    /// Configuration errors
    Config(ConfigError),
    /// Type conversion errors
    Type(TypeError),
    /// I/O errors
    Io(std::io::Error),
}

#[derive(Debug)]
pub struct OpenError {
    pub kind: OpenErrorKind,
    pub path: Option<String>,
    pub message: String,
    pub engine_code: Option<i32>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenErrorKind {
    /// The file could not be created or opened
    CannotOpen,
    /// The baseline mode configuration failed
    Configure,
    /// The connection already holds a primary handle
    AlreadyOpen,
    /// The checkpoint handle or worker thread could not be started
    Checkpointer,
    /// The path cannot be passed to the engine
    InvalidPath,
}

#[derive(Debug)]
pub struct StatementError {
    pub kind: StatementErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub engine_code: Option<i32>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementErrorKind {
    /// Compilation failed
    Prepare,
    /// A parameter could not be bound
    Bind,
    /// Execution failed
    Step,
    /// The connection is closed
    NotOpen,
    /// SQL text contains an interior NUL byte
    InvalidSql,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub savepoint: Option<String>,
    pub message: String,
    pub engine_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The savepoint could not be started
    Start,
    /// The savepoint could not be released
    Commit,
    /// Rolling back to the savepoint failed
    Rollback,
    /// Commit was already performed on this scope
    AlreadyCommitted,
    /// The scope label is not a valid identifier
    InvalidName,
    /// A scope nested inside this one has not finished yet
    InnerScopeOpen,
}

#[derive(Debug)]
pub struct CheckpointError {
    pub kind: CheckpointErrorKind,
    pub message: String,
    pub engine_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointErrorKind {
    /// The disk holding the database or its log is full
    DiskFull,
    /// Any other engine failure
    Engine,
}

/// Raised when the owning thread cannot safely continue with the connection.
#[derive(Debug)]
pub struct FatalConsistencyError {
    pub kind: FatalKind,
    pub message: String,
    pub engine_message: Option<String>,
    pub engine_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// A read-only statement failed; only the current query is invalid
    Read,
    /// A mutating statement failed; the persisted document may be inconsistent
    Write,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl Error {
    /// Is this a busy/lock-contention condition that may succeed on retry?
    pub fn is_busy(&self) -> bool {
        self.engine_code().is_some_and(is_busy_code)
    }

    /// Is this an unrecoverable consistency failure?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// The engine result code attached to this error, if any.
    pub fn engine_code(&self) -> Option<i32> {
        match self {
            Error::Open(e) => e.engine_code,
            Error::Statement(e) => e.engine_code,
            Error::Transaction(e) => e.engine_code,
            Error::Checkpoint(e) => e.engine_code,
            Error::Fatal(e) => e.engine_code,
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Statement(e) => e.sql.as_deref(),
            _ => None,
        }
    }
}

/// Does `code` (primary or extended) denote lock contention?
pub fn is_busy_code(code: i32) -> bool {
    matches!(code & 0xff, ENGINE_BUSY | ENGINE_LOCKED)
}

impl FatalConsistencyError {
    /// A failed write leaves the document possibly inconsistent on disk.
    pub fn requires_recovery(&self) -> bool {
        self.kind == FatalKind::Write
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Open(e) => match &e.path {
                Some(path) => write!(f, "Open error ({}): {}", path, e.message),
                None => write!(f, "Open error: {}", e.message),
            },
            Error::Statement(e) => write!(f, "Statement error: {}", e.message),
            Error::Transaction(e) => match &e.savepoint {
                Some(name) => write!(f, "Transaction error on savepoint {}: {}", name, e.message),
                None => write!(f, "Transaction error: {}", e.message),
            },
            Error::Checkpoint(e) => write!(f, "Checkpoint error: {}", e.message),
            Error::Fatal(e) => write!(f, "Fatal error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Open(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Statement(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for StatementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.engine_code {
            Some(code) => write!(f, "{} (rc {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for FatalConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.engine_message {
            Some(engine) => write!(f, "{} ({})", self.message, engine),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<OpenError> for Error {
    fn from(err: OpenError) -> Self {
        Error::Open(err)
    }
}

impl From<StatementError> for Error {
    fn from(err: StatementError) -> Self {
        Error::Statement(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<CheckpointError> for Error {
    fn from(err: CheckpointError) -> Self {
        Error::Checkpoint(err)
    }
}

impl From<FatalConsistencyError> for Error {
    fn from(err: FatalConsistencyError) -> Self {
        Error::Fatal(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            message: format!("invalid configuration: {err}"),
            source: Some(Box::new(err)),
        })
    }
}

/// Result type alias for project-database operations.
pub type Result<T> = std::result::Result<T, Error>;
