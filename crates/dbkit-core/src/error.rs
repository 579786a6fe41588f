//! Error taxonomy for the engine.
//!
//!

use dbkit_cancel::CancelledError;

/// Error kinds surfaced by the engine.
///
/// Variants follow the taxonomy of result codes, syntax failures, value
/// conversion failures, programmer errors, cancellation, and pool timeouts.
/// Engine and syntax errors propagate out of the call that triggered them;
/// conversion errors are fatal for required accessors; programmer errors are
/// always fatal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A non-OK result code from the embedded engine.
    #[error("engine error {code}: {message}{}", sql.as_deref().map(|s| format!(" (sql: {s})")).unwrap_or_default())]
    Engine {
        code: i32,
        message: String,
        sql: Option<String>,
    },

    /// A preparation-time failure referencing the offending SQL.
    #[error("syntax error in `{sql}`: {message}")]
    Syntax { sql: String, message: String },

    /// A column value could not be produced as the requested type.
    #[error("cannot convert column {column} of a {row_kind} row to {expected}")]
    Conversion {
        column: usize,
        expected: &'static str,
        row_kind: &'static str,
    },

    /// A fatal, client-code-level misuse: reentrant writes, unsupported join
    /// chains, unknown column names, iteration-after-advance, and similar.
    #[error("programmer error: {0}")]
    Programmer(&'static str),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A timeout (or closed pool) while acquiring a pooled connection.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Errors specific to [`crate::pool::Pool`].
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("timed out waiting for a pooled connection")]
    Timeout,
    #[error("pool is closed")]
    Closed,
}

impl From<CancelledError> for Error {
    fn from(_: CancelledError) -> Self {
        Error::Cancelled
    }
}

pub type Result<T> = std::result::Result<T, Error>;
