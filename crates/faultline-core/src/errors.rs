//! Error types for the faultline core.

use rusqlite::{ffi, ErrorCode};

/// Top-level error enum for the faultline core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed input rejected before it reaches fingerprinting or storage.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A referenced record (App, Problem, Watcher, ...) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient race on a keyed write. Recovered by the grouping index and
    /// never returned from a public operation.
    #[error("Conflicting write, retry: {0}")]
    ConflictRetry(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Reclassify a SQLite error raised inside a get-or-create transaction.
    ///
    /// Lock contention and unique-key races become `ConflictRetry`. Other
    /// constraint failures (foreign key, not null, check) cannot succeed on
    /// retry and stay storage errors.
    pub(crate) fn from_contended(err: rusqlite::Error) -> CoreError {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _) if is_contended(failure) => {
                CoreError::ConflictRetry(err.to_string())
            }
            _ => CoreError::Sqlite(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }
}

fn is_contended(failure: &ffi::Error) -> bool {
    match failure.code {
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => true,
        ErrorCode::ConstraintViolation => matches!(
            failure.extended_code,
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        ),
        _ => false,
    }
}

#[cfg(feature = "python")]
impl From<CoreError> for pyo3::PyErr {
    fn from(err: CoreError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyIOError, PyKeyError, PyRuntimeError, PyValueError};
        match &err {
            CoreError::Validation(_) | CoreError::Json(_) => PyValueError::new_err(err.to_string()),
            CoreError::NotFound(_) => PyKeyError::new_err(err.to_string()),
            CoreError::ConflictRetry(_) | CoreError::Database(_) | CoreError::Sqlite(_) => {
                PyRuntimeError::new_err(err.to_string())
            }
            CoreError::Io(_) => PyIOError::new_err(err.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
