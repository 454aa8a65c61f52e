use pyo3::exceptions::PyRuntimeError;
use pyo3::PyErr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Executor error types
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Unsupported database: {requested}. Supported: {supported:?}")]
    UnsupportedBackend {
        requested: String,
        supported: Vec<String>,
    },

    #[error("No executor for {library}+{backend}. Available: {available:?}")]
    UnsupportedCombination {
        library: String,
        backend: String,
        available: Vec<(String, String)>,
    },

    #[error("Malformed table reference {reference:?}: expected at least schema.table")]
    MalformedReference { reference: String },

    #[error("No main function found in compiled code")]
    MissingEntryPoint,

    #[error("Model returned neither a result mapping nor a result object: {0}")]
    MalformedResult(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Python error: {0}")]
    Python(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio_postgres::Error> for ExecutorError {
    fn from(err: tokio_postgres::Error) -> Self {
        let details = match err.as_db_error() {
            Some(db_err) => format!("Code: {}, Message: {}", db_err.code().code(), db_err.message()),
            None => err.to_string(),
        };
        ExecutorError::Database(details)
    }
}

impl From<deadpool_postgres::PoolError> for ExecutorError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        ExecutorError::Connection(format!("Failed to get connection from pool: {}", err))
    }
}

impl From<deadpool_postgres::CreatePoolError> for ExecutorError {
    fn from(err: deadpool_postgres::CreatePoolError) -> Self {
        ExecutorError::Connection(format!("Failed to create connection pool: {}", err))
    }
}

impl From<arrow::error::ArrowError> for ExecutorError {
    fn from(err: arrow::error::ArrowError) -> Self {
        ExecutorError::Database(format!("Arrow conversion failed: {}", err))
    }
}

impl From<PyErr> for ExecutorError {
    fn from(err: PyErr) -> Self {
        ExecutorError::Python(err.to_string())
    }
}

/// Model code receives executor failures as plain RuntimeErrors; the message
/// carries the original error text across the interpreter boundary.
impl From<ExecutorError> for PyErr {
    fn from(err: ExecutorError) -> Self {
        PyRuntimeError::new_err(err.to_string())
    }
}

impl From<std::ffi::NulError> for ExecutorError {
    fn from(_: std::ffi::NulError) -> Self {
        ExecutorError::Python("Compiled code contains an interior NUL byte".to_string())
    }
}

impl From<std::io::Error> for ExecutorError {
    fn from(err: std::io::Error) -> Self {
        ExecutorError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for ExecutorError {
    fn from(err: config::ConfigError) -> Self {
        ExecutorError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ExecutorError {
    fn from(err: serde_json::Error) -> Self {
        ExecutorError::Config(err.to_string())
    }
}
