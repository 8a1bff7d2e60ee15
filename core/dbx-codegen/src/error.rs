//! Error types for DBX query code generation.
//!
//! All public APIs return `DbxResult<T>`. A failure aborts the whole
//! compilation pass; the generator never falls back to a partial plan.

use thiserror::Error;

/// Unified error type for code generation and procedure execution.
#[derive(Debug, Error)]
pub enum DbxError {
    /// Operator/expression/type combination the generator does not implement
    #[error("unsupported plan shape in {operator}: {detail}")]
    UnsupportedPlanShape { operator: String, detail: String },

    /// Operand types that cannot be coerced under the promotion rules
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Internal contract breach between operators
    #[error("internal invariant violated in {operator}: {message}")]
    InternalInvariantViolation { operator: String, message: String },

    /// produce/consume called in a style the operator does not implement
    #[error("{operator} does not support {style} production/consumption")]
    UnsupportedProduction { operator: String, style: String },

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure while running an emitted procedure
    #[error("execution error: {message}\nContext: {context}")]
    Execution { message: String, context: String },

    /// Requested table does not exist
    #[error("table '{0}' not found")]
    TableNotFound(String),

    /// Apache Arrow error (RecordBatch operations)
    #[error("arrow error: {source}")]
    Arrow {
        #[from]
        source: arrow::error::ArrowError,
    },

    /// Apache Parquet error (file I/O)
    #[error("parquet error: {source}")]
    Parquet {
        #[from]
        source: parquet::errors::ParquetError,
    },

    /// Standard I/O error
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for all DBX code generation operations.
pub type DbxResult<T> = Result<T, DbxError>;

impl DbxError {
    pub fn unsupported(operator: impl Into<String>, detail: impl Into<String>) -> Self {
        DbxError::UnsupportedPlanShape {
            operator: operator.into(),
            detail: detail.into(),
        }
    }

    pub fn invariant(operator: impl Into<String>, message: impl Into<String>) -> Self {
        DbxError::InternalInvariantViolation {
            operator: operator.into(),
            message: message.into(),
        }
    }

    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        DbxError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn execution(message: impl Into<String>, context: impl Into<String>) -> Self {
        DbxError::Execution {
            message: message.into(),
            context: context.into(),
        }
    }
}

impl From<serde_json::Error> for DbxError {
    fn from(err: serde_json::Error) -> Self {
        DbxError::Serialization(err.to_string())
    }
}
