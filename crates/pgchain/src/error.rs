//! Error types for pgchain

use thiserror::Error;

/// Result type alias for pgchain operations
pub type ChainResult<T> = Result<T, ChainError>;

/// Error types for query building and execution
#[derive(Debug, Error)]
pub enum ChainError {
    /// Connection or pool error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Database statement error
    #[error("Query error: {message}")]
    Query {
        message: String,
        /// SQLSTATE code, when the driver reported one
        code: Option<String>,
        /// Violated constraint name, when the driver reported one
        constraint: Option<String>,
    },

    /// A `find`/`*_or_throw` return type yielded zero rows
    #[error("Record not found: {query}")]
    NotFound { query: String },

    /// Programmer misuse of the builder API
    #[error("Internal error: {0}")]
    Internal(String),

    /// Failure inside a post-commit hook.
    ///
    /// The transaction has already committed, so nothing is rolled back;
    /// `result` carries the value the query produced before the hook ran.
    #[error("After-commit hook failed: {source}")]
    AfterCommit {
        source: Box<ChainError>,
        result: serde_json::Value,
    },

    /// Column encode error (app value -> driver value)
    #[error("Encode error on column '{column}': {message}")]
    Encode { column: String, message: String },

    /// Column decode error (driver value -> app value)
    #[error("Decode error on column '{column}': {message}")]
    Decode { column: String, message: String },

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl ChainError {
    /// Create a not found error carrying a description of the originating query
    pub fn not_found(query: impl Into<String>) -> Self {
        Self::NotFound {
            query: query.into(),
        }
    }

    /// Create an internal (programmer misuse) error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create an encode error for a specific column
    pub fn encode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Encode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a decode error for a specific column
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Check if this is a unique constraint violation (SQLSTATE 23505)
    pub fn is_unique(&self) -> bool {
        matches!(self, Self::Query { code: Some(c), .. } if c == "23505")
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Parse a tokio_postgres error into a ChainError, preserving the
    /// SQLSTATE and constraint name when present
    pub fn from_db_error(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            return Self::Query {
                message: db_err.message().to_string(),
                code: Some(db_err.code().code().to_string()),
                constraint: db_err.constraint().map(str::to_string),
            };
        }
        Self::Query {
            message: err.to_string(),
            code: None,
            constraint: None,
        }
    }
}

impl From<tokio_postgres::Error> for ChainError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::from_db_error(err)
    }
}

#[cfg(feature = "pool")]
impl From<deadpool_postgres::PoolError> for ChainError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Connection(err.to_string())
    }
}
