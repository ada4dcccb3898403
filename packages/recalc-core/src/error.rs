//! Engine error types.

use thiserror::Error;

/// Recalculation engine errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecalcError {
    /// Table not found
    #[error("Table '{table}' not found")]
    TableNotFound { table: String },

    /// Field not found
    #[error("Field '{field}' not found")]
    FieldNotFound { field: String },

    /// Record not found in table
    #[error("Record '{record}' not found in table '{table}'")]
    RecordNotFound { table: String, record: String },

    /// Table already exists
    #[error("Table '{0}' already exists")]
    TableAlreadyExists(String),

    /// Field already exists
    #[error("Field '{0}' already exists")]
    FieldAlreadyExists(String),

    /// Record already exists in table
    #[error("Record '{record}' already exists in table '{table}'")]
    RecordAlreadyExists { table: String, record: String },

    /// An operation could not be interpreted as a field edit
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A field or table referenced by a dependency edge has no definition
    #[error("Missing metadata: {0}")]
    MissingMetadata(String),

    /// A field definition is inconsistent with the schema
    #[error("Invalid definition for field '{field}': {reason}")]
    InvalidFieldDefinition { field: String, reason: String },

    /// Adding the field would close a dependency cycle
    #[error("Dependency cycle detected through field '{field}'")]
    CycleDetected { field: String },

    /// Formula or rollup evaluation failed
    #[error("Formula error in field '{field}': {message}")]
    Formula { field: String, message: String },

    /// A value could not be converted to or from its physical form
    #[error("Codec error for field '{field}': {message}")]
    Codec { field: String, message: String },

    /// Record was written by another transaction since it was read
    #[error("Version conflict on record '{record}' in table '{table}': expected {expected}, found {actual}")]
    VersionConflict {
        table: String,
        record: String,
        expected: u64,
        actual: u64,
    },

    /// Transaction reused after commit or abort
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// Graph traversal exceeded the configured stack bound
    #[error("Traversal depth limit {limit} exceeded")]
    DepthLimitExceeded { limit: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error reading or writing a workspace document
    #[error("I/O error: {0}")]
    IoError(String),
}

impl RecalcError {
    /// Returns true when re-running against a fresh snapshot may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecalcError::VersionConflict { .. })
    }

    /// Returns true for the typed not-found family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RecalcError::TableNotFound { .. }
                | RecalcError::FieldNotFound { .. }
                | RecalcError::RecordNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for RecalcError {
    fn from(err: serde_json::Error) -> Self {
        RecalcError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RecalcError>;
