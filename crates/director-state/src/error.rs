//! Error types for the Director state store.

use thiserror::Error;

use crate::validation::ValidationErrors;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("missing reference: {0}")]
    MissingReference(String),

    #[error(transparent)]
    Validation(#[from] ValidationErrors),
}

impl StateError {
    /// The validation violations carried by this error, if any.
    pub fn violations(&self) -> Option<&ValidationErrors> {
        match self {
            StateError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}
