use std::error::Error;
use std::fmt;

use charybdis::errors::CharybdisError;

/// State of a completed branch, derived from its generation id.
/// A branch committed with no staged changes never receives a generation id,
/// which makes it indistinguishable from an aborted one by value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum CompletionState {
    Committed,
    Aborted,
}

#[derive(Debug)]
pub enum GenerationError {
    /// An open branch with this name already exists in the model.
    AlreadyExists(String),
    /// Branch, application or backing document not found.
    NotFound(String),
    /// Mutation attempted against a committed or aborted branch.
    AlreadyCompleted(CompletionState),
    /// Unit name cannot be resolved to an owning application.
    InvalidUnitName(String),
    /// A conditional write lost a race with another writer. Absorbed by the
    /// transaction runner; callers only ever see `RetryExhausted`.
    Conflict(String),
    /// The transaction runner gave up after too many conflicting attempts.
    /// Transient; safe to retry at a higher level.
    RetryExhausted(String),
    CharybdisError(CharybdisError),
    Database(String),
    Internal(String),
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationError::AlreadyExists(e) => write!(f, "Already Exists: {}", e),
            GenerationError::NotFound(e) => write!(f, "Not Found: {}", e),
            GenerationError::AlreadyCompleted(state) => write!(f, "branch was already {}", state),
            GenerationError::InvalidUnitName(e) => write!(f, "Invalid Unit Name: {}", e),
            GenerationError::Conflict(e) => write!(f, "Conflict: {}", e),
            GenerationError::RetryExhausted(e) => write!(f, "Retry Exhausted: {}", e),
            GenerationError::CharybdisError(e) => write!(f, "Charybdis Error: \n{}", e),
            GenerationError::Database(e) => write!(f, "Database Error: {}", e),
            GenerationError::Internal(e) => write!(f, "Internal Error: {}", e),
        }
    }
}

impl Error for GenerationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GenerationError::CharybdisError(e) => Some(e),
            GenerationError::AlreadyExists(_) => None,
            GenerationError::NotFound(_) => None,
            GenerationError::AlreadyCompleted(_) => None,
            GenerationError::InvalidUnitName(_) => None,
            GenerationError::Conflict(_) => None,
            GenerationError::RetryExhausted(_) => None,
            GenerationError::Database(_) => None,
            GenerationError::Internal(_) => None,
        }
    }
}

impl GenerationError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, GenerationError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GenerationError::NotFound(_))
    }
}

impl From<CharybdisError> for GenerationError {
    fn from(e: CharybdisError) -> Self {
        match e {
            CharybdisError::NotFoundError(e) => GenerationError::NotFound(e.to_string()),
            _ => GenerationError::CharybdisError(e),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for GenerationError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        GenerationError::Internal(e.to_string())
    }
}
