//! Router Error Types

use thiserror::Error;
use tmx_common::{ConcurrencyError, CursorError};
use tmx_queue::QueueError;
use tmx_store::StoreError;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    #[error("{entity_type} already exists: {id}")]
    AlreadyExists { entity_type: String, id: String },

    #[error("Broker error: {0}")]
    Broker(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Processing error: {message}")]
    Processing { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse classification used at the HTTP boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Dependency,
    Processing,
    Internal,
}

impl RouterError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    pub fn already_exists(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::AlreadyExists {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::Conflict,
            Self::Broker(_) | Self::Store(_) => ErrorKind::Dependency,
            Self::Processing { .. } => ErrorKind::Processing,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<CursorError> for RouterError {
    fn from(err: CursorError) -> Self {
        Self::validation(err.to_string())
    }
}

impl From<ConcurrencyError> for RouterError {
    fn from(err: ConcurrencyError) -> Self {
        Self::validation(err.to_string())
    }
}
