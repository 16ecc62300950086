//! Error taxonomy of the engine.

use huddle_protocol::{codes, Event};
use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A referenced room, message or user does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The actor is not allowed to do this.
    #[error("{0}")]
    Forbidden(String),

    /// The request is malformed or misses a required field.
    #[error("{0}")]
    Validation(String),

    /// Database failure.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// File storage failure.
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// The engine task is gone.
    #[error("Engine unavailable")]
    Unavailable,
}

impl CoreError {
    pub(crate) fn room_not_found() -> Self {
        CoreError::NotFound("Room does not exist.".to_string())
    }

    pub(crate) fn user_not_found(user_id: &str) -> Self {
        CoreError::NotFound(format!("User {user_id} does not exist."))
    }

    pub(crate) fn message_not_found() -> Self {
        CoreError::NotFound("Message does not exist.".to_string())
    }

    pub(crate) fn not_in_room() -> Self {
        CoreError::Forbidden("You are not in a room.".to_string())
    }

    pub(crate) fn host_only() -> Self {
        CoreError::Forbidden("Only the Host can do that.".to_string())
    }

    /// Wire error code.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            CoreError::NotFound(_) => codes::NOT_FOUND,
            CoreError::Forbidden(_) => codes::FORBIDDEN,
            CoreError::Validation(_) => codes::VALIDATION,
            CoreError::Store(_) | CoreError::Storage(_) => codes::INTERNAL,
            CoreError::Unavailable => codes::UNAVAILABLE,
        }
    }

    /// Whether the error is caused by the request rather than the server.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CoreError::NotFound(_) | CoreError::Forbidden(_) | CoreError::Validation(_)
        )
    }

    /// The error event sent to the originating connection.
    ///
    /// Internal failures are not described to clients.
    #[must_use]
    pub fn to_event(&self) -> Event {
        let message = if self.is_client_error() || matches!(self, CoreError::Unavailable) {
            self.to_string()
        } else {
            "Internal error".to_string()
        };
        Event::error(self.code(), message)
    }
}

/// Result alias for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;
