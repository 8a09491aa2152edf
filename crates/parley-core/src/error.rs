//! Error types for the messaging core.

use crate::rooms::RoomError;
use parley_broker::BrokerError;
use parley_protocol::ErrorCode;
use thiserror::Error;

/// How an error should be treated at the connection boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid input. The connection stays open.
    Validation,
    /// Acting on something this connection may not touch.
    Authorization,
    /// Broker timeout, outage or unreadable stored data.
    Infrastructure,
    /// Identity could not be established. The connection is terminated.
    Fatal,
}

/// Messaging core errors.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Invalid request input.
    #[error("{0}")]
    Validation(String),

    /// Operation not permitted for this connection.
    #[error("{0}")]
    Forbidden(String),

    /// No verified identity was attached to the connection.
    #[error("Unauthorized")]
    Unauthenticated,

    /// Connection-layer room failure.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// Broker failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Stored data could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ChatError::Forbidden(message.into())
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Validation(_) | ChatError::Room(_) => ErrorKind::Validation,
            ChatError::Forbidden(_) => ErrorKind::Authorization,
            ChatError::Unauthenticated => ErrorKind::Fatal,
            ChatError::Broker(_) | ChatError::Corrupt(_) => ErrorKind::Infrastructure,
        }
    }

    /// Client-facing error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self.kind() {
            ErrorKind::Validation => ErrorCode::Validation,
            ErrorKind::Authorization | ErrorKind::Fatal => ErrorCode::Forbidden,
            ErrorKind::Infrastructure => ErrorCode::Unavailable,
        }
    }
}
