//! Error taxonomy for the sync core.
//!
//! Every failure is reported to the requesting connection only. A failed
//! request never commits partial state and never produces a broadcast.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::store::StoreError;

/// Wire-level error code sent back in `ServerMessage::Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidOptions,
    Unauthorized,
    Validation,
    Conflict,
    NotFound,
    StoreUnavailable,
    ConnectionClosed,
    Protocol,
}

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid load options: {0}")]
    InvalidOptions(String),

    #[error("Unauthorized: {principal} may not {action} topic {topic}")]
    Unauthorized {
        principal: String,
        action: &'static str,
        topic: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SyncError {
    /// Error code carried on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::InvalidOptions(_) => ErrorKind::InvalidOptions,
            SyncError::Unauthorized { .. } => ErrorKind::Unauthorized,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            SyncError::ConnectionClosed => ErrorKind::ConnectionClosed,
            SyncError::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => SyncError::NotFound(key),
            StoreError::Conflict(key) => SyncError::Conflict(key),
            StoreError::Validation(msg) => SyncError::Validation(msg),
            StoreError::Unavailable(msg) => SyncError::StoreUnavailable(msg),
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
