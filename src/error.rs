//! Error types for the change feed.

use crate::bus::CloseReason;
use thiserror::Error;

/// Main error type for feed operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Change source invalidated: {0}")]
    SourceInvalidated(String),

    #[error("Change source exhausted")]
    SourceExhausted,

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Session closed: {0:?}")]
    SessionClosed(CloseReason),

    #[error("Feed pump thread panicked")]
    PumpPanicked,

    #[error("Feed has been shut down")]
    ShutDown,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for FeedError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;
