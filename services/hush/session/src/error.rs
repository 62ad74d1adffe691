//! Error taxonomy for session intents.

use crate::session::ConnectionStatus;
use thiserror::Error;

/// Input rejected before any I/O happens
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// User name is empty or whitespace
    #[error("user name must not be empty")]
    EmptyUserName,
    /// Threshold is NaN
    #[error("threshold must be a number")]
    ThresholdNotANumber,
    /// Endpoint string cannot be used
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Errors returned by session intents
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Input failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Intent needs a live link
    #[error("not connected")]
    NotConnected,
    /// A connection is already pending or open
    #[error("a connection is already {0}")]
    AlreadyActive(ConnectionStatus),
    /// The controller task has stopped
    #[error("session controller is not running")]
    ControllerClosed,
}
