//! Wire protocol error types.

use thiserror::Error;

/// Errors produced while decoding an inbound frame
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Frame exceeds the accepted size
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    /// Payload is not valid JSON
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is JSON but not an object
    #[error("frame is not a json object")]
    NotAnObject,

    /// Marker field names a message kind we do not understand
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
}
