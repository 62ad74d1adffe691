//! Encoding and decoding for the wire protocol.
//!
//! Decoding never panics and never tears down the link: every malformed
//! payload maps to a [`DecodeError`] the caller can log and drop.

use crate::error::DecodeError;
use crate::message::{Inbound, Notification, OutboundPatch, Telemetry, NOTIFICATION_KIND};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::trace;

/// Largest inbound frame we accept (64 KiB)
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Name of the field that discriminates notification frames
const KIND_FIELD: &str = "tipo";

/// Codec errors on the encoding side
#[derive(Error, Debug)]
pub enum CodecError {
    /// Serialization failed
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Encode a client patch as a compact JSON object
pub fn encode(patch: &OutboundPatch) -> Result<String, CodecError> {
    let raw = serde_json::to_string(patch)?;
    trace!("Encoded patch: {}", raw);
    Ok(raw)
}

/// Decode a device frame into telemetry or a notification
pub fn decode(raw: &str) -> Result<Inbound, DecodeError> {
    let object = parse_object(raw)?;

    match object.get(KIND_FIELD) {
        None | Some(Value::Null) => {
            let telemetry: Telemetry = serde_json::from_value(Value::Object(object))?;
            Ok(Inbound::Telemetry(telemetry))
        }
        Some(Value::String(kind)) if kind == NOTIFICATION_KIND => {
            let notification: Notification = serde_json::from_value(Value::Object(object))?;
            Ok(Inbound::Notification(notification))
        }
        Some(other) => Err(DecodeError::UnknownKind(match other {
            Value::String(s) => s.clone(),
            v => v.to_string(),
        })),
    }
}

/// Decode a client patch (the device's view of an outbound frame)
pub fn decode_patch(raw: &str) -> Result<OutboundPatch, DecodeError> {
    let object = parse_object(raw)?;
    Ok(serde_json::from_value(Value::Object(object))?)
}

/// Encode a device frame, used by peers that play the device role
pub fn encode_inbound(inbound: &Inbound) -> Result<String, CodecError> {
    let value = match inbound {
        Inbound::Telemetry(telemetry) => serde_json::to_value(telemetry)?,
        Inbound::Notification(notification) => {
            let mut value = serde_json::to_value(notification)?;
            if let Value::Object(map) = &mut value {
                map.insert(
                    KIND_FIELD.to_string(),
                    Value::String(NOTIFICATION_KIND.to_string()),
                );
            }
            value
        }
    };
    Ok(serde_json::to_string(&value)?)
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, DecodeError> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::TooLarge(raw.len()));
    }

    match serde_json::from_str::<Value>(raw)? {
        Value::Object(object) => Ok(object),
        _ => Err(DecodeError::NotAnObject),
    }
}
