//! Wire protocol envelope, encoding and decoding for hush.
//!
//! This crate defines the JSON messages exchanged with the remote noise
//! monitor: partial configuration patches sent by the client, and telemetry
//! or notification frames pushed by the device.
//!
//! ## Wire Format
//!
//! One JSON object per WebSocket text frame, UTF-8, no trailing newline.
//!
//! ```text
//! client -> device   { "soglia"?: number, "filtroAttivo"?: bool,
//!                      "nomeUtente"?: string, "azione"?: "manuale" | "automatica" }
//!
//! device -> client   { "db"?: number, "testo"?: string, "filtroAttivo"?: bool }
//!                  | { "tipo": "notifica", "rumore": number, "soglia": number }
//! ```
//!
//! Only the fields that change are present in a client patch; the handshake
//! sent right after the socket opens is the only full snapshot.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;

// Re-export main types
pub use codec::{decode, decode_patch, encode, encode_inbound, CodecError, MAX_FRAME_BYTES};
pub use error::DecodeError;
pub use message::{
    FilterOrigin, Inbound, Notification, OutboundPatch, PatchBuilder, Telemetry,
    NOTIFICATION_KIND,
};
