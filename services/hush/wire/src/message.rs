//! Message shapes for both directions of the link.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Value of the `tipo` marker carried by notification frames
pub const NOTIFICATION_KIND: &str = "notifica";

/// Who initiated a filter change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOrigin {
    /// The user pressed the filter button
    #[serde(rename = "manuale")]
    Manual,
    /// The client reacted to a device notification
    #[serde(rename = "automatica")]
    Automatic,
}

impl FilterOrigin {
    /// Wire spelling of the origin tag
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOrigin::Manual => "manuale",
            FilterOrigin::Automatic => "automatica",
        }
    }
}

impl fmt::Display for FilterOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial configuration patch sent by the client.
///
/// Absent fields are left out of the encoded object entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundPatch {
    /// Alarm threshold in dB(A)
    #[serde(
        rename = "soglia",
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_db"
    )]
    pub threshold: Option<f64>,
    /// Desired filter state
    #[serde(rename = "filtroAttivo", skip_serializing_if = "Option::is_none")]
    pub filter_active: Option<bool>,
    /// Display name of the operator
    #[serde(rename = "nomeUtente", skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Origin of a filter change
    #[serde(rename = "azione", skip_serializing_if = "Option::is_none")]
    pub action: Option<FilterOrigin>,
}

impl OutboundPatch {
    /// Full snapshot sent right after the socket opens
    pub fn handshake(threshold: f64, filter_active: bool, user_name: impl Into<String>) -> Self {
        PatchBuilder::new()
            .threshold(threshold)
            .filter_active(filter_active)
            .user_name(user_name)
            .build()
    }

    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        self.threshold.is_none()
            && self.filter_active.is_none()
            && self.user_name.is_none()
            && self.action.is_none()
    }
}

/// Fluent builder for [`OutboundPatch`]
#[derive(Debug, Clone, Default)]
pub struct PatchBuilder {
    patch: OutboundPatch,
}

impl PatchBuilder {
    /// Create an empty patch builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the threshold field
    pub fn threshold(mut self, value: f64) -> Self {
        self.patch.threshold = Some(value);
        self
    }

    /// Set the filter field
    pub fn filter_active(mut self, active: bool) -> Self {
        self.patch.filter_active = Some(active);
        self
    }

    /// Set the user name field
    pub fn user_name(mut self, name: impl Into<String>) -> Self {
        self.patch.user_name = Some(name.into());
        self
    }

    /// Set the action tag
    pub fn action(mut self, origin: FilterOrigin) -> Self {
        self.patch.action = Some(origin);
        self
    }

    /// Finish the patch
    pub fn build(self) -> OutboundPatch {
        self.patch
    }
}

/// Live data pushed by the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Measured sound level in dB(A)
    #[serde(
        rename = "db",
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_db"
    )]
    pub level: Option<f64>,
    /// Detected event description
    #[serde(rename = "testo", skip_serializing_if = "Option::is_none")]
    pub event_text: Option<String>,
    /// Filter state as seen by the device
    #[serde(rename = "filtroAttivo", skip_serializing_if = "Option::is_none")]
    pub filter_active: Option<bool>,
}

/// Threshold breach detected autonomously by the device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Noise level that triggered the notification
    #[serde(rename = "rumore")]
    pub level: f64,
    /// Threshold the device compared against
    #[serde(rename = "soglia")]
    pub threshold: f64,
}

/// Any frame the device may send
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Telemetry frame
    Telemetry(Telemetry),
    /// Notification frame
    Notification(Notification),
}

// Whole dB values go out as JSON integers, the way the device expects slider steps.
fn serialize_db<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 => {
            serializer.serialize_i64(*v as i64)
        }
        Some(v) => serializer.serialize_f64(*v),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_builder() {
        let patch = PatchBuilder::new()
            .filter_active(true)
            .action(FilterOrigin::Automatic)
            .build();

        assert_eq!(patch.filter_active, Some(true));
        assert_eq!(patch.action, Some(FilterOrigin::Automatic));
        assert!(patch.threshold.is_none());
        assert!(patch.user_name.is_none());
        assert!(!patch.is_empty());
        assert!(OutboundPatch::default().is_empty());
    }

    #[test]
    fn test_handshake_sets_all_three_fields() {
        let patch = OutboundPatch::handshake(85.0, false, "Mario");
        assert_eq!(patch.threshold, Some(85.0));
        assert_eq!(patch.filter_active, Some(false));
        assert_eq!(patch.user_name.as_deref(), Some("Mario"));
        assert!(patch.action.is_none());
    }

    #[test]
    fn test_origin_spelling() {
        assert_eq!(FilterOrigin::Manual.to_string(), "manuale");
        assert_eq!(
            serde_json::to_string(&FilterOrigin::Automatic).unwrap(),
            "\"automatica\""
        );
    }
}
