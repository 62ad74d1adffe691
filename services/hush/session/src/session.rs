//! Client-side session state.
//!
//! `Session` is the single owner of everything the display shows. It is only
//! ever mutated by the state machine, one input at a time; the presentation
//! layer receives read-only [`SessionSnapshot`]s.

use crate::error::ValidationError;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Lowest accepted alarm threshold in dB(A)
pub const MIN_THRESHOLD: f64 = 30.0;
/// Highest accepted alarm threshold in dB(A)
pub const MAX_THRESHOLD: f64 = 85.0;
/// Threshold a fresh session starts with
pub const DEFAULT_THRESHOLD: f64 = MAX_THRESHOLD;
/// Default number of retained event log entries
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 500;

/// Clamp a requested threshold into the accepted range
pub fn clamp_threshold(value: f64) -> Result<f64, ValidationError> {
    if value.is_nan() {
        return Err(ValidationError::ThresholdNotANumber);
    }
    Ok(value.clamp(MIN_THRESHOLD, MAX_THRESHOLD))
}

/// Link status as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No link, no attempt in flight
    Disconnected,
    /// Connect requested, socket not open yet
    Connecting,
    /// Socket open and handshake sent
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Configuration for a session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Number of event log entries kept before the oldest is evicted
    pub event_log_capacity: usize,
    /// Give up on a connect attempt after this long (disabled when `None`)
    pub connect_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
            connect_timeout: None,
        }
    }
}

/// Read-only view of the session handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Link status
    pub status: ConnectionStatus,
    /// Operator display name
    pub user_name: String,
    /// Alarm threshold in dB(A)
    pub threshold: f64,
    /// Whether the acoustic filter is on
    pub filter_active: bool,
    /// Most recent measured level in dB(A)
    pub last_measured_level: Option<f64>,
    /// Event descriptions, oldest first
    pub event_log: Vec<String>,
    /// Last transport error, if any
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    /// True when the last measured level is at or above the threshold
    pub fn threshold_exceeded(&self) -> bool {
        self.last_measured_level
            .map(|level| level >= self.threshold)
            .unwrap_or(false)
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Session::new(&SessionConfig::default()).snapshot()
    }
}

/// Mutable session state
#[derive(Debug)]
pub struct Session {
    pub(crate) status: ConnectionStatus,
    pub(crate) user_name: String,
    pub(crate) threshold: f64,
    pub(crate) filter_active: bool,
    pub(crate) last_measured_level: Option<f64>,
    pub(crate) last_error: Option<String>,
    event_log: VecDeque<String>,
    event_log_capacity: usize,
}

impl Session {
    /// Create a session with process-start defaults
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            user_name: String::new(),
            threshold: DEFAULT_THRESHOLD,
            filter_active: false,
            last_measured_level: None,
            last_error: None,
            event_log: VecDeque::new(),
            event_log_capacity: config.event_log_capacity.max(1),
        }
    }

    /// Current link status
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Append an event, evicting the oldest entry when full
    pub(crate) fn push_event(&mut self, text: String) {
        if self.event_log.len() == self.event_log_capacity {
            self.event_log.pop_front();
        }
        self.event_log.push_back(text);
    }

    /// Drop link-scoped state after the socket closed
    pub(crate) fn reset_link_state(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.filter_active = false;
        self.last_measured_level = None;
    }

    /// Copy out the presentation view
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            user_name: self.user_name.clone(),
            threshold: self.threshold,
            filter_active: self.filter_active,
            last_measured_level: self.last_measured_level,
            event_log: self.event_log.iter().cloned().collect(),
            last_error: self.last_error.clone(),
        }
    }
}
