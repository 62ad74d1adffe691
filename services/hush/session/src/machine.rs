//! Session state machine.
//!
//! `SessionMachine` applies intents and transport events to the [`Session`]
//! one at a time. It owns the transport; everything that must happen outside
//! (persisting the user name, showing an interrupt) is queued as a
//! [`SideEffect`] for the controller to drain.

use crate::alert::{AlertPolicy, Interrupt};
use crate::error::{SessionError, ValidationError};
use crate::session::{clamp_threshold, ConnectionStatus, Session, SessionConfig, SessionSnapshot};
use crate::transport::{ConnectionId, Endpoint, Transport, TransportEvent, TransportEventKind};
use hush_wire::{decode, encode, FilterOrigin, Inbound, Notification, OutboundPatch, PatchBuilder, Telemetry};
use tracing::{debug, error, info, warn};

/// Work the machine asks its owner to perform
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Store the user name in the preference store
    PersistUserName(String),
    /// Show a blocking interrupt
    Interrupt(Interrupt),
}

#[derive(Debug, Clone, Copy)]
struct ActiveLink {
    id: ConnectionId,
    closing: bool,
}

/// Applies intents and transport events to the session
pub struct SessionMachine<T: Transport> {
    session: Session,
    transport: T,
    policy: AlertPolicy,
    active: Option<ActiveLink>,
    effects: Vec<SideEffect>,
    dropped_frames: u64,
}

impl<T: Transport> SessionMachine<T> {
    /// Create a machine in the `Disconnected` state
    pub fn new(transport: T, config: &SessionConfig) -> Self {
        Self {
            session: Session::new(config),
            transport,
            policy: AlertPolicy,
            active: None,
            effects: Vec::new(),
            dropped_frames: 0,
        }
    }

    /// Seed the user name read from the preference store at startup
    pub fn restore_user_name(&mut self, name: &str) {
        let name = name.trim();
        if !name.is_empty() {
            debug!("Restored user name '{}'", name);
            self.session.user_name = name.to_string();
        }
    }

    /// Start a connection to `endpoint` as `user_name`
    pub fn request_connect(&mut self, endpoint: &str, user_name: &str) -> Result<(), SessionError> {
        let user_name = user_name.trim();
        if user_name.is_empty() {
            return Err(ValidationError::EmptyUserName.into());
        }
        if self.session.status != ConnectionStatus::Disconnected {
            return Err(SessionError::AlreadyActive(self.session.status));
        }
        let endpoint = Endpoint::parse(endpoint)?;

        self.session.user_name = user_name.to_string();
        self.session.last_error = None;
        self.session.status = ConnectionStatus::Connecting;

        let id = self.transport.connect(&endpoint);
        info!("Connecting to {} as '{}' ({})", endpoint, user_name, id);
        self.active = Some(ActiveLink { id, closing: false });
        Ok(())
    }

    /// Close the current connection; the status changes once it is closed
    pub fn request_disconnect(&mut self) {
        match self.active.as_mut() {
            Some(link) if !link.closing => {
                info!("Disconnecting {}", link.id);
                link.closing = true;
                self.transport.close();
            }
            Some(link) => debug!("Disconnect already in progress for {}", link.id),
            None => debug!("Disconnect requested with no connection"),
        }
    }

    /// Store a clamped threshold and forward it when connected
    pub fn set_threshold(&mut self, value: f64) -> Result<f64, SessionError> {
        let threshold = clamp_threshold(value)?;
        self.session.threshold = threshold;

        if self.is_live() {
            self.send(PatchBuilder::new().threshold(threshold).build());
        } else {
            debug!("Threshold {} stored for the next handshake", threshold);
        }
        Ok(threshold)
    }

    /// Flip the filter and tell the device who did it
    pub fn toggle_filter(&mut self, origin: FilterOrigin) -> Result<bool, SessionError> {
        if !self.is_live() {
            return Err(SessionError::NotConnected);
        }

        let active = !self.session.filter_active;
        self.session.filter_active = active;
        info!("Filter {} ({})", if active { "on" } else { "off" }, origin);
        self.send(PatchBuilder::new().filter_active(active).action(origin).build());
        Ok(active)
    }

    /// Apply one transport event
    pub fn handle_event(&mut self, event: TransportEvent) {
        let link = match self.active {
            Some(link) if link.id == event.connection => link,
            _ => {
                debug!("Ignoring {:?} from stale connection {}", event.kind, event.connection);
                return;
            }
        };

        match event.kind {
            TransportEventKind::Opened if link.closing => {
                debug!("Connection {} opened after disconnect was requested", link.id);
            }
            TransportEventKind::Opened => self.on_opened(),
            TransportEventKind::Message(_) if link.closing => {
                debug!("Dropping message for closing connection {}", link.id);
            }
            TransportEventKind::Message(raw) => self.on_message(&raw),
            TransportEventKind::Error(e) => {
                warn!("Connection {} error: {}", link.id, e);
                let reason = e.to_string();
                self.session.last_error = Some(reason.clone());
                self.effects
                    .push(SideEffect::Interrupt(Interrupt::ConnectionFailure { reason }));
            }
            TransportEventKind::Closed => {
                info!("Connection {} closed", link.id);
                self.active = None;
                self.session.reset_link_state();
            }
        }
    }

    /// Take the side effects queued since the last call
    pub fn drain_effects(&mut self) -> Vec<SideEffect> {
        std::mem::take(&mut self.effects)
    }

    /// Current presentation view
    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Current link status
    pub fn status(&self) -> ConnectionStatus {
        self.session.status()
    }

    /// Number of inbound frames that failed to decode
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Close whatever is open; used on shutdown
    pub fn close_transport(&mut self) {
        self.transport.close();
    }

    fn is_live(&self) -> bool {
        self.session.status == ConnectionStatus::Connected
            && self.active.map(|link| !link.closing).unwrap_or(false)
    }

    fn on_opened(&mut self) {
        if self.session.status != ConnectionStatus::Connecting {
            warn!("Unexpected open while {}", self.session.status);
            return;
        }
        self.session.status = ConnectionStatus::Connected;
        info!("Connected as '{}'", self.session.user_name);

        self.send(OutboundPatch::handshake(
            self.session.threshold,
            self.session.filter_active,
            self.session.user_name.clone(),
        ));
        self.effects
            .push(SideEffect::PersistUserName(self.session.user_name.clone()));
    }

    fn on_message(&mut self, raw: &str) {
        if self.session.status != ConnectionStatus::Connected {
            debug!("Message while {}, dropped", self.session.status);
            return;
        }

        match decode(raw) {
            Ok(Inbound::Telemetry(telemetry)) => self.apply_telemetry(telemetry),
            Ok(Inbound::Notification(notification)) => self.apply_notification(notification),
            Err(e) => {
                self.dropped_frames += 1;
                warn!("Dropping undecodable frame: {}", e);
            }
        }
    }

    fn apply_telemetry(&mut self, telemetry: Telemetry) {
        if let Some(level) = telemetry.level {
            self.session.last_measured_level = Some(level);
        }
        if let Some(text) = telemetry.event_text {
            if !text.is_empty() {
                self.session.push_event(text);
            }
        }
        if let Some(active) = telemetry.filter_active {
            self.session.filter_active = active;
        }
    }

    fn apply_notification(&mut self, notification: Notification) {
        info!(
            "Device reported {} dB(A) over threshold {}",
            notification.level, notification.threshold
        );
        let decision = self
            .policy
            .on_notification(&notification, self.session.filter_active);

        let mut filter_auto_enabled = false;
        if decision.auto_enable_filter {
            match self.toggle_filter(FilterOrigin::Automatic) {
                Ok(active) => filter_auto_enabled = active,
                Err(e) => warn!("Automatic filter activation failed: {}", e),
            }
        }
        if decision.must_interrupt {
            self.effects
                .push(SideEffect::Interrupt(Interrupt::ThresholdBreach {
                    level: notification.level,
                    threshold: notification.threshold,
                    filter_auto_enabled,
                }));
        }
    }

    fn send(&mut self, patch: OutboundPatch) {
        match encode(&patch) {
            Ok(frame) => {
                debug!("Sending {}", frame);
                self.transport.send(frame);
            }
            Err(e) => error!("Failed to encode {:?}: {}", patch, e),
        }
    }
}
