//! WebSocket transport for the device link.
//!
//! The transport owns at most one physical connection. Every connection is
//! driven by its own task which reports back through a single ordered event
//! channel; each event carries the [`ConnectionId`] it belongs to so the state
//! machine can discard events from a connection it already abandoned.

use crate::error::ValidationError;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Identifier of one connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Validated WebSocket endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: String,
}

impl Endpoint {
    /// Parse `ws://host:port[/path]` or a bare `host:port`
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::InvalidEndpoint(
                "endpoint is empty".to_string(),
            ));
        }

        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("ws://{}", trimmed)
        };

        let url = Url::parse(&candidate)
            .map_err(|e| ValidationError::InvalidEndpoint(format!("{}: {}", trimmed, e)))?;

        if url.scheme() != "ws" {
            return Err(ValidationError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(ValidationError::InvalidEndpoint(format!(
                "{}: missing host",
                trimmed
            )));
        }

        Ok(Self {
            url: url.to_string(),
        })
    }

    /// Full URL
    pub fn as_str(&self) -> &str {
        &self.url
    }
}

impl FromStr for Endpoint {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Failures reported by the link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Socket could not be opened
    #[error("connect failed: {0}")]
    Connect(String),
    /// Frame could not be written
    #[error("send failed: {0}")]
    Send(String),
    /// Read side failed
    #[error("receive failed: {0}")]
    Receive(String),
    /// Connect attempt took too long
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

/// What happened on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// Socket is open
    Opened,
    /// A text payload arrived
    Message(String),
    /// The link reported an error
    Error(TransportError),
    /// Socket is gone; always the last event of a connection
    Closed,
}

/// Event tagged with its connection
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    /// Connection the event belongs to
    pub connection: ConnectionId,
    /// Event payload
    pub kind: TransportEventKind,
}

/// Link to the device as seen by the state machine
pub trait Transport: Send {
    /// Start a connection, closing any previous one first
    fn connect(&mut self, endpoint: &Endpoint) -> ConnectionId;
    /// Queue a text frame on the active connection
    fn send(&mut self, frame: String);
    /// Close the active connection, if any
    fn close(&mut self);
}

enum Outgoing {
    Frame(String),
    Close,
}

struct ActiveConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outgoing>,
}

/// `Transport` over `tokio-tungstenite`
pub struct WsTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    next_id: u64,
    active: Option<ActiveConnection>,
    connect_timeout: Option<Duration>,
}

impl WsTransport {
    /// Create a transport and the receiver its events are delivered to
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            events,
            next_id: 0,
            active: None,
            connect_timeout: None,
        };
        (transport, rx)
    }

    /// Abort connect attempts that take longer than `timeout`
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Transport for WsTransport {
    fn connect(&mut self, endpoint: &Endpoint) -> ConnectionId {
        self.close();

        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let sink = EventSink {
            connection: id,
            events: self.events.clone(),
        };

        info!("Connecting {} to {}", id, endpoint);
        tokio::spawn(run_connection(
            endpoint.as_str().to_string(),
            self.connect_timeout,
            outbound_rx,
            sink,
        ));

        self.active = Some(ActiveConnection { id, outbound });
        id
    }

    fn send(&mut self, frame: String) {
        match &self.active {
            Some(active) => {
                if active.outbound.send(Outgoing::Frame(frame)).is_err() {
                    debug!("Connection {} already finished, frame dropped", active.id);
                }
            }
            None => debug!("No active connection, frame dropped"),
        }
    }

    fn close(&mut self) {
        if let Some(active) = self.active.take() {
            debug!("Closing connection {}", active.id);
            let _ = active.outbound.send(Outgoing::Close);
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct EventSink {
    connection: ConnectionId,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    fn emit(&self, kind: TransportEventKind) {
        let event = TransportEvent {
            connection: self.connection,
            kind,
        };
        if self.events.send(event).is_err() {
            trace!("Event listener gone for {}", self.connection);
        }
    }
}

async fn run_connection(
    url: String,
    connect_timeout: Option<Duration>,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
    sink: EventSink,
) {
    let attempt = async {
        let connecting = connect_async(url.as_str());
        let result = match connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, connecting).await {
                Ok(result) => result,
                Err(_) => return Err(TransportError::Timeout(limit)),
            },
            None => connecting.await,
        };
        result
            .map(|(stream, _response)| stream)
            .map_err(|e| TransportError::Connect(e.to_string()))
    };

    let stream = tokio::select! {
        result = attempt => match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Connection {} to {} failed: {}", sink.connection, url, e);
                sink.emit(TransportEventKind::Error(e));
                sink.emit(TransportEventKind::Closed);
                return;
            }
        },
        _ = wait_for_close(&mut outbound) => {
            debug!("Connection {} cancelled while connecting", sink.connection);
            sink.emit(TransportEventKind::Closed);
            return;
        }
    };

    info!("Connection {} open", sink.connection);
    sink.emit(TransportEventKind::Opened);

    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            incoming = reader.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    trace!("Connection {} received {} bytes", sink.connection, text.len());
                    sink.emit(TransportEventKind::Message(text));
                }
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => sink.emit(TransportEventKind::Message(text)),
                    Err(_) => warn!("Connection {} dropped a non UTF-8 binary frame", sink.connection),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!("Connection {} closed by peer: {:?}", sink.connection, frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) | None => break,
                Some(Err(e)) => {
                    sink.emit(TransportEventKind::Error(TransportError::Receive(e.to_string())));
                    break;
                }
            },
            command = outbound.recv() => match command {
                Some(Outgoing::Frame(text)) => {
                    trace!("Connection {} sending {}", sink.connection, text);
                    if let Err(e) = writer.send(WsMessage::Text(text)).await {
                        sink.emit(TransportEventKind::Error(TransportError::Send(e.to_string())));
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    if let Err(e) = writer.close().await {
                        debug!("Connection {} close handshake failed: {}", sink.connection, e);
                    }
                    break;
                }
            },
        }
    }

    info!("Connection {} closed", sink.connection);
    sink.emit(TransportEventKind::Closed);
}

async fn wait_for_close(outbound: &mut mpsc::UnboundedReceiver<Outgoing>) {
    loop {
        match outbound.recv().await {
            Some(Outgoing::Frame(_)) => debug!("Frame queued before the socket opened, dropped"),
            Some(Outgoing::Close) | None => return,
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use hush_wire::{decode_patch, OutboundPatch};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub(crate) struct MockLog {
        pub(crate) next_id: u64,
        pub(crate) connects: Vec<(ConnectionId, String)>,
        pub(crate) sent: Vec<String>,
        pub(crate) closes: usize,
    }

    /// Records every call; events are injected by the test
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MockTransport {
        log: Arc<Mutex<MockLog>>,
    }

    impl MockTransport {
        pub(crate) fn connect_count(&self) -> usize {
            self.log.lock().unwrap().connects.len()
        }

        pub(crate) fn close_count(&self) -> usize {
            self.log.lock().unwrap().closes
        }

        pub(crate) fn last_connection(&self) -> Option<ConnectionId> {
            self.log.lock().unwrap().connects.last().map(|(id, _)| *id)
        }

        pub(crate) fn last_endpoint(&self) -> Option<String> {
            self.log.lock().unwrap().connects.last().map(|(_, url)| url.clone())
        }

        pub(crate) fn sent_patches(&self) -> Vec<OutboundPatch> {
            self.log
                .lock()
                .unwrap()
                .sent
                .iter()
                .map(|raw| decode_patch(raw).unwrap())
                .collect()
        }
    }

    impl Transport for MockTransport {
        fn connect(&mut self, endpoint: &Endpoint) -> ConnectionId {
            let mut log = self.log.lock().unwrap();
            log.next_id += 1;
            let id = ConnectionId(log.next_id);
            log.connects.push((id, endpoint.as_str().to_string()));
            id
        }

        fn send(&mut self, frame: String) {
            self.log.lock().unwrap().sent.push(frame);
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("127.0.0.1:8765").unwrap();
        assert_eq!(endpoint.as_str(), "ws://127.0.0.1:8765/");

        let endpoint: Endpoint = " ws://device.local:9000/noise ".parse().unwrap();
        assert_eq!(endpoint.as_str(), "ws://device.local:9000/noise");

        let endpoint = Endpoint::parse("ws://192.168.1.50").unwrap();
        assert_eq!(endpoint.to_string(), "ws://192.168.1.50/");
    }

    #[test]
    fn test_endpoint_rejects_bad_input() {
        assert!(matches!(
            Endpoint::parse("   "),
            Err(ValidationError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("http://127.0.0.1:8765"),
            Err(ValidationError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("127.0.0.1:notaport"),
            Err(ValidationError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_loopback_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            ws.send(WsMessage::Text(r#"{"db":45.3}"#.to_string()))
                .await
                .unwrap();
            ws.send(WsMessage::Binary(br#"{"testo":"click"}"#.to_vec()))
                .await
                .unwrap();
            // Drain until the client closes
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
            first
        });

        let (mut transport, mut rx) = WsTransport::channel();
        let endpoint = Endpoint::parse(&addr.to_string()).unwrap();
        let id = transport.connect(&endpoint);

        let event = next_event(&mut rx).await;
        assert_eq!(event.connection, id);
        assert_eq!(event.kind, TransportEventKind::Opened);

        transport.send(r#"{"soglia":85}"#.to_string());

        assert_eq!(
            next_event(&mut rx).await.kind,
            TransportEventKind::Message(r#"{"db":45.3}"#.to_string())
        );
        assert_eq!(
            next_event(&mut rx).await.kind,
            TransportEventKind::Message(r#"{"testo":"click"}"#.to_string())
        );

        transport.close();
        transport.close();
        assert_eq!(next_event(&mut rx).await.kind, TransportEventKind::Closed);

        let first = server.await.unwrap();
        assert_eq!(first, WsMessage::Text(r#"{"soglia":85}"#.to_string()));
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error_then_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut transport, mut rx) = WsTransport::channel();
        let id = transport.connect(&Endpoint::parse(&addr.to_string()).unwrap());

        let event = next_event(&mut rx).await;
        assert_eq!(event.connection, id);
        assert!(matches!(
            event.kind,
            TransportEventKind::Error(TransportError::Connect(_))
        ));
        assert_eq!(next_event(&mut rx).await.kind, TransportEventKind::Closed);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // Accepts TCP but never answers the upgrade
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let (transport, mut rx) = WsTransport::channel();
        let mut transport = transport.with_connect_timeout(Some(Duration::from_millis(100)));
        transport.connect(&Endpoint::parse(&addr.to_string()).unwrap());

        assert_eq!(
            next_event(&mut rx).await.kind,
            TransportEventKind::Error(TransportError::Timeout(Duration::from_millis(100)))
        );
        assert_eq!(next_event(&mut rx).await.kind, TransportEventKind::Closed);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let (mut transport, mut rx) = WsTransport::channel();
        let first = transport.connect(&Endpoint::parse(&addr.to_string()).unwrap());
        transport.close();

        let event = next_event(&mut rx).await;
        assert_eq!(event.connection, first);
        assert_eq!(event.kind, TransportEventKind::Closed);
    }

    #[tokio::test]
    async fn test_send_without_connection_is_silent() {
        let (mut transport, mut rx) = WsTransport::channel();
        transport.send("{}".to_string());
        transport.close();
        assert!(rx.try_recv().is_err());
    }
}
