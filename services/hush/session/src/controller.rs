//! Session controller task.
//!
//! The controller is the only owner of the [`SessionMachine`]. Intents arrive
//! through a command mailbox, transport events through the transport channel;
//! both are applied in arrival order by one task. After every input the
//! controller drains side effects and publishes a fresh snapshot.

use crate::alert::Interrupt;
use crate::error::SessionError;
use crate::machine::{SessionMachine, SideEffect};
use crate::session::{SessionConfig, SessionSnapshot};
use crate::transport::{Transport, TransportEvent, WsTransport};
use hush_storage::{PreferenceStore, USER_NAME_KEY};
use hush_wire::FilterOrigin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply = oneshot::Sender<Result<SessionSnapshot, SessionError>>;

enum Command {
    Connect {
        endpoint: String,
        user_name: String,
        reply: Reply,
    },
    Disconnect {
        reply: Reply,
    },
    SetThreshold {
        value: f64,
        reply: Reply,
    },
    ToggleFilter {
        origin: FilterOrigin,
        reply: Reply,
    },
    Snapshot {
        reply: Reply,
    },
    Shutdown,
}

/// Actor that serializes every change to the session
pub struct SessionController<T: Transport> {
    machine: SessionMachine<T>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    store: Arc<dyn PreferenceStore>,
    snapshots: watch::Sender<SessionSnapshot>,
    interrupts: mpsc::UnboundedSender<Interrupt>,
}

impl<T: Transport> SessionController<T> {
    /// Build a controller around `transport` and the receiver of its events
    pub fn new(
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        store: Arc<dyn PreferenceStore>,
        config: &SessionConfig,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<Interrupt>) {
        let machine = SessionMachine::new(transport, config);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = watch::channel(machine.snapshot());
        let (interrupts_tx, interrupts_rx) = mpsc::unbounded_channel();

        let controller = Self {
            machine,
            events,
            commands: commands_rx,
            store,
            snapshots: snapshots_tx,
            interrupts: interrupts_tx,
        };
        let handle = SessionHandle {
            commands: commands_tx,
            snapshots: snapshots_rx,
        };
        (controller, handle, interrupts_rx)
    }

    /// Process inputs until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        self.restore_user_name().await;
        self.publish();
        info!("Session controller started");

        loop {
            let pending = tokio::select! {
                Some(event) = self.events.recv() => {
                    self.machine.handle_event(event);
                    None
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.apply(command),
                },
            };
            self.flush_effects();
            self.publish();

            // Reply last so callers observe the published snapshot
            if let Some((result, reply)) = pending {
                let _ = reply.send(result.map(|()| self.machine.snapshot()));
            }
        }

        self.machine.close_transport();
        info!("Session controller stopped");
    }

    async fn restore_user_name(&mut self) {
        match self.store.get(USER_NAME_KEY).await {
            Ok(Some(name)) => self.machine.restore_user_name(&name),
            Ok(None) => debug!("No stored user name"),
            Err(e) => warn!("Failed to read stored user name: {}", e),
        }
    }

    fn apply(&mut self, command: Command) -> Option<(Result<(), SessionError>, Reply)> {
        let (result, reply) = match command {
            Command::Connect {
                endpoint,
                user_name,
                reply,
            } => (self.machine.request_connect(&endpoint, &user_name), reply),
            Command::Disconnect { reply } => {
                self.machine.request_disconnect();
                (Ok(()), reply)
            }
            Command::SetThreshold { value, reply } => {
                (self.machine.set_threshold(value).map(|_| ()), reply)
            }
            Command::ToggleFilter { origin, reply } => {
                (self.machine.toggle_filter(origin).map(|_| ()), reply)
            }
            Command::Snapshot { reply } => (Ok(()), reply),
            Command::Shutdown => return None,
        };

        if let Err(e) = &result {
            debug!("Intent rejected: {}", e);
        }
        Some((result, reply))
    }

    fn flush_effects(&mut self) {
        for effect in self.machine.drain_effects() {
            match effect {
                SideEffect::PersistUserName(name) => {
                    let store = Arc::clone(&self.store);
                    tokio::spawn(async move {
                        if let Err(e) = store.set(USER_NAME_KEY, &name).await {
                            warn!("Failed to persist user name: {}", e);
                        }
                    });
                }
                SideEffect::Interrupt(interrupt) => {
                    if self.interrupts.send(interrupt).is_err() {
                        debug!("No interrupt listener");
                    }
                }
            }
        }
    }

    fn publish(&self) {
        let next = self.machine.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

impl SessionController<WsTransport> {
    /// Spawn a controller driving a WebSocket transport
    pub fn spawn(
        store: Arc<dyn PreferenceStore>,
        config: &SessionConfig,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Interrupt>, JoinHandle<()>) {
        let (transport, events) = WsTransport::channel();
        let transport = transport.with_connect_timeout(config.connect_timeout);
        let (controller, handle, interrupts) = Self::new(transport, events, store, config);
        let task = tokio::spawn(controller.run());
        (handle, interrupts, task)
    }
}

/// Cloneable front door to a running controller
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    async fn request(
        &self,
        build: impl FnOnce(Reply) -> Command,
    ) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::ControllerClosed)?;
        rx.await.map_err(|_| SessionError::ControllerClosed)?
    }

    /// Connect to `endpoint` as `user_name`
    pub async fn request_connect(
        &self,
        endpoint: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Result<SessionSnapshot, SessionError> {
        let endpoint = endpoint.into();
        let user_name = user_name.into();
        self.request(|reply| Command::Connect {
            endpoint,
            user_name,
            reply,
        })
        .await
    }

    /// Close the current connection
    pub async fn request_disconnect(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Change the alarm threshold
    pub async fn set_threshold(&self, value: f64) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::SetThreshold { value, reply })
            .await
    }

    /// Flip the filter on behalf of the user
    pub async fn toggle_filter(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::ToggleFilter {
            origin: FilterOrigin::Manual,
            reply,
        })
        .await
    }

    /// Snapshot read through the controller, after startup restore and every earlier request
    pub async fn current_snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every snapshot change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Ask the controller to close the link and stop
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionStatus;
    use crate::transport::mock::MockTransport;
    use crate::transport::{ConnectionId, TransportEventKind};
    use futures::{SinkExt, StreamExt};
    use async_trait::async_trait;
    use hush_storage::{MemoryStore, StorageError};
    use hush_wire::{decode_patch, OutboundPatch, PatchBuilder};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct Harness {
        handle: SessionHandle,
        interrupts: mpsc::UnboundedReceiver<Interrupt>,
        events: mpsc::UnboundedSender<TransportEvent>,
        transport: MockTransport,
        store: MemoryStore,
        task: JoinHandle<()>,
    }

    async fn harness(stored_name: Option<&str>) -> Harness {
        let store = MemoryStore::new();
        if let Some(name) = stored_name {
            store.set(USER_NAME_KEY, name).await.unwrap();
        }
        let transport = MockTransport::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (controller, handle, interrupts) = SessionController::new(
            transport.clone(),
            events_rx,
            Arc::new(store.clone()),
            &SessionConfig::default(),
        );
        let task = tokio::spawn(controller.run());
        Harness {
            handle,
            interrupts,
            events: events_tx,
            transport,
            store,
            task,
        }
    }

    /// Store whose every call fails
    struct BrokenStore;

    #[async_trait]
    impl PreferenceStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Backend("store offline".to_string()))
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Backend("store offline".to_string()))
        }
    }

    fn inject(harness: &Harness, id: ConnectionId, kind: TransportEventKind) {
        harness
            .events
            .send(TransportEvent {
                connection: id,
                kind,
            })
            .unwrap();
    }

    async fn wait_for(
        handle: &SessionHandle,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut rx = handle.subscribe();
        let result = timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for snapshot");
        let snapshot = result.expect("controller stopped").clone();
        snapshot
    }

    async fn stored_name(store: &MemoryStore) -> Option<String> {
        for _ in 0..100 {
            if let Some(name) = store.get(USER_NAME_KEY).await.unwrap() {
                return Some(name);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_restores_stored_user_name() {
        let harness = harness(Some("Anna")).await;
        let snapshot = wait_for(&harness.handle, |s| !s.user_name.is_empty()).await;
        assert_eq!(snapshot.user_name, "Anna");
        assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_current_snapshot_sees_restored_name() {
        let harness = harness(Some("Anna")).await;
        let snapshot = harness.handle.current_snapshot().await.unwrap();
        assert_eq!(snapshot.user_name, "Anna");
    }

    #[tokio::test]
    async fn test_failing_store_does_not_block_session() {
        let transport = MockTransport::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (controller, handle, _interrupts) = SessionController::new(
            transport.clone(),
            events_rx,
            Arc::new(BrokenStore),
            &SessionConfig::default(),
        );
        let task = tokio::spawn(controller.run());

        let snapshot = handle.current_snapshot().await.unwrap();
        assert_eq!(snapshot.user_name, "");

        handle.request_connect("127.0.0.1:8765", "Mario").await.unwrap();
        let id = transport.last_connection().unwrap();
        events_tx
            .send(TransportEvent {
                connection: id,
                kind: TransportEventKind::Opened,
            })
            .unwrap();
        let snapshot = wait_for(&handle, |s| s.status == ConnectionStatus::Connected).await;
        assert_eq!(snapshot.user_name, "Mario");
        assert_eq!(
            transport.sent_patches(),
            vec![OutboundPatch::handshake(85.0, false, "Mario")]
        );

        // The failed persist is only logged
        let snapshot = handle.set_threshold(60.0).await.unwrap();
        assert_eq!(snapshot.threshold, 60.0);

        handle.shutdown();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reply_follows_published_snapshot() {
        let harness = harness(None).await;
        for value in [40.0, 55.0, 70.0] {
            let replied = harness.handle.set_threshold(value).await.unwrap();
            assert_eq!(harness.handle.snapshot(), replied);
            assert_eq!(harness.handle.snapshot().threshold, value);
        }

        harness.handle.request_connect("127.0.0.1:8765", "Mario").await.unwrap();
        assert_eq!(
            harness.handle.snapshot().status,
            ConnectionStatus::Connecting
        );
    }

    #[tokio::test]
    async fn test_connect_handshake_and_persist() {
        let harness = harness(None).await;
        let snapshot = harness
            .handle
            .request_connect("127.0.0.1:8765", "Mario")
            .await
            .unwrap();
        assert_eq!(snapshot.status, ConnectionStatus::Connecting);

        let id = harness.transport.last_connection().unwrap();
        inject(&harness, id, TransportEventKind::Opened);
        wait_for(&harness.handle, |s| s.status == ConnectionStatus::Connected).await;

        assert_eq!(
            harness.transport.sent_patches(),
            vec![OutboundPatch::handshake(85.0, false, "Mario")]
        );
        assert_eq!(stored_name(&harness.store).await.as_deref(), Some("Mario"));
    }

    #[tokio::test]
    async fn test_rejected_intents_reply_with_error() {
        let harness = harness(None).await;
        assert!(harness.handle.request_connect("127.0.0.1:8765", " ").await.is_err());
        assert_eq!(
            harness.handle.toggle_filter().await,
            Err(SessionError::NotConnected)
        );
        assert_eq!(harness.transport.connect_count(), 0);

        let snapshot = harness.handle.set_threshold(20.0).await.unwrap();
        assert_eq!(snapshot.threshold, 30.0);
    }

    #[tokio::test]
    async fn test_notification_reaches_interrupt_channel() {
        let mut harness = harness(None).await;
        harness
            .handle
            .request_connect("127.0.0.1:8765", "Mario")
            .await
            .unwrap();
        let id = harness.transport.last_connection().unwrap();
        inject(&harness, id, TransportEventKind::Opened);
        inject(
            &harness,
            id,
            TransportEventKind::Message(r#"{"tipo":"notifica","rumore":72,"soglia":70}"#.to_string()),
        );

        let interrupt = timeout(Duration::from_secs(5), harness.interrupts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            interrupt,
            Interrupt::ThresholdBreach {
                level: 72.0,
                threshold: 70.0,
                filter_auto_enabled: true,
            }
        );
        assert!(harness.handle.snapshot().filter_active);
    }

    #[tokio::test]
    async fn test_shutdown_closes_transport() {
        let harness = harness(None).await;
        harness
            .handle
            .request_connect("127.0.0.1:8765", "Mario")
            .await
            .unwrap();
        harness.handle.shutdown();
        timeout(Duration::from_secs(5), harness.task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(harness.transport.close_count(), 1);
        assert_eq!(
            harness.handle.request_disconnect().await,
            Err(SessionError::ControllerClosed)
        );
    }

    #[tokio::test]
    async fn test_session_against_loopback_device() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let device = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut received = Vec::new();

            let handshake = ws.next().await.unwrap().unwrap();
            received.push(decode_patch(handshake.to_text().unwrap()).unwrap());

            ws.send(WsMessage::Text(r#"{"db":45.3,"testo":"click"}"#.to_string()))
                .await
                .unwrap();
            ws.send(WsMessage::Text(
                r#"{"tipo":"notifica","rumore":72,"soglia":70}"#.to_string(),
            ))
            .await
            .unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    WsMessage::Text(text) => received.push(decode_patch(&text).unwrap()),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            received
        });

        let store: Arc<dyn PreferenceStore> = Arc::new(MemoryStore::new());
        let (handle, mut interrupts, task) =
            SessionController::spawn(Arc::clone(&store), &SessionConfig::default());

        handle
            .request_connect(addr.to_string(), "Mario")
            .await
            .unwrap();
        let snapshot = wait_for(&handle, |s| s.filter_active).await;
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.last_measured_level, Some(45.3));
        assert_eq!(snapshot.event_log, vec!["click"]);

        let interrupt = timeout(Duration::from_secs(5), interrupts.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(interrupt, Interrupt::ThresholdBreach { .. }));

        handle.request_disconnect().await.unwrap();
        let snapshot = wait_for(&handle, |s| s.status == ConnectionStatus::Disconnected).await;
        assert!(!snapshot.filter_active);

        let received = timeout(Duration::from_secs(5), device).await.unwrap().unwrap();
        assert_eq!(
            received,
            vec![
                OutboundPatch::handshake(85.0, false, "Mario"),
                PatchBuilder::new()
                    .filter_active(true)
                    .action(FilterOrigin::Automatic)
                    .build(),
            ]
        );

        handle.shutdown();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
