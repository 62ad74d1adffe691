//! WebSocket link, session state machine and controller for hush.
//!
//! This crate keeps the client-side model of a noise-monitoring device in
//! sync with the device over a single WebSocket connection.
//!
//! ## Features
//!
//! - **Transport**: one `tokio-tungstenite` connection at a time, events tagged per connection
//! - **State machine**: `Disconnected → Connecting → Connected`, optimistic local updates
//! - **Alert policy**: device notifications raise an interrupt and switch the filter on
//! - **Controller**: single task owning the session, with a cloneable handle
//!
//! ## Example
//!
//! ```rust,no_run
//! use hush_session::{SessionConfig, SessionController};
//! use hush_storage::{open_store, StorageMode};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = open_store(StorageMode::InMemory).await?;
//! let (handle, mut interrupts, _task) = SessionController::spawn(store, &SessionConfig::default());
//!
//! handle.request_connect("127.0.0.1:8765", "Mario").await?;
//! handle.set_threshold(70.0).await?;
//!
//! while let Some(interrupt) = interrupts.recv().await {
//!     println!("{}", interrupt);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alert;
pub mod controller;
pub mod error;
pub mod machine;
pub mod session;
pub mod transport;

pub use alert::{AlertDecision, AlertPolicy, Interrupt};
pub use controller::{SessionController, SessionHandle};
pub use error::{SessionError, ValidationError};
pub use machine::{SessionMachine, SideEffect};
pub use session::{
    clamp_threshold, ConnectionStatus, Session, SessionConfig, SessionSnapshot,
    DEFAULT_EVENT_LOG_CAPACITY, DEFAULT_THRESHOLD, MAX_THRESHOLD, MIN_THRESHOLD,
};
pub use transport::{
    ConnectionId, Endpoint, Transport, TransportError, TransportEvent, TransportEventKind,
    WsTransport,
};
