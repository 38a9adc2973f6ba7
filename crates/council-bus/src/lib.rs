//! Pub/sub transport for the council live sync layer.
//!
//! A [`Connector`] opens a [`Socket`]: one long-lived connection to the
//! broker, multiplexed into named destinations. Clients publish to
//! application destinations (`/app/...`) and subscribe to broadcast
//! destinations (`/topic/...`).
//!
//! Two implementations ship with the crate:
//! - [`StompConnector`]: STOMP 1.2 frames over a WebSocket.
//! - [`LocalBus`]: an in-process broker for tests and offline wiring.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub mod frame;
pub mod local;
pub mod stomp;

pub use frame::{Command, Frame, FrameError};
pub use local::LocalBus;
pub use stomp::{StompConfig, StompConnector, StompSocket};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub destination: String,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(destination: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
        }
    }

    /// Body as text; STOMP bodies on this bus are UTF-8 in practice.
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("socket closed")]
    Closed,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("broker rejected the connection: {0}")]
    Rejected(String),
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub type BusResult<T> = Result<T, BusError>;

/// Opens sockets to a single broker endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> BusResult<Arc<dyn Socket>>;
}

/// An established connection to the broker.
///
/// `send` and `subscribe` never block: frames are handed to the socket's
/// writer and fail with [`BusError::Closed`] once the connection is gone.
#[async_trait]
pub trait Socket: Send + Sync {
    fn send(&self, destination: &str, payload: Bytes) -> BusResult<()>;

    fn subscribe(&self, destination: &str) -> BusResult<Subscription>;

    fn is_open(&self) -> bool;

    /// Resolves once the connection has dropped or was closed.
    async fn closed(&self);

    fn close(&self);
}

/// Inbound messages for one destination. Ends when the socket closes.
#[derive(Debug)]
pub struct Subscription {
    destination: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub(crate) fn new(destination: impl Into<String>, rx: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self {
            destination: destination.into(),
            rx,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Open/closed flag shared between a socket and its background tasks.
#[derive(Debug)]
pub(crate) struct Liveness {
    open: watch::Sender<bool>,
}

impl Liveness {
    pub(crate) fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self { open }
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Returns true when this call performed the transition.
    pub(crate) fn mark_closed(&self) -> bool {
        self.open
            .send_if_modified(|open| std::mem::replace(open, false))
    }

    pub(crate) async fn closed(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| !*open).await;
    }
}
