//! Generic session-scoped channel client.
//!
//! One [`ChannelClient`] exists per [`ChannelPurpose`] in a mounted view. It
//! owns at most one socket, re-subscribes on every successful connect,
//! buffers sends while disconnected and flushes them in order once the
//! supervisor has reconnected.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use council_bus::{Connector, Socket, Subscription};
use futures::Stream;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

mod purpose;
mod queue;
mod supervisor;

pub use purpose::{ChannelPurpose, ChannelSpec, Destinations};
pub use queue::OutboundQueue;
pub use supervisor::{Backoff, ReconnectPolicy, Trigger, Visibility, VisibilitySignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the socket.
    Sent,
    /// Waiting in the outbound queue for the next connection.
    Queued,
    /// Queueing is disabled for this channel and no connection was available.
    Discarded,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("{0} channel is closed")]
    Closed(ChannelPurpose),
    #[error("{0} channel has not been opened")]
    NotOpen(ChannelPurpose),
    #[error("{0} channel has no outbound destination")]
    NoOutbound(ChannelPurpose),
}

/// Called with the scope the body was received for.
pub type MessageHandler = Arc<dyn Fn(u64, &Bytes) + Send + Sync>;

pub struct ChannelClient {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    spec: ChannelSpec,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    visibility: watch::Receiver<Visibility>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    closed: AtomicBool,
    mount: Mutex<Mount>,
    queue: Mutex<OutboundQueue>,
    listeners: Mutex<Listeners>,
    last_heartbeat: Mutex<Option<Instant>>,
}

#[derive(Default)]
struct Mount {
    scope: Option<u64>,
    destinations: Option<Destinations>,
    socket: Option<Arc<dyn Socket>>,
    triggers: Option<mpsc::UnboundedSender<Trigger>>,
    supervisor: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Mount {
    fn teardown(&mut self) {
        if let Some(task) = self.supervisor.take() {
            task.abort();
        }
        if let Some(task) = self.pump.take() {
            task.abort();
        }
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.triggers = None;
        self.destinations = None;
        self.scope = None;
    }
}

#[derive(Default)]
struct Listeners {
    handlers: Vec<MessageHandler>,
    streams: Vec<mpsc::UnboundedSender<Bytes>>,
}

impl ChannelClient {
    pub fn new(
        spec: ChannelSpec,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        visibility: watch::Receiver<Visibility>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                spec,
                policy: policy.normalized(),
                connector,
                visibility,
                state,
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                mount: Mutex::new(Mount::default()),
                queue: Mutex::new(OutboundQueue::new()),
                listeners: Mutex::new(Listeners::default()),
                last_heartbeat: Mutex::new(None),
            }),
        }
    }

    pub fn for_purpose(
        purpose: ChannelPurpose,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        visibility: watch::Receiver<Visibility>,
    ) -> Self {
        Self::new(purpose.spec(), connector, policy, visibility)
    }

    pub fn purpose(&self) -> ChannelPurpose {
        self.inner.spec.purpose
    }

    pub fn scope(&self) -> Option<u64> {
        self.inner.mount.lock().scope
    }

    pub fn destinations(&self) -> Option<Destinations> {
        self.inner.mount.lock().destinations.clone()
    }

    /// Mounts the channel for `scope` and starts connecting.
    ///
    /// Re-opening the current scope only nudges the supervisor; a different
    /// scope tears down the old socket and discards its queue first.
    /// Connection failures never surface here.
    pub fn open(&self, scope: u64) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            warn!(
                target = "council.channel",
                purpose = %inner.spec.purpose,
                scope,
                "open called on a closed channel"
            );
            return;
        }

        let mut mount = inner.mount.lock();
        if mount.scope == Some(scope) {
            if inner.state() == ConnectionState::Disconnected {
                if let Some(triggers) = &mount.triggers {
                    let _ = triggers.send(Trigger::Mount);
                }
            }
            return;
        }

        let previous = mount.scope;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        mount.teardown();
        mount.scope = Some(scope);
        mount.destinations = Some(inner.spec.resolve(scope));
        drop(mount);

        // Waits out a delivery for the previous scope; later ones are stale.
        drop(inner.listeners.lock());
        let dropped = inner.queue.lock().clear();
        inner.set_state(ConnectionState::Disconnected);
        if previous.is_some() {
            info!(
                target = "council.channel",
                purpose = %inner.spec.purpose,
                from = ?previous,
                to = scope,
                dropped,
                "channel scope changed"
            );
        }

        let (triggers, triggers_rx) = mpsc::unbounded_channel();
        let _ = triggers.send(Trigger::Mount);
        let mut mount = inner.mount.lock();
        if inner.is_stale(generation) {
            // Closed or re-scoped while the queue was being cleared.
            return;
        }
        mount.triggers = Some(triggers);
        mount.supervisor = Some(tokio::spawn(supervisor::supervise(
            Arc::clone(inner),
            generation,
            triggers_rx,
            inner.visibility.clone(),
        )));
    }

    /// Registers a handler called once per inbound body, in arrival order.
    /// Handlers must not call back into this client's `close`.
    pub fn subscribe<F>(&self, on_message: F)
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.subscribe_scoped(move |_, body| on_message(body));
    }

    /// Like [`subscribe`](Self::subscribe), but the handler also gets the
    /// scope the body arrived for. A body is never reported under a scope
    /// opened after it was received.
    pub fn subscribe_scoped<F>(&self, on_message: F)
    where
        F: Fn(u64, &Bytes) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().handlers.push(Arc::new(on_message));
    }

    /// Inbound bodies as a stream; ends when the client closes.
    pub fn messages(&self) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.inner.closed.load(Ordering::SeqCst) {
            self.inner.listeners.lock().streams.push(tx);
        }
        MessageStream { rx }
    }

    /// Sends `body` to the channel's outbound destination.
    ///
    /// While disconnected this triggers a reconnect and polls for the
    /// connection up to the policy's `send_wait`; after that the body stays
    /// queued (or is discarded when queueing is off).
    pub async fn send(&self, body: impl Into<Bytes>) -> Result<SendOutcome, ChannelError> {
        let inner = &self.inner;
        let purpose = inner.spec.purpose;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed(purpose));
        }
        let (generation, outbound) = {
            let mount = inner.mount.lock();
            let destinations = mount
                .destinations
                .as_ref()
                .ok_or(ChannelError::NotOpen(purpose))?;
            let outbound = destinations
                .outbound
                .clone()
                .ok_or(ChannelError::NoOutbound(purpose))?;
            (inner.generation.load(Ordering::SeqCst), outbound)
        };
        let body = body.into();

        if !inner.spec.queueing {
            return Ok(inner.send_unqueued(generation, &outbound, body).await);
        }

        let seq = {
            let mut queue = inner.queue.lock();
            let seq = queue.enqueue(body);
            gauge!("council_channel_queue_depth", queue.len() as f64, "purpose" => purpose.as_str());
            seq
        };

        let deadline = Instant::now() + inner.policy.send_wait;
        let mut triggered = false;
        loop {
            if inner.is_stale(generation) {
                return Err(ChannelError::Closed(purpose));
            }
            if inner.is_connected() {
                inner.flush(generation);
            }
            let (delivered, pending) = {
                let queue = inner.queue.lock();
                (queue.is_delivered(seq), queue.is_pending(seq))
            };
            if delivered {
                counter!("council_channel_sent_total", 1, "purpose" => purpose.as_str());
                return Ok(SendOutcome::Sent);
            }
            if !pending {
                // Cleared by a scope change while we were waiting.
                return Err(ChannelError::Closed(purpose));
            }

            if !inner.is_connected() && !triggered {
                inner.trigger(Trigger::SendWhileDisconnected);
                triggered = true;
            }
            if Instant::now() >= deadline {
                counter!("council_channel_queued_total", 1, "purpose" => purpose.as_str());
                debug!(
                    target = "council.channel",
                    purpose = %purpose,
                    queued = inner.queue.lock().len(),
                    "send left queued until reconnect"
                );
                return Ok(SendOutcome::Queued);
            }
            tokio::time::sleep(inner.policy.send_poll).await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        *self.inner.last_heartbeat.lock()
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Releases the socket, stops the supervisor and discards the queue.
    /// No handler runs after this returns.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.mount.lock().teardown();
        let dropped = inner.queue.lock().clear();
        {
            // Waits for an in-flight delivery, then stops all future ones.
            let mut listeners = inner.listeners.lock();
            listeners.handlers.clear();
            listeners.streams.clear();
        }
        inner.set_state(ConnectionState::Disconnected);
        gauge!("council_channel_queue_depth", 0.0, "purpose" => inner.spec.purpose.as_str());
        info!(
            target = "council.channel",
            purpose = %inner.spec.purpose,
            dropped,
            "channel closed"
        );
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.closed.load(Ordering::SeqCst) || self.generation.load(Ordering::SeqCst) != generation
    }

    fn trigger(&self, trigger: Trigger) {
        if let Some(triggers) = &self.mount.lock().triggers {
            let _ = triggers.send(trigger);
        }
    }

    /// One connect attempt; returns true once connected and subscribed.
    async fn connect_once(self: &Arc<Self>, generation: u64, trigger: Trigger) -> bool {
        let purpose = self.spec.purpose;
        self.set_state(ConnectionState::Connecting);
        counter!("council_channel_connect_attempts_total", 1, "purpose" => purpose.as_str());

        let result = self.connector.connect().await;
        if self.is_stale(generation) {
            if let Ok(socket) = result {
                socket.close();
            }
            return false;
        }
        let socket = match result {
            Ok(socket) => socket,
            Err(err) => {
                counter!("council_channel_connect_failures_total", 1, "purpose" => purpose.as_str());
                warn!(
                    target = "council.channel",
                    purpose = %purpose,
                    trigger = trigger.as_str(),
                    error = %err,
                    "connect failed"
                );
                self.set_state(ConnectionState::Disconnected);
                return false;
            }
        };

        let mut mount = self.mount.lock();
        if self.is_stale(generation) {
            drop(mount);
            socket.close();
            return false;
        }
        let (Some(scope), Some(destinations)) = (mount.scope, mount.destinations.clone()) else {
            drop(mount);
            socket.close();
            self.set_state(ConnectionState::Disconnected);
            return false;
        };
        let subscription = match socket.subscribe(&destinations.inbound) {
            Ok(subscription) => subscription,
            Err(err) => {
                drop(mount);
                warn!(
                    target = "council.channel",
                    purpose = %purpose,
                    destination = %destinations.inbound,
                    error = %err,
                    "subscribe failed"
                );
                socket.close();
                self.set_state(ConnectionState::Disconnected);
                return false;
            }
        };
        if let Some(old) = mount.pump.take() {
            old.abort();
        }
        if let Some(old) = mount.socket.replace(Arc::clone(&socket)) {
            old.close();
        }
        mount.pump = Some(tokio::spawn(pump(
            Arc::clone(self),
            generation,
            scope,
            Arc::clone(&socket),
            subscription,
        )));
        drop(mount);

        *self.last_heartbeat.lock() = Some(Instant::now());
        self.set_state(ConnectionState::Connected);
        info!(
            target = "council.channel",
            purpose = %purpose,
            scope,
            destination = %destinations.inbound,
            trigger = trigger.as_str(),
            "channel connected"
        );
        self.flush(generation);
        true
    }

    /// Drains the queue through the live socket, keeping order.
    fn flush(&self, generation: u64) {
        let (socket, outbound) = {
            let mount = self.mount.lock();
            let outbound = mount
                .destinations
                .as_ref()
                .and_then(|d| d.outbound.clone());
            (mount.socket.clone(), outbound)
        };
        let (Some(socket), Some(outbound)) = (socket, outbound) else {
            return;
        };

        let purpose = self.spec.purpose;
        let mut queue = self.queue.lock();
        if self.is_stale(generation) || queue.is_empty() {
            return;
        }
        let result = queue.flush(|body| socket.send(&outbound, body.clone()));
        gauge!("council_channel_queue_depth", queue.len() as f64, "purpose" => purpose.as_str());
        let remaining = queue.len();
        drop(queue);

        match result {
            Ok(flushed) => {
                counter!("council_channel_flushed_total", flushed as u64, "purpose" => purpose.as_str());
                debug!(target = "council.channel", purpose = %purpose, flushed, "queue flushed");
            }
            Err((flushed, err)) => {
                counter!("council_channel_flushed_total", flushed as u64, "purpose" => purpose.as_str());
                warn!(
                    target = "council.channel",
                    purpose = %purpose,
                    flushed,
                    remaining,
                    error = %err,
                    "flush interrupted"
                );
                self.on_disconnect(generation, &socket);
                self.trigger(Trigger::SendWhileDisconnected);
            }
        }
    }

    async fn send_unqueued(&self, generation: u64, outbound: &str, body: Bytes) -> SendOutcome {
        let purpose = self.spec.purpose;
        let deadline = Instant::now() + self.policy.send_wait;
        let mut triggered = false;
        loop {
            if self.is_stale(generation) {
                return SendOutcome::Discarded;
            }
            let socket = self.mount.lock().socket.clone();
            if let (true, Some(socket)) = (self.is_connected(), socket) {
                match socket.send(outbound, body.clone()) {
                    Ok(()) => {
                        counter!("council_channel_sent_total", 1, "purpose" => purpose.as_str());
                        return SendOutcome::Sent;
                    }
                    Err(err) => {
                        warn!(target = "council.channel", purpose = %purpose, error = %err, "send failed");
                        self.on_disconnect(generation, &socket);
                    }
                }
            }
            if !triggered {
                self.trigger(Trigger::SendWhileDisconnected);
                triggered = true;
            }
            if Instant::now() >= deadline {
                warn!(target = "council.channel", purpose = %purpose, "send discarded while disconnected");
                return SendOutcome::Discarded;
            }
            tokio::time::sleep(self.policy.send_poll).await;
        }
    }

    fn deliver(&self, generation: u64, scope: u64, body: &Bytes) {
        let mut listeners = self.listeners.lock();
        if self.is_stale(generation) {
            return;
        }
        *self.last_heartbeat.lock() = Some(Instant::now());
        for handler in &listeners.handlers {
            handler(scope, body);
        }
        listeners.streams.retain(|tx| tx.send(body.clone()).is_ok());
    }

    /// Marks the channel disconnected if `socket` is still the live one.
    /// Does not schedule a retry; that is the supervisor's job.
    fn on_disconnect(&self, generation: u64, socket: &Arc<dyn Socket>) {
        let mut mount = self.mount.lock();
        if self.is_stale(generation) {
            return;
        }
        let is_current = mount
            .socket
            .as_ref()
            .is_some_and(|live| Arc::ptr_eq(live, socket));
        if !is_current {
            return;
        }
        if let Some(live) = mount.socket.take() {
            live.close();
        }
        drop(mount);
        self.set_state(ConnectionState::Disconnected);
        warn!(
            target = "council.channel",
            purpose = %self.spec.purpose,
            "channel disconnected"
        );
    }
}

async fn pump(
    inner: Arc<Inner>,
    generation: u64,
    scope: u64,
    socket: Arc<dyn Socket>,
    mut subscription: Subscription,
) {
    loop {
        tokio::select! {
            biased;
            next = subscription.recv() => match next {
                Some(message) => inner.deliver(generation, scope, &message.payload),
                None => break,
            },
            _ = socket.closed() => break,
        }
    }
    inner.on_disconnect(generation, &socket);
}

/// Inbound bodies of one channel.
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl MessageStream {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for MessageStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
