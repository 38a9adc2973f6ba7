use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{BusError, BusMessage, BusResult, Connector, Liveness, Socket, Subscription};

/// In-memory broker for tests and non-network contexts.
///
/// Sockets opened through [`Connector::connect`] publish into a log that
/// tests can inspect, and receive whatever is pushed with
/// [`LocalBus::broadcast`]. Going offline severs every live socket and
/// refuses new connections, which is how tests model a flaky network.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<Broker>,
}

#[derive(Default)]
struct Broker {
    offline: AtomicBool,
    next_socket: AtomicU64,
    connects: AtomicUsize,
    routes: RwLock<HashMap<String, Vec<Route>>>,
    sockets: Mutex<HashMap<u64, Arc<LocalSocket>>>,
    published: Mutex<Vec<BusMessage>>,
}

struct Route {
    socket: u64,
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a server-side broadcast to every subscriber of `destination`.
    /// Returns how many subscriptions received it.
    pub fn broadcast(&self, destination: &str, payload: impl Into<Bytes>) -> usize {
        let message = BusMessage::new(destination, payload);
        let mut guard = self.inner.routes.write();
        let Some(routes) = guard.get_mut(destination) else {
            return 0;
        };
        routes.retain(|route| route.tx.send(message.clone()).is_ok());
        routes.len()
    }

    /// Takes the network down (`false`) or brings it back (`true`).
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::SeqCst);
        if !online {
            self.sever();
        }
    }

    pub fn is_online(&self) -> bool {
        !self.inner.offline.load(Ordering::SeqCst)
    }

    /// Drops every live socket while staying reachable.
    pub fn sever(&self) {
        let sockets: Vec<Arc<LocalSocket>> =
            self.inner.sockets.lock().drain().map(|(_, s)| s).collect();
        for socket in sockets {
            socket.close();
        }
    }

    /// Messages published by clients, in the order the broker accepted them.
    pub fn published(&self) -> Vec<BusMessage> {
        self.inner.published.lock().clone()
    }

    pub fn published_to(&self, destination: &str) -> Vec<Bytes> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|msg| msg.destination == destination)
            .map(|msg| msg.payload.clone())
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn live_sockets(&self) -> usize {
        self.inner.sockets.lock().len()
    }

    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.inner
            .routes
            .read()
            .get(destination)
            .map(|routes| routes.iter().filter(|route| !route.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for LocalBus {
    async fn connect(&self) -> BusResult<Arc<dyn Socket>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if !self.is_online() {
            return Err(BusError::Connect("local bus offline".into()));
        }
        let id = self.inner.next_socket.fetch_add(1, Ordering::SeqCst);
        let socket = Arc::new(LocalSocket {
            id,
            broker: Arc::clone(&self.inner),
            liveness: Liveness::new(),
        });
        self.inner.sockets.lock().insert(id, Arc::clone(&socket));
        debug!(target = "council.bus", socket = id, "local socket connected");
        Ok(socket)
    }
}

pub struct LocalSocket {
    id: u64,
    broker: Arc<Broker>,
    liveness: Liveness,
}

#[async_trait]
impl Socket for LocalSocket {
    fn send(&self, destination: &str, payload: Bytes) -> BusResult<()> {
        if !self.liveness.is_open() {
            return Err(BusError::Closed);
        }
        self.broker
            .published
            .lock()
            .push(BusMessage::new(destination, payload));
        Ok(())
    }

    fn subscribe(&self, destination: &str) -> BusResult<Subscription> {
        if !self.liveness.is_open() {
            return Err(BusError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker
            .routes
            .write()
            .entry(destination.to_string())
            .or_default()
            .push(Route {
                socket: self.id,
                tx,
            });
        Ok(Subscription::new(destination, rx))
    }

    fn is_open(&self) -> bool {
        self.liveness.is_open()
    }

    async fn closed(&self) {
        self.liveness.closed().await
    }

    fn close(&self) {
        if !self.liveness.mark_closed() {
            return;
        }
        // Dropping the senders ends every subscription of this socket.
        for routes in self.broker.routes.write().values_mut() {
            routes.retain(|route| route.socket != self.id);
        }
        self.broker.sockets.lock().remove(&self.id);
        debug!(target = "council.bus", socket = self.id, "local socket closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let socket = bus.connect().await.expect("connect");
        let mut sub = socket.subscribe("/topic/sessions/1").expect("subscribe");

        assert_eq!(bus.broadcast("/topic/sessions/1", Bytes::from_static(b"a")), 1);
        assert_eq!(bus.broadcast("/topic/sessions/1", Bytes::from_static(b"b")), 1);
        assert_eq!(sub.recv().await.unwrap().payload, Bytes::from_static(b"a"));
        assert_eq!(sub.recv().await.unwrap().payload, Bytes::from_static(b"b"));

        socket
            .send("/app/vote/1", Bytes::from_static(b"5"))
            .expect("send");
        assert_eq!(bus.published_to("/app/vote/1"), vec![Bytes::from_static(b"5")]);
    }

    #[tokio::test]
    async fn going_offline_ends_subscriptions_and_refuses_connects() {
        let bus = LocalBus::new();
        let socket = bus.connect().await.expect("connect");
        let mut sub = socket.subscribe("/topic/presenters/2").expect("subscribe");

        bus.set_online(false);
        assert!(sub.recv().await.is_none());
        assert!(!socket.is_open());
        socket.closed().await;
        assert!(matches!(
            socket.send("/app/presenter/2", Bytes::from_static(b"1")),
            Err(BusError::Closed)
        ));
        assert!(matches!(bus.connect().await, Err(BusError::Connect(_))));
        assert_eq!(bus.connect_count(), 2);

        bus.set_online(true);
        assert!(bus.connect().await.is_ok());
        assert_eq!(bus.live_sockets(), 1);
    }

    #[tokio::test]
    async fn closing_one_socket_keeps_others_subscribed() {
        let bus = LocalBus::new();
        let first = bus.connect().await.unwrap();
        let second = bus.connect().await.unwrap();
        let _a = first.subscribe("/topic/newTopics/3").unwrap();
        let mut b = second.subscribe("/topic/newTopics/3").unwrap();

        first.close();
        assert_eq!(bus.subscriber_count("/topic/newTopics/3"), 1);
        assert_eq!(bus.broadcast("/topic/newTopics/3", "NEW_TOPIC"), 1);
        assert_eq!(b.recv().await.unwrap().text().unwrap(), "NEW_TOPIC");
    }
}
