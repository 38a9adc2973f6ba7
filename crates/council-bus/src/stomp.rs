//! STOMP 1.2 client over a WebSocket.
//!
//! The socket runs two background tasks: a writer that owns the sink and
//! emits heart-beats, and a reader that routes MESSAGE frames to their
//! subscriptions. Either task ending marks the socket closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::frame::{parse_frames, Command, Frame};
use crate::{BusError, BusMessage, BusResult, Connector, Liveness, Socket, Subscription};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection settings for a STOMP broker endpoint.
#[derive(Debug, Clone)]
pub struct StompConfig {
    /// WebSocket URL, e.g. `ws://host:8080/ws/websocket`.
    pub url: String,
    /// Heart-beat interval offered in both directions; zero disables.
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    /// Extra CONNECT headers (credentials, tenant hints).
    pub connect_headers: Vec<(String, String)>,
}

impl StompConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            connect_headers: Vec::new(),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_connect_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.connect_headers.push((name.into(), value.into()));
        self
    }

    /// Normalizes `http(s)://` to `ws(s)://` and localhost to IPv4.
    pub fn build_url(&self) -> BusResult<Url> {
        let mut raw = self.url.clone();
        if let Some(rest) = raw.strip_prefix("http://") {
            raw = format!("ws://{rest}");
        } else if let Some(rest) = raw.strip_prefix("https://") {
            raw = format!("wss://{rest}");
        }
        if raw.contains("://localhost") {
            raw = raw.replacen("://localhost", "://127.0.0.1", 1);
        }
        Url::parse(&raw).map_err(|err| BusError::Connect(format!("invalid url {raw}: {err}")))
    }
}

#[derive(Debug, Clone)]
pub struct StompConnector {
    config: StompConfig,
}

impl StompConnector {
    pub fn new(config: StompConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for StompConnector {
    async fn connect(&self) -> BusResult<Arc<dyn Socket>> {
        let socket = StompSocket::connect(&self.config).await?;
        Ok(Arc::new(socket))
    }
}

struct Route {
    destination: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

pub struct StompSocket {
    outbound: mpsc::UnboundedSender<Message>,
    routes: Routes,
    next_subscription: AtomicU64,
    liveness: Arc<Liveness>,
    reader: JoinHandle<()>,
    _writer: JoinHandle<()>,
}

/// Negotiated heart-beat periods; `None` means disabled in that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Heartbeats {
    send_every: Option<Duration>,
    expect_within: Option<Duration>,
}

fn negotiate_heartbeats(offered: Duration, server_header: Option<&str>) -> Heartbeats {
    let (server_send, server_want) = server_header
        .and_then(|raw| raw.split_once(','))
        .and_then(|(sx, sy)| Some((sx.trim().parse::<u64>().ok()?, sy.trim().parse::<u64>().ok()?)))
        .unwrap_or((0, 0));
    let ours = offered.as_millis() as u64;
    let pick = |a: u64, b: u64| (a != 0 && b != 0).then(|| Duration::from_millis(a.max(b)));
    Heartbeats {
        send_every: pick(ours, server_want),
        // Allow twice the agreed period before declaring the peer dead.
        expect_within: pick(ours, server_send).map(|d| d * 2),
    }
}

fn to_ws_message(frame: &Frame) -> Message {
    match String::from_utf8(frame.encode()) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}

impl StompSocket {
    pub async fn connect(config: &StompConfig) -> BusResult<Self> {
        let url = config.build_url()?;
        let host = url.host_str().unwrap_or("localhost").to_string();

        let (ws, _) = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| BusError::Connect(format!("timed out connecting to {url}")))?
            .map_err(|err| BusError::Connect(err.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let hb = config.heartbeat.as_millis();
        let mut connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", format!("{hb},{hb}"));
        for (name, value) in &config.connect_headers {
            connect = connect.header(name.clone(), value.clone());
        }
        sink.send(to_ws_message(&connect))
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;

        let connected = tokio::time::timeout(config.connect_timeout, await_connected(&mut stream))
            .await
            .map_err(|_| BusError::Connect("timed out waiting for CONNECTED".into()))??;
        let heartbeats = negotiate_heartbeats(config.heartbeat, connected.get("heart-beat"));
        info!(
            target = "council.bus",
            url = %url,
            version = connected.get("version").unwrap_or("?"),
            ?heartbeats,
            "stomp session established"
        );

        let liveness = Arc::new(Liveness::new());
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            heartbeats.send_every,
            Arc::clone(&liveness),
        ));
        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&routes),
            heartbeats.expect_within,
            Arc::clone(&liveness),
        ));

        Ok(Self {
            outbound,
            routes,
            next_subscription: AtomicU64::new(0),
            liveness,
            reader,
            _writer: writer,
        })
    }

    fn push(&self, frame: &Frame) -> BusResult<()> {
        if !self.liveness.is_open() {
            return Err(BusError::Closed);
        }
        self.outbound
            .send(to_ws_message(frame))
            .map_err(|_| BusError::Closed)
    }
}

async fn await_connected(stream: &mut SplitStream<WsStream>) -> BusResult<Frame> {
    while let Some(msg) = stream.next().await {
        let msg = msg.map_err(|err| BusError::Transport(err.to_string()))?;
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
            Message::Close(_) => break,
            _ => continue,
        };
        for frame in parse_frames(&data)? {
            match frame.command {
                Command::Connected => return Ok(frame),
                Command::Error => {
                    let reason = frame
                        .get("message")
                        .map(str::to_string)
                        .unwrap_or_else(|| String::from_utf8_lossy(&frame.body).into_owned());
                    return Err(BusError::Rejected(reason));
                }
                other => debug!(target = "council.bus", command = %other, "ignoring frame before CONNECTED"),
            }
        }
    }
    Err(BusError::Connect("connection closed during handshake".into()))
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    heartbeat: Option<Duration>,
    liveness: Arc<Liveness>,
) {
    let mut ticker = heartbeat.map(tokio::time::interval);
    loop {
        let next = tokio::select! {
            biased;
            msg = outbound.recv() => msg,
            _ = liveness.closed() => None,
            _ = async {
                match ticker.as_mut() {
                    Some(t) => { t.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => Some(Message::Text("\n".into())),
        };
        let Some(msg) = next else { break };
        if let Err(err) = sink.send(msg).await {
            debug!(target = "council.bus", error = %err, "stomp writer stopped");
            break;
        }
    }
    liveness.mark_closed();
    // Frames queued by `close()` (DISCONNECT) still go out before the sink shuts.
    while let Ok(msg) = outbound.try_recv() {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    routes: Routes,
    expect_within: Option<Duration>,
    liveness: Arc<Liveness>,
) {
    loop {
        let next = match expect_within {
            Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(target = "council.bus", ?limit, "no frames from broker within heart-beat window");
                    break;
                }
            },
            None => stream.next().await,
        };
        let data = match next {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!(target = "council.bus", error = %err, "stomp reader stopped");
                break;
            }
        };
        let frames = match parse_frames(&data) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(target = "council.bus", error = %err, "dropping malformed frame");
                continue;
            }
        };
        for frame in frames {
            match frame.command {
                Command::Message => dispatch(&routes, frame),
                Command::Error => {
                    warn!(
                        target = "council.bus",
                        message = frame.get("message").unwrap_or(""),
                        "broker sent ERROR; closing"
                    );
                    liveness.mark_closed();
                    routes.lock().clear();
                    return;
                }
                Command::Receipt => {
                    debug!(target = "council.bus", receipt = frame.get("receipt-id").unwrap_or(""), "receipt");
                }
                other => debug!(target = "council.bus", command = %other, "ignoring frame"),
            }
        }
    }
    liveness.mark_closed();
    routes.lock().clear();
}

fn dispatch(routes: &Routes, frame: Frame) {
    let Some(id) = frame.get("subscription").map(str::to_string) else {
        warn!(target = "council.bus", "MESSAGE frame without subscription header");
        return;
    };
    let mut guard = routes.lock();
    let Some(route) = guard.get(&id) else {
        debug!(target = "council.bus", subscription = %id, "message for unknown subscription");
        return;
    };
    let destination = frame
        .get("destination")
        .map(str::to_string)
        .unwrap_or_else(|| route.destination.clone());
    if route
        .tx
        .send(BusMessage::new(destination, frame.body))
        .is_err()
    {
        guard.remove(&id);
    }
}

#[async_trait]
impl Socket for StompSocket {
    fn send(&self, destination: &str, payload: Bytes) -> BusResult<()> {
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "text/plain;charset=UTF-8")
            .with_body(payload);
        self.push(&frame)
    }

    fn subscribe(&self, destination: &str) -> BusResult<Subscription> {
        let id = format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(
            id.clone(),
            Route {
                destination: destination.to_string(),
                tx,
            },
        );
        let frame = Frame::new(Command::Subscribe)
            .header("id", id.clone())
            .header("destination", destination)
            .header("ack", "auto");
        if let Err(err) = self.push(&frame) {
            self.routes.lock().remove(&id);
            return Err(err);
        }
        Ok(Subscription::new(destination, rx))
    }

    fn is_open(&self) -> bool {
        self.liveness.is_open()
    }

    async fn closed(&self) {
        self.liveness.closed().await
    }

    fn close(&self) {
        if self.liveness.is_open() {
            let _ = self
                .outbound
                .send(to_ws_message(&Frame::new(Command::Disconnect)));
        }
        self.liveness.mark_closed();
        self.routes.lock().clear();
        self.reader.abort();
    }
}

impl Drop for StompSocket {
    fn drop(&mut self) {
        self.close();
    }
}
