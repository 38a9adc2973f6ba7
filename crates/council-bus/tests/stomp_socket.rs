use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use council_bus::frame::parse_frames;
use council_bus::{BusError, Command, Connector, Frame, StompConfig, StompConnector};
use tokio::sync::Mutex;

/// Records every SEND the broker accepted as (destination, body).
type Received = Arc<Mutex<Vec<(String, String)>>>;

async fn ws_handler(ws: WebSocketUpgrade, State(received): State<Received>) -> Response {
    ws.on_upgrade(move |socket| serve(socket, received))
}

fn text(frame: Frame) -> Message {
    Message::Text(String::from_utf8(frame.encode()).expect("utf8 frame"))
}

/// Minimal broker: `/app/echo/{x}` is re-broadcast on `/topic/echo/{x}`,
/// `/app/kick` drops the connection, a `login:bad` CONNECT is refused.
async fn serve(mut socket: WebSocket, received: Received) {
    let mut subscriptions: Vec<(String, String)> = Vec::new();
    let mut counter = 0u64;
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(raw) = msg else { continue };
        let Ok(frames) = parse_frames(raw.as_bytes()) else { continue };
        for frame in frames {
            match frame.command {
                Command::Connect | Command::Stomp => {
                    let reply = if frame.get("login") == Some("bad") {
                        Frame::new(Command::Error).header("message", "bad credentials")
                    } else {
                        Frame::new(Command::Connected)
                            .header("version", "1.2")
                            .header("heart-beat", "0,0")
                    };
                    if socket.send(text(reply)).await.is_err() {
                        return;
                    }
                }
                Command::Subscribe => {
                    let id = frame.get("id").unwrap_or_default().to_string();
                    let destination = frame.get("destination").unwrap_or_default().to_string();
                    subscriptions.push((id, destination));
                }
                Command::Send => {
                    let destination = frame.get("destination").unwrap_or_default().to_string();
                    let body = String::from_utf8_lossy(&frame.body).into_owned();
                    received.lock().await.push((destination.clone(), body));
                    if destination == "/app/kick" {
                        let _ = socket.send(Message::Close(None)).await;
                        return;
                    }
                    let Some(suffix) = destination.strip_prefix("/app/echo/") else {
                        continue;
                    };
                    let topic = format!("/topic/echo/{suffix}");
                    for (id, dest) in subscriptions.iter().filter(|(_, d)| *d == topic) {
                        counter += 1;
                        let message = Frame::new(Command::Message)
                            .header("subscription", id.clone())
                            .header("destination", dest.clone())
                            .header("message-id", counter.to_string())
                            .with_body(frame.body.clone());
                        if socket.send(text(message)).await.is_err() {
                            return;
                        }
                    }
                }
                Command::Disconnect => return,
                _ => {}
            }
        }
    }
}

async fn spawn_broker() -> (SocketAddr, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/ws/websocket", get(ws_handler))
        .with_state(received.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, received)
}

fn config(addr: SocketAddr) -> StompConfig {
    StompConfig::new(format!("ws://{addr}/ws/websocket"))
        .with_heartbeat(Duration::ZERO)
        .with_connect_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn delivers_messages_in_emission_order() {
    let (addr, received) = spawn_broker().await;
    let socket = StompConnector::new(config(addr))
        .connect()
        .await
        .expect("connect");
    let mut sub = socket.subscribe("/topic/echo/7").expect("subscribe");

    for n in 0..20 {
        socket
            .send("/app/echo/7", Bytes::from(n.to_string()))
            .expect("send");
    }

    for n in 0..20 {
        let msg = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("message in time")
            .expect("subscription open");
        assert_eq!(msg.destination, "/topic/echo/7");
        assert_eq!(msg.text().unwrap(), n.to_string());
    }
    assert_eq!(received.lock().await.len(), 20);
}

#[tokio::test]
async fn broker_drop_closes_socket_and_subscriptions() {
    let (addr, _received) = spawn_broker().await;
    let socket = StompConnector::new(config(addr))
        .connect()
        .await
        .expect("connect");
    let mut sub = socket.subscribe("/topic/echo/1").expect("subscribe");

    socket.send("/app/kick", Bytes::new()).expect("send");

    tokio::time::timeout(Duration::from_secs(2), socket.closed())
        .await
        .expect("socket noticed the drop");
    assert!(!socket.is_open());
    assert!(tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("subscription ends")
        .is_none());
    assert!(matches!(
        socket.send("/app/echo/1", Bytes::from_static(b"late")),
        Err(BusError::Closed)
    ));
}

#[tokio::test]
async fn refused_connect_surfaces_broker_message() {
    let (addr, _received) = spawn_broker().await;
    let err = StompConnector::new(config(addr).with_connect_header("login", "bad"))
        .connect()
        .await
        .err()
        .expect("connect refused");
    match err {
        BusError::Rejected(reason) => assert_eq!(reason, "bad credentials"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_broker_is_a_connect_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = StompConnector::new(config(addr))
        .connect()
        .await
        .err()
        .expect("nothing listening");
    assert!(matches!(err, BusError::Connect(_)));
}

#[tokio::test]
async fn close_stops_delivery() {
    let (addr, received) = spawn_broker().await;
    let socket = StompConnector::new(config(addr))
        .connect()
        .await
        .expect("connect");
    let mut sub = socket.subscribe("/topic/echo/2").expect("subscribe");
    socket.close();

    assert!(!socket.is_open());
    assert!(sub.recv().await.is_none());
    assert!(socket.send("/app/echo/2", Bytes::from_static(b"x")).is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(received.lock().await.is_empty());
}
