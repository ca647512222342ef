//! Connection supervisor against a loopback WebSocket server.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use futures_util::{SinkExt, StreamExt};
use marketstream::clock::ManualClock;
use marketstream::market::{
    ConnectionRegistry, ConnectionState, ConnectionSupervisor, StatusPublisher, SupervisorConfig,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const WAIT: Duration = Duration::from_secs(5);

struct Accepted {
    ws: WebSocketStream<TcpStream>,
    headers: HeaderMap,
}

/// Accept every connection and hand it to the test.
async fn spawn_server() -> (String, mpsc::UnboundedReceiver<Accepted>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}/ws", listener.local_addr().expect("addr"));
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let captured = Arc::new(Mutex::new(HeaderMap::new()));
            let sink = Arc::clone(&captured);
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *sink.lock().expect("lock") = req.headers().clone();
                Ok(resp)
            };
            let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                continue;
            };
            let headers = captured.lock().expect("lock").clone();
            if tx.send(Accepted { ws, headers }).is_err() {
                break;
            }
        }
    });

    (url, rx)
}

async fn next_connection(rx: &mut mpsc::UnboundedReceiver<Accepted>) -> Accepted {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("client connects in time")
        .expect("server alive")
}

async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("client sends in time")
            .expect("socket open")
            .expect("valid frame");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).expect("json"),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

fn config(url: &str) -> SupervisorConfig {
    SupervisorConfig::new("market", url)
        .reconnect_delay(Duration::from_millis(50))
        .connect_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn test_server_ping_gets_timestamped_pong() {
    let (url, mut rx) = spawn_server().await;
    let clock = Arc::new(ManualClock::new(1_700_000_123_456));
    let supervisor =
        ConnectionSupervisor::connect(config(&url).clock(clock), StatusPublisher::new());

    let mut conn = next_connection(&mut rx).await;
    conn.ws
        .send(Message::Text(r#"{"event":"ping"}"#.into()))
        .await
        .expect("send ping");

    let reply = next_json(&mut conn.ws).await;
    assert_eq!(reply, json!({"event": "pong", "ts": 1_700_000_123_456_i64}));

    supervisor.disconnect_and_wait().await;
}

#[tokio::test]
async fn test_literal_ping_is_answered_too() {
    let (url, mut rx) = spawn_server().await;
    let supervisor = ConnectionSupervisor::connect(config(&url), StatusPublisher::new());

    let mut conn = next_connection(&mut rx).await;
    let before = chrono::Utc::now().timestamp_millis();
    conn.ws
        .send(Message::Text("ping".into()))
        .await
        .expect("send ping");

    let reply = next_json(&mut conn.ws).await;
    assert_eq!(reply["event"], "pong");
    assert!(reply["ts"].as_i64().expect("ts") >= before);

    supervisor.disconnect_and_wait().await;
}

#[tokio::test]
async fn test_subscriptions_are_replayed_after_reconnect() {
    let (url, mut rx) = spawn_server().await;
    let supervisor = ConnectionSupervisor::connect(config(&url), StatusPublisher::new());
    supervisor.subscribe("btcusdt@kline_1m");

    let mut first = next_connection(&mut rx).await;
    let subscribe = next_json(&mut first.ws).await;
    assert_eq!(subscribe["method"], "SUBSCRIBE");
    assert_eq!(subscribe["params"], json!(["btcusdt@kline_1m"]));
    let first_id = subscribe["id"].as_u64().expect("id");

    // Drop the socket without a close handshake.
    drop(first);

    let mut second = next_connection(&mut rx).await;
    let replay = next_json(&mut second.ws).await;
    assert_eq!(replay["method"], "SUBSCRIBE");
    assert_eq!(replay["params"], json!(["btcusdt@kline_1m"]));
    assert!(replay["id"].as_u64().expect("id") > first_id, "fresh correlation id");

    supervisor.disconnect_and_wait().await;
}

#[tokio::test]
async fn test_silent_connection_goes_stale_and_reconnects() {
    let (url, mut rx) = spawn_server().await;
    let supervisor = ConnectionSupervisor::connect(
        config(&url).heartbeat(Duration::from_millis(20), Duration::from_millis(150)),
        StatusPublisher::new(),
    );

    let _silent = next_connection(&mut rx).await;
    let opened = Instant::now();

    let _second = next_connection(&mut rx).await;
    assert!(
        opened.elapsed() >= Duration::from_millis(150),
        "reconnect only after the stale timeout"
    );

    supervisor.disconnect_and_wait().await;
}

#[tokio::test]
async fn test_visibility_skips_reconnect_delay() {
    let (url, mut rx) = spawn_server().await;
    let status = StatusPublisher::new();
    let supervisor = ConnectionSupervisor::connect(
        config(&url).reconnect_delay(Duration::from_secs(60)),
        status,
    );
    let mut states = supervisor.state_changes();

    let first = next_connection(&mut rx).await;
    states
        .wait_for(|s| *s == ConnectionState::Open)
        .await
        .expect("open");
    drop(first);
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Closed))
        .await
        .expect("closed in time")
        .expect("closed");

    supervisor.notify_visible();
    let _second = next_connection(&mut rx).await;

    supervisor.disconnect_and_wait().await;
}

#[tokio::test]
async fn test_disconnect_stops_reconnection() {
    let (url, mut rx) = spawn_server().await;
    let status = StatusPublisher::new();
    let supervisor = ConnectionSupervisor::connect(config(&url), status.clone());

    let mut conn = next_connection(&mut rx).await;
    tokio::time::timeout(WAIT, supervisor.disconnect_and_wait())
        .await
        .expect("task stops");

    // The server side sees the socket end.
    let ended = tokio::time::timeout(WAIT, async {
        while let Some(Ok(message)) = conn.ws.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    assert!(
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err(),
        "no reconnect after disconnect"
    );
    assert_eq!(status.current(&"market".into()), ConnectionState::Closed);
    assert!(!supervisor.need_reconnect());
}

#[tokio::test]
async fn test_data_frames_reach_subscribers() {
    let (url, mut rx) = spawn_server().await;
    let supervisor = ConnectionSupervisor::connect(config(&url), StatusPublisher::new());
    let mut data = supervisor.messages();

    let mut conn = next_connection(&mut rx).await;
    conn.ws
        .send(Message::Text(
            json!({"stream": "btcusdt@kline_1m", "data": {"k": {"c": "100.5"}}}).to_string(),
        ))
        .await
        .expect("send text");

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(json!({"channel": "orders", "status": "filled"}).to_string().as_bytes())
        .expect("compress");
    conn.ws
        .send(Message::Binary(encoder.finish().expect("finish")))
        .await
        .expect("send binary");

    // Garbage between the two is dropped without hurting the connection.
    conn.ws
        .send(Message::Binary(vec![0xde, 0xad, 0xbe, 0xef]))
        .await
        .expect("send garbage");
    conn.ws
        .send(Message::Text(json!({"e": "trade", "p": "1"}).to_string()))
        .await
        .expect("send trade");

    let first = tokio::time::timeout(WAIT, data.recv()).await.expect("in time").expect("data");
    assert_eq!(first.topic, "btcusdt@kline_1m");
    assert_eq!(first.payload, json!({"k": {"c": "100.5"}}));

    let second = tokio::time::timeout(WAIT, data.recv()).await.expect("in time").expect("data");
    assert_eq!(second.topic, "orders");
    assert_eq!(second.payload["status"], "filled");

    let third = tokio::time::timeout(WAIT, data.recv()).await.expect("in time").expect("data");
    assert_eq!(third.topic, "trade");

    supervisor.disconnect_and_wait().await;
}

#[tokio::test]
async fn test_handshake_carries_configured_headers() {
    let (url, mut rx) = spawn_server().await;
    let supervisor = ConnectionSupervisor::connect(
        config(&url).header("X-Api-Key", "sk-test"),
        StatusPublisher::new(),
    );

    let conn = next_connection(&mut rx).await;
    assert_eq!(
        conn.headers.get("x-api-key").and_then(|v| v.to_str().ok()),
        Some("sk-test")
    );

    supervisor.disconnect_and_wait().await;
}

#[tokio::test]
async fn test_subscribe_while_down_is_sent_on_next_open() {
    let (url, mut rx) = spawn_server().await;
    let supervisor = ConnectionSupervisor::connect(
        config(&url).reconnect_delay(Duration::from_millis(300)),
        StatusPublisher::new(),
    );
    let mut states = supervisor.state_changes();

    let first = next_connection(&mut rx).await;
    drop(first);
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Closed))
        .await
        .expect("closed in time")
        .expect("closed");

    supervisor.subscribe("ethusdt@kline_5m");

    let mut second = next_connection(&mut rx).await;
    let replay = next_json(&mut second.ws).await;
    assert_eq!(replay["method"], "SUBSCRIBE");
    assert_eq!(replay["params"], json!(["ethusdt@kline_5m"]));

    supervisor.disconnect_and_wait().await;
}

#[tokio::test]
async fn test_replaced_key_stays_open_after_old_connection_exits() {
    let (url, mut rx) = spawn_server().await;
    let mut registry = ConnectionRegistry::new();
    let key = "market".into();

    let old = registry.acquire(config(&url));
    let mut states = old.state_changes();
    let _first = next_connection(&mut rx).await;
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Open))
        .await
        .expect("open in time")
        .expect("open");

    let new = registry.acquire(config(&format!("{url}?replica=2")));
    let _second = next_connection(&mut rx).await;
    assert!(old.is_finished(), "old task exits before the new socket opens");

    let mut states = new.state_changes();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Open))
        .await
        .expect("open in time")
        .expect("open");

    // Longer than the old socket's close handshake may take.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(new.state(), ConnectionState::Open);
    assert_eq!(registry.status().current(&key), ConnectionState::Open);

    registry.disconnect_all();
    tokio::time::timeout(WAIT, registry.wait_retired())
        .await
        .expect("all tasks exit");
    assert_eq!(registry.status().current(&key), ConnectionState::Closed);
}
