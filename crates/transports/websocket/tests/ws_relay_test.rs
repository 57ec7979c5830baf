//! WebSocket relay tests against a live server on an ephemeral port

use callrelay_core::{RelayConfig, RoutingPolicy};
use callrelay_websocket::{WebSocketServerHandle, WebSocketSignalingServer};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> RelayConfig {
    let _ = tracing_subscriber::fmt::try_init();
    let mut config = RelayConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config
}

async fn start(config: RelayConfig) -> WebSocketServerHandle {
    WebSocketSignalingServer::new(config)
        .unwrap()
        .start()
        .await
        .unwrap()
}

async fn connect(addr: SocketAddr, query: &str) -> (Client, String) {
    let (mut ws, _) = connect_async(format!("ws://{}/{}", addr, query))
        .await
        .unwrap();
    let welcome = recv_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    let peer_id = welcome["peer_id"].as_str().unwrap().to_string();
    (ws, peer_id)
}

async fn recv_json(ws: &mut Client) -> Value {
    loop {
        let msg = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("connection ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected frame: {:?}", other),
        }
    }
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn assert_silent(ws: &mut Client) {
    match timeout(Duration::from_millis(200), ws.next()).await {
        Err(_) => {}
        Ok(Some(Ok(Message::Ping(_)))) => {}
        Ok(other) => panic!("Expected no message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_two_party_call_over_websocket() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr();

    let (mut x, x_id) = connect(addr, "").await;
    let (mut y, y_id) = connect(addr, "").await;

    send_json(&mut x, json!({"type": "offer", "payload": {"type": "offer", "sdp": "O1"}})).await;
    let offer = recv_json(&mut y).await;
    assert_eq!(offer["type"], "offer");
    assert_eq!(offer["from"], x_id.as_str());
    assert_eq!(offer["payload"]["sdp"], "O1");

    send_json(&mut y, json!({"type": "answer", "payload": {"type": "answer", "sdp": "A1"}})).await;
    let answer = recv_json(&mut x).await;
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["from"], y_id.as_str());
    assert_eq!(answer["payload"]["sdp"], "A1");

    send_json(&mut x, json!({"type": "ice-candidate", "payload": {"candidate": "c1"}})).await;
    let candidate = recv_json(&mut y).await;
    assert_eq!(candidate["type"], "ice-candidate");
    assert_eq!(candidate["payload"]["candidate"], "c1");

    y.close(None).await.unwrap();
    let hangup = recv_json(&mut x).await;
    assert_eq!(hangup, json!({"type": "hangup", "from": y_id}));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_third_peer_sees_only_the_offer() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr();

    let (mut x, x_id) = connect(addr, "").await;
    let (mut y, _) = connect(addr, "").await;
    let (mut z, _) = connect(addr, "").await;

    send_json(&mut x, json!({"type": "offer", "payload": {"sdp": "O1"}})).await;
    assert_eq!(recv_json(&mut y).await["type"], "offer");
    assert_eq!(recv_json(&mut z).await["type"], "offer");

    send_json(&mut y, json!({"type": "answer", "payload": {"sdp": "A1"}})).await;
    assert_eq!(recv_json(&mut x).await["type"], "answer");
    assert_eq!(recv_json(&mut z).await, json!({"type": "hangup", "from": x_id}));

    send_json(&mut x, json!({"type": "ice-candidate", "payload": {"candidate": "c1"}})).await;
    assert_eq!(recv_json(&mut y).await["type"], "ice-candidate");
    assert_silent(&mut z).await;

    let stats = handle.relay().stats();
    assert_eq!(stats.peers, 3);
    assert_eq!(stats.established_calls, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_addressed_offer_over_websocket() {
    let mut config = test_config();
    config.relay.routing_policy = RoutingPolicy::Addressed;
    let handle = start(config).await;
    let addr = handle.local_addr();

    let (mut x, _) = connect(addr, "").await;
    let (mut y, _) = connect(addr, "").await;
    let (mut z, z_id) = connect(addr, "").await;

    send_json(&mut x, json!({"type": "offer", "payload": {"sdp": "O1"}, "target": z_id})).await;
    assert_eq!(recv_json(&mut z).await["type"], "offer");
    assert_silent(&mut y).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_label_is_forwarded_with_offer() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr();

    let (mut x, _) = connect(addr, "?label=555-0100").await;
    let (mut y, _) = connect(addr, "").await;

    send_json(&mut x, json!({"type": "offer", "payload": {"sdp": "O1"}})).await;
    assert_eq!(recv_json(&mut y).await["label"], "555-0100");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_malformed_message_keeps_connection_open() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr();

    let (mut x, _) = connect(addr, "").await;
    let (mut y, _) = connect(addr, "").await;

    x.send(Message::Text("not json".to_string())).await.unwrap();
    send_json(&mut x, json!({"type": "offer", "payload": "v=0"})).await;
    send_json(&mut x, json!({"type": "answer", "payload": {"sdp": "A1"}})).await;
    x.send(Message::Binary(vec![1, 2, 3])).await.unwrap();

    send_json(&mut x, json!({"type": "offer", "payload": {"sdp": "O1"}})).await;
    let offer = recv_json(&mut y).await;
    assert_eq!(offer["payload"]["sdp"], "O1");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_disallowed_origin_is_rejected() {
    let mut config = test_config();
    config.server.allowed_origins = vec!["http://localhost:3000".to_string()];
    let handle = start(config).await;
    let url = format!("ws://{}/", handle.local_addr());

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://evil.example"));
    match connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::FORBIDDEN),
        other => panic!("Expected 403, got {:?}", other.map(|(_, resp)| resp.status())),
    }

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://localhost:3000"));
    let (mut ws, _) = connect_async(request).await.unwrap();
    assert_eq!(recv_json(&mut ws).await["type"], "welcome");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_peer_limit_closes_extra_connection() {
    let mut config = test_config();
    config.relay.max_peers = 1;
    let handle = start(config).await;
    let addr = handle.local_addr();

    let (_first, _) = connect(addr, "").await;

    let (mut second, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
    let frame = timeout(RECV_TIMEOUT, second.next())
        .await
        .expect("timed out waiting for close")
        .expect("connection ended")
        .expect("websocket error");
    match frame {
        Message::Close(Some(close)) => assert_eq!(close.code, CloseCode::Again),
        other => panic!("Expected close frame, got {:?}", other),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let handle = start(test_config()).await;
    let (mut x, _) = connect(handle.local_addr(), "").await;
    let relay = handle.relay();

    handle.shutdown().await;

    loop {
        match timeout(RECV_TIMEOUT, x.next()).await.expect("timed out") {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        }
    }
    assert_eq!(relay.stats().peers, 0);
}
