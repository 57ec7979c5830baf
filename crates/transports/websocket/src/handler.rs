//! Per-connection WebSocket handling
//!
//! Each accepted socket gets a reader loop (this task) and a writer task. The
//! writer drains the peer's outbound queue; once the relay drops the queue's
//! sender (disconnect, eviction) the writer sends a close frame and exits,
//! which in turn ends the reader.

use callrelay_core::{PeerId, Relay, RelayConfig, ServerMessage};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
        Message, Result as WsResult,
    },
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

/// Longest caller label accepted from the handshake query
const MAX_LABEL_CHARS: usize = 64;

/// How long the reader waits for the writer to flush its close frame
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Extract the advisory `label` query parameter from the upgrade request
pub(crate) fn label_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "label")
        .map(|(_, value)| value.trim().chars().take(MAX_LABEL_CHARS).collect::<String>())
        .filter(|label| !label.is_empty())
}

/// Handle one WebSocket connection from handshake to cleanup
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    relay: Arc<Relay>,
    config: Arc<RelayConfig>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> WsResult<()> {
    let mut label = None;
    let handshake = |req: &Request, resp: Response| {
        let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());
        if !config.origin_allowed(origin) {
            warn!(%addr, ?origin, "Rejecting WebSocket upgrade from disallowed origin");
            let mut reject = ErrorResponse::new(Some("Origin not allowed".to_string()));
            *reject.status_mut() = StatusCode::FORBIDDEN;
            return Err(reject);
        }
        label = label_from_query(req.uri().query());
        Ok(resp)
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.relay.max_message_bytes);
    ws_config.max_frame_size = Some(config.relay.max_message_bytes);

    let ws_stream = accept_hdr_async_with_config(stream, handshake, Some(ws_config)).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let peer_id = PeerId::generate();
    let (tx, rx) = mpsc::channel::<ServerMessage>(config.relay.outbound_queue_capacity);

    if let Err(e) = relay.register(peer_id.clone(), label, tx) {
        warn!(%addr, "Refusing connection: {}", e);
        let close = CloseFrame {
            code: CloseCode::Again,
            reason: e.to_string().into(),
        };
        let _ = ws_tx.send(Message::Close(Some(close))).await;
        return Ok(());
    }

    info!(%addr, peer_id = %peer_id, "WebSocket peer registered");

    let ping_every = Duration::from_secs(config.keepalive.ping_interval_secs);
    let mut writer = tokio::spawn(write_loop(ws_tx, rx, ping_every, peer_id.clone()));
    let mut writer_done = false;

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(peer_id = %peer_id, "WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                };

                relay.touch(&peer_id);

                match msg {
                    Message::Text(text) => {
                        relay.handle_text(&peer_id, &text);
                    }
                    Message::Binary(data) => {
                        warn!(peer_id = %peer_id, bytes = data.len(), "Ignoring binary frame");
                    }
                    Message::Close(_) => {
                        info!(peer_id = %peer_id, "WebSocket connection closed by client");
                        break;
                    }
                    // Pongs only refresh activity; pings are answered by tungstenite
                    _ => {}
                }
            }
            _ = &mut writer => {
                debug!(peer_id = %peer_id, "Writer finished, closing reader");
                writer_done = true;
                break;
            }
            _ = shutdown_rx.recv() => {
                debug!(peer_id = %peer_id, "Server shutting down, closing connection");
                break;
            }
        }
    }

    // Dropping the peer's outbox lets the writer send its close frame
    relay.unregister(&peer_id);

    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        warn!(peer_id = %peer_id, "Writer did not finish in time, aborting");
        writer.abort();
    }

    info!(%addr, peer_id = %peer_id, "WebSocket peer cleaned up");
    Ok(())
}

/// Forward queued messages to the socket and send keepalive pings
async fn write_loop(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<ServerMessage>,
    ping_every: Duration,
    peer_id: PeerId,
) {
    let mut ping = tokio::time::interval(ping_every);
    ping.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };

                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(peer_id = %peer_id, kind = msg.kind(), "Failed to encode message: {}", e);
                        continue;
                    }
                };

                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(peer_id = %peer_id, "Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    warn!(peer_id = %peer_id, "Failed to send ping: {}", e);
                    break;
                }
            }
        }
    }

    debug!(peer_id = %peer_id, "Writer task exiting");
}
