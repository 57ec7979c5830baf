//! WebSocket signaling server
//!
//! Accepts WebSocket connections and hands each one to the relay. Runs on the
//! caller's tokio runtime; [`WebSocketServerHandle::shutdown`] stops the accept
//! loop, closes every connection and waits briefly for them to drain.

use crate::handler::handle_connection;
use callrelay_core::{Relay, RelayConfig, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Grace period for open connections after shutdown is signalled
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// WebSocket signaling server
pub struct WebSocketSignalingServer {
    config: Arc<RelayConfig>,
    relay: Arc<Relay>,
}

impl WebSocketSignalingServer {
    /// Create a server with a fresh relay
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let relay = Arc::new(Relay::new(&config.relay));

        Ok(Self {
            config: Arc::new(config),
            relay,
        })
    }

    /// Relay shared by all connections
    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Bind the listener and start accepting connections
    ///
    /// Returns once the socket is bound, so callers can read the actual
    /// address when binding to port 0.
    pub async fn start(self) -> Result<WebSocketServerHandle> {
        let addr = self.config.listen_addr()?;
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind WebSocket server to {}: {}", addr, e);
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;

        info!(
            policy = %self.relay.policy(),
            "WebSocket signaling server listening on ws://{}",
            local_addr
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.relay),
            Arc::clone(&self.config),
            shutdown_tx.clone(),
        ));

        let sweeper_task = tokio::spawn(idle_sweeper(
            Arc::clone(&self.relay),
            Duration::from_secs(self.config.keepalive.ping_interval_secs),
            Duration::from_secs(self.config.keepalive.idle_timeout_secs),
            shutdown_tx.subscribe(),
        ));

        Ok(WebSocketServerHandle {
            local_addr,
            relay: self.relay,
            shutdown_tx,
            accept_task,
            sweeper_task,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    relay: Arc<Relay>,
    config: Arc<RelayConfig>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted TCP connection from {}", peer_addr);
                        let relay = Arc::clone(&relay);
                        let config = Arc::clone(&config);
                        let conn_shutdown = shutdown_tx.subscribe();
                        connections.spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, peer_addr, relay, config, conn_shutdown).await
                            {
                                warn!("WebSocket connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept WebSocket connection: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.recv() => {
                info!("WebSocket signaling server received shutdown signal");
                break;
            }
        }
    }

    let open = connections.len();
    if open > 0 {
        info!("Waiting for {} open connections to close", open);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Connections still open after grace period, aborting");
            connections.abort_all();
        }
    }

    info!("WebSocket signaling server accept loop exited");
}

async fn idle_sweeper(
    relay: Arc<Relay>,
    every: Duration,
    idle_timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let evicted = relay.evict_idle(idle_timeout);
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "Disconnected idle peers");
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Handle for controlling a running server
pub struct WebSocketServerHandle {
    local_addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
    sweeper_task: JoinHandle<()>,
}

impl WebSocketServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Shut down the server and wait for connections to close
    pub async fn shutdown(self) {
        info!("Sending shutdown signal to WebSocket server");
        let _ = self.shutdown_tx.send(());

        if let Err(e) = self.accept_task.await {
            error!("Accept loop terminated abnormally: {}", e);
        }
        let _ = self.sweeper_task.await;

        let stats = self.relay.stats();
        info!(
            remaining_peers = stats.peers,
            remaining_sessions = stats.sessions,
            "WebSocket signaling server stopped"
        );
    }
}
