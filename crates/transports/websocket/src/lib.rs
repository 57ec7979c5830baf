//! WebSocket signaling transport for the call relay
//!
//! Every peer holds one WebSocket to the relay. Text frames carry the JSON
//! signaling protocol from [`callrelay_core::protocol`]; binary frames are
//! ignored.
//!
//! # Connection lifecycle
//!
//! ```text
//! connect ─► Origin check ─► register (welcome) ─► read/route ─┐
//!                 │ 403           │ close 1013                  │
//!                 ▼               ▼                             ▼
//!              rejected        rejected          unregister (hangup to counterpart)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use callrelay_core::RelayConfig;
//! use callrelay_websocket::WebSocketSignalingServer;
//!
//! # async fn example() -> callrelay_core::Result<()> {
//! let server = WebSocketSignalingServer::new(RelayConfig::default())?;
//! let handle = server.start().await?;
//! println!("listening on ws://{}", handle.local_addr());
//!
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

mod handler;
pub mod server;

pub use handler::handle_connection;
pub use server::{WebSocketServerHandle, WebSocketSignalingServer};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
