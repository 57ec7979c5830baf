//! Call relay core
//!
//! Connection registry and call-negotiation state machine for a two-party
//! WebRTC signaling relay. Peers exchange session descriptions and ICE
//! candidates through the relay; media never passes through it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Transport (WebSocket, one task pair per peer)       │
//! │  ↓ text frames            ↑ ServerMessage (mpsc)     │
//! │  Relay                                               │
//! │  └─ Mutex<RelayState>                                │
//! │     ├─ Registry      (peer id → outbox, pairing)     │
//! │     └─ SessionTable  (caller/callee, Idle→Answered)  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use callrelay_core::{ClientMessage, PeerId, Relay, RelaySettings, RouteOutcome};
//! use serde_json::json;
//! use tokio::sync::mpsc;
//!
//! let relay = Relay::new(&RelaySettings::default());
//!
//! let (caller_tx, _caller_rx) = mpsc::channel(16);
//! let (callee_tx, _callee_rx) = mpsc::channel(16);
//! relay.register(PeerId::from("caller"), None, caller_tx).unwrap();
//! relay.register(PeerId::from("callee"), None, callee_tx).unwrap();
//!
//! let outcome = relay.handle_message(
//!     &PeerId::from("caller"),
//!     ClientMessage::Offer { payload: json!({"sdp": "v=0"}), target: None },
//! );
//! assert_eq!(outcome, RouteOutcome::Delivered { recipients: 1 });
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;

pub use config::{ConfigError, KeepaliveConfig, RelayConfig, RelaySettings, RoutingPolicy, ServerConfig};
pub use error::{Error, Result};
pub use protocol::{ClientMessage, PeerId, ServerMessage};
pub use registry::{DeliveryFailure, Outbox, Pairing, PeerInfo};
pub use relay::{CloseReason, DropReason, Relay, RelayStats, RouteOutcome};
pub use session::{SessionId, SessionInfo, SessionState};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
