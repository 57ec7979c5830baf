//! Connection registry
//!
//! Tracks the peers currently connected to the relay. The registry is a plain
//! owned table; [`crate::relay::Relay`] holds it behind the same lock as the
//! session table so that pairing updates are atomic.

use crate::protocol::{PeerId, ServerMessage};
use crate::{Error, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Sending half of a peer's bounded outbound queue
pub type Outbox = mpsc::Sender<ServerMessage>;

/// Where a peer stands in call negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pairing {
    /// Not part of any session
    #[default]
    None,
    /// Holds one or more tentative (offered) sessions
    Pending,
    /// Holds exactly one answered session
    Established,
}

impl Pairing {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Why an outbound message could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Queue is full; the peer is too slow
    QueueFull,
    /// Receiving side is gone
    Closed,
}

/// A live connection endpoint
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    label: Option<String>,
    pairing: Pairing,
    connected_at: Instant,
    last_activity: Instant,
    outbox: Outbox,
}

impl Peer {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Advisory display label (never used for routing)
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn pairing(&self) -> Pairing {
        self.pairing
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Queue a message without waiting
    pub fn try_deliver(&self, msg: ServerMessage) -> std::result::Result<(), DeliveryFailure> {
        self.outbox.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryFailure::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }

    /// Read-only view of this peer
    pub fn info(&self, now: Instant) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            label: self.label.clone(),
            pairing: self.pairing,
            connected_for: now.saturating_duration_since(self.connected_at),
            idle_for: now.saturating_duration_since(self.last_activity),
        }
    }
}

/// Snapshot of a registered peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub label: Option<String>,
    pub pairing: Pairing,
    pub connected_for: Duration,
    pub idle_for: Duration,
}

/// Set of connected peers keyed by connection identifier
#[derive(Debug)]
pub struct Registry {
    peers: HashMap<PeerId, Peer>,
    /// Maximum number of peers (0 = unlimited)
    max_peers: usize,
}

impl Registry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
        }
    }

    /// Add a peer in pairing state `None`
    ///
    /// # Errors
    ///
    /// Returns error if the identifier is already registered or the registry
    /// is at capacity.
    pub fn register(
        &mut self,
        id: PeerId,
        label: Option<String>,
        outbox: Outbox,
        now: Instant,
    ) -> Result<&Peer> {
        if self.peers.contains_key(&id) {
            return Err(Error::DuplicatePeer(id.to_string()));
        }

        if self.max_peers > 0 && self.peers.len() >= self.max_peers {
            return Err(Error::PeerLimitReached(self.max_peers));
        }

        debug!(peer_id = %id, total = self.peers.len() + 1, "Registering peer");

        let peer = Peer {
            id: id.clone(),
            label,
            pairing: Pairing::None,
            connected_at: now,
            last_activity: now,
            outbox,
        };
        Ok(self.peers.entry(id).or_insert(peer))
    }

    /// Remove a peer, returning its record
    pub fn unregister(&mut self, id: &PeerId) -> Option<Peer> {
        let removed = self.peers.remove(id);
        if removed.is_some() {
            debug!(peer_id = %id, remaining = self.peers.len(), "Unregistered peer");
        }
        removed
    }

    pub fn lookup(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Update a peer's pairing state; returns false for unknown peers
    pub fn set_pairing(&mut self, id: &PeerId, pairing: Pairing) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.pairing = pairing;
                true
            }
            None => false,
        }
    }

    /// Record inbound activity; returns false for unknown peers
    pub fn touch(&mut self, id: &PeerId, now: Instant) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Idle peers other than `except`, oldest connection first
    pub fn idle_peers_except(&self, except: &PeerId) -> Vec<PeerId> {
        let mut idle: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| p.id != *except && p.pairing.is_idle())
            .collect();
        idle.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        idle.into_iter().map(|p| p.id.clone()).collect()
    }

    /// Peers whose last activity is older than `timeout`
    pub fn stale_peers(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_activity) > timeout)
            .map(|p| p.id.clone())
            .collect()
    }
}
