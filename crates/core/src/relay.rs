//! Signaling relay
//!
//! Routes offers, answers, ICE candidates and hangups between the two peers
//! of a session. The registry and the session table sit behind one mutex and
//! every routing decision runs to completion under it, so no caller ever
//! observes a half-updated pairing. Outbound messages are queued with
//! `try_send` while the lock is held, which keeps per-recipient order equal to
//! routing order without ever blocking on a slow peer.
//!
//! # Routing policies
//!
//! - [`RoutingPolicy::Broadcast`]: an offer goes to every other idle peer and
//!   opens one tentative session per recipient. The first callee to answer
//!   claims the call; the remaining tentative sessions are closed and their
//!   callees receive `hangup`.
//! - [`RoutingPolicy::Addressed`]: an offer must name its callee in `target`
//!   and opens exactly one session.
//!
//! An offer that does not match the configured policy is dropped; the two
//! policies are never mixed on one relay.
//!
//! # Failure handling
//!
//! Client protocol violations are logged and reported as
//! [`RouteOutcome::Dropped`]. A recipient whose queue is full or closed is
//! evicted in the same step, exactly as if it had disconnected.

use crate::config::{RelaySettings, RoutingPolicy};
use crate::protocol::{payload_len, ClientMessage, PeerId, ServerMessage};
use crate::registry::{Outbox, Pairing, PeerInfo, Registry};
use crate::session::{Role, Session, SessionId, SessionInfo, SessionState, SessionTable};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Result of routing one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Message forwarded to this many peers
    Delivered { recipients: usize },
    /// Hangup closed this many sessions
    Closed { sessions: usize },
    /// Nothing to do (e.g. hangup with no session)
    NoOp,
    /// Message discarded
    Dropped(DropReason),
}

impl RouteOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped(_))
    }
}

/// Why a message was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not valid JSON, unknown type, or bad payload
    Malformed,
    /// Sender is not registered
    UnknownSender,
    /// `target` present under broadcast routing, or absent under addressed routing
    PolicyMismatch,
    /// Addressed callee is unknown, busy, or the sender itself
    TargetUnavailable,
    /// No idle peer to offer to
    NoEligibleRecipient,
    /// Sender has no session for this message
    NoSession,
    /// Session is not in a state that accepts this message
    WrongState,
    /// Counterpart's queue failed while forwarding
    RecipientGone,
}

/// Why a session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit hangup
    Hangup,
    /// Peer disconnected or was evicted
    PeerGone,
    /// Peer sent a new offer
    Superseded,
    /// Another callee answered first
    Cancelled,
}

/// Relay counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStats {
    pub peers: usize,
    pub sessions: usize,
    pub established_calls: usize,
}

struct RelayState {
    registry: Registry,
    sessions: SessionTable,
}

impl RelayState {
    fn check_invariants(&self) -> Result<()> {
        self.sessions.check_index()?;

        for session in self.sessions.iter() {
            for member in [session.caller(), session.callee()] {
                if !self.registry.contains(member) {
                    return Err(Error::InvariantViolation(format!(
                        "{} references unregistered peer {}",
                        session.id(),
                        member
                    )));
                }
            }
            if session.state().is_terminal() {
                return Err(Error::InvariantViolation(format!(
                    "closed {} still in table",
                    session.id()
                )));
            }
        }

        for peer in self.registry.iter() {
            let sessions: Vec<&Session> = self
                .sessions
                .sessions_of(peer.id())
                .iter()
                .filter_map(|sid| self.sessions.get(*sid))
                .collect();

            let as_callee = sessions.iter().filter(|s| s.callee() == peer.id()).count();
            if as_callee > 1 || (as_callee == 1 && sessions.len() > 1) {
                return Err(Error::InvariantViolation(format!(
                    "peer {} belongs to {} sessions",
                    peer.id(),
                    sessions.len()
                )));
            }

            if let Some(first) = sessions.first() {
                if sessions.iter().any(|s| s.attempt() != first.attempt()) {
                    return Err(Error::InvariantViolation(format!(
                        "peer {} holds sessions from different offers",
                        peer.id()
                    )));
                }
            }

            let answered = sessions
                .iter()
                .filter(|s| s.state() == SessionState::Answered)
                .count();
            if answered > 0 && sessions.len() > 1 {
                return Err(Error::InvariantViolation(format!(
                    "peer {} is in a call and still holds tentative sessions",
                    peer.id()
                )));
            }

            let expected = match (sessions.is_empty(), answered) {
                (true, _) => Pairing::None,
                (false, 0) => Pairing::Pending,
                (false, _) => Pairing::Established,
            };
            if peer.pairing() != expected {
                return Err(Error::InvariantViolation(format!(
                    "peer {} pairing is {:?}, sessions imply {:?}",
                    peer.id(),
                    peer.pairing(),
                    expected
                )));
            }
        }

        Ok(())
    }
}

/// Report corrupted relay state; panics in debug builds
fn invariant_broken(e: &Error) {
    error!("Relay state corrupted: {}", e);
    debug_assert!(false, "relay invariant violated: {}", e);
}

/// One atomic step against the relay state
struct Dispatch<'a> {
    state: &'a mut RelayState,
    now: Instant,
    /// Peers whose queues failed during this step, removed before the lock is released
    evicted: Vec<PeerId>,
}

impl Dispatch<'_> {
    fn send(&mut self, to: &PeerId, msg: ServerMessage) -> bool {
        if self.evicted.contains(to) {
            return false;
        }

        let Some(peer) = self.state.registry.lookup(to) else {
            debug!(peer_id = %to, kind = msg.kind(), "Recipient not registered, dropping");
            return false;
        };

        match peer.try_deliver(msg) {
            Ok(()) => true,
            Err(failure) => {
                warn!(peer_id = %to, ?failure, "Outbound queue unusable, disconnecting peer");
                self.evicted.push(to.clone());
                false
            }
        }
    }

    fn advance(&mut self, sid: SessionId, next: SessionState) {
        if let Some(session) = self.state.sessions.get_mut(sid) {
            if let Err(e) = session.transition(next) {
                invariant_broken(&e);
            }
        }
    }

    fn close_session(&mut self, sid: SessionId, reason: CloseReason) -> Option<Session> {
        let mut session = self.state.sessions.remove(sid)?;
        let previous = session.state();
        if let Err(e) = session.transition(SessionState::Closed) {
            invariant_broken(&e);
        }
        info!(
            session_id = %sid,
            caller = %session.caller(),
            callee = %session.callee(),
            ?reason,
            "Session closed (was {:?})",
            previous
        );
        Some(session)
    }

    /// Close every session of `peer` and notify the survivors
    ///
    /// Callees always hear about their caller leaving. A caller hears about a
    /// callee leaving only once its last session for the offer is gone.
    fn teardown(&mut self, peer: &PeerId, reason: CloseReason) -> usize {
        let ids = self.state.sessions.sessions_of(peer).to_vec();
        let mut closed = 0;

        for sid in ids {
            let Some(session) = self.close_session(sid, reason) else {
                continue;
            };
            closed += 1;

            let Some(other) = session.counterpart(peer).cloned() else {
                invariant_broken(&Error::InvariantViolation(format!(
                    "{} indexed under foreign session {}",
                    peer, sid
                )));
                continue;
            };

            let notify = match session.role_of(peer) {
                Some(Role::Caller) => true,
                _ => self.state.sessions.sessions_of(&other).is_empty(),
            };

            if notify {
                self.state.registry.set_pairing(&other, Pairing::None);
                self.send(&other, ServerMessage::Hangup { from: peer.clone() });
            }
        }

        self.state.registry.set_pairing(peer, Pairing::None);
        closed
    }

    fn route_offer(
        &mut self,
        from: &PeerId,
        payload: Value,
        target: Option<PeerId>,
        policy: RoutingPolicy,
    ) -> RouteOutcome {
        match (policy, &target) {
            (RoutingPolicy::Broadcast, Some(_)) | (RoutingPolicy::Addressed, None) => {
                return RouteOutcome::Dropped(DropReason::PolicyMismatch);
            }
            _ => {}
        }

        if !self.state.sessions.sessions_of(from).is_empty() {
            info!(peer_id = %from, "New offer supersedes existing session");
            self.teardown(from, CloseReason::Superseded);
        }

        let recipients: Vec<PeerId> = match target {
            None => self.state.registry.idle_peers_except(from),
            Some(target) => {
                let available = target != *from
                    && self
                        .state
                        .registry
                        .lookup(&target)
                        .is_some_and(|peer| peer.pairing().is_idle());
                if !available {
                    return RouteOutcome::Dropped(DropReason::TargetUnavailable);
                }
                vec![target]
            }
        };
        let recipients: Vec<PeerId> = recipients
            .into_iter()
            .filter(|id| !self.evicted.contains(id))
            .collect();

        if recipients.is_empty() {
            return RouteOutcome::Dropped(DropReason::NoEligibleRecipient);
        }

        let label = self
            .state
            .registry
            .lookup(from)
            .and_then(|peer| peer.label().map(str::to_string));
        let attempt = self.state.sessions.new_attempt();
        let mut delivered = 0;

        for callee in recipients {
            let sid = match self
                .state
                .sessions
                .open(from.clone(), callee.clone(), attempt, self.now)
            {
                Ok(sid) => sid,
                Err(e) => {
                    invariant_broken(&e);
                    continue;
                }
            };

            let offer = ServerMessage::Offer {
                from: from.clone(),
                label: label.clone(),
                payload: payload.clone(),
            };

            if self.send(&callee, offer) {
                self.advance(sid, SessionState::Offered);
                self.state.registry.set_pairing(&callee, Pairing::Pending);
                delivered += 1;
            } else {
                self.state.sessions.remove(sid);
            }
        }

        if delivered == 0 {
            return RouteOutcome::Dropped(DropReason::NoEligibleRecipient);
        }

        self.state.registry.set_pairing(from, Pairing::Pending);
        info!(
            peer_id = %from,
            %attempt,
            recipients = delivered,
            bytes = payload_len(&payload),
            "Offer routed"
        );
        RouteOutcome::Delivered {
            recipients: delivered,
        }
    }

    fn route_answer(&mut self, from: &PeerId, payload: Value) -> RouteOutcome {
        let Some(sid) = self.state.sessions.callee_session(from) else {
            return RouteOutcome::Dropped(DropReason::NoSession);
        };
        let Some(session) = self.state.sessions.get(sid) else {
            return RouteOutcome::Dropped(DropReason::NoSession);
        };
        if session.state() != SessionState::Offered {
            return RouteOutcome::Dropped(DropReason::WrongState);
        }
        let caller = session.caller().clone();

        let bytes = payload_len(&payload);
        let answer = ServerMessage::Answer {
            from: from.clone(),
            payload,
        };
        if !self.send(&caller, answer) {
            return RouteOutcome::Dropped(DropReason::RecipientGone);
        }

        self.advance(sid, SessionState::Answered);

        for sibling in self.state.sessions.siblings(sid) {
            if let Some(cancelled) = self.close_session(sibling, CloseReason::Cancelled) {
                let loser = cancelled.callee().clone();
                self.state.registry.set_pairing(&loser, Pairing::None);
                self.send(&loser, ServerMessage::Hangup { from: caller.clone() });
            }
        }

        self.state.registry.set_pairing(&caller, Pairing::Established);
        self.state.registry.set_pairing(from, Pairing::Established);

        info!(session_id = %sid, %caller, callee = %from, bytes, "Call answered");
        RouteOutcome::Delivered { recipients: 1 }
    }

    fn route_ice_candidate(&mut self, from: &PeerId, payload: Value) -> RouteOutcome {
        let counterparts: Vec<PeerId> = self
            .state
            .sessions
            .sessions_of(from)
            .iter()
            .filter_map(|sid| self.state.sessions.get(*sid))
            .filter_map(|session| session.counterpart(from).cloned())
            .collect();

        if counterparts.is_empty() {
            return RouteOutcome::Dropped(DropReason::NoSession);
        }

        let mut delivered = 0;
        for to in &counterparts {
            let candidate = ServerMessage::IceCandidate {
                from: from.clone(),
                payload: payload.clone(),
            };
            if self.send(to, candidate) {
                delivered += 1;
            }
        }

        if delivered == 0 {
            return RouteOutcome::Dropped(DropReason::RecipientGone);
        }

        debug!(peer_id = %from, recipients = delivered, "ICE candidate relayed");
        RouteOutcome::Delivered {
            recipients: delivered,
        }
    }

    fn hangup(&mut self, from: &PeerId) -> RouteOutcome {
        if self.state.sessions.sessions_of(from).is_empty() {
            debug!(peer_id = %from, "Hangup without session, ignoring");
            return RouteOutcome::NoOp;
        }
        let sessions = self.teardown(from, CloseReason::Hangup);
        RouteOutcome::Closed { sessions }
    }

    /// Unregister evicted peers, including any evicted while tearing these down
    fn drain_evictions(&mut self) -> Vec<PeerId> {
        let mut removed = Vec::new();
        let mut next = 0;

        while next < self.evicted.len() {
            let id = self.evicted[next].clone();
            next += 1;

            let closed = self.teardown(&id, CloseReason::PeerGone);
            if self.state.registry.unregister(&id).is_some() {
                info!(peer_id = %id, closed_sessions = closed, "Peer evicted");
                removed.push(id);
            }
        }

        self.evicted.clear();
        removed
    }
}

/// Registry + session table with one serialization point
///
/// Construct one per server; tests build as many independent relays as they
/// need.
///
/// A broken invariant (a peer in two sessions, an illegal state transition)
/// panics in debug builds. Release builds log it at `error` and keep routing;
/// the full consistency sweep after each step runs in debug builds only.
pub struct Relay {
    state: Mutex<RelayState>,
    policy: RoutingPolicy,
}

impl Relay {
    pub fn new(settings: &RelaySettings) -> Self {
        info!(
            policy = %settings.routing_policy,
            max_peers = settings.max_peers,
            "Creating signaling relay"
        );

        Self {
            state: Mutex::new(RelayState {
                registry: Registry::new(settings.max_peers),
                sessions: SessionTable::new(),
            }),
            policy: settings.routing_policy,
        }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut Dispatch<'_>) -> R) -> R {
        let mut guard = self.state.lock();
        let mut dispatch = Dispatch {
            state: &mut guard,
            now: Instant::now(),
            evicted: Vec::new(),
        };

        let result = f(&mut dispatch);
        dispatch.drain_evictions();

        if cfg!(debug_assertions) {
            if let Err(e) = guard.check_invariants() {
                invariant_broken(&e);
            }
        }

        result
    }

    /// Add a connected peer and send it a `welcome`
    ///
    /// # Errors
    ///
    /// Returns error if the identifier is already registered or the relay is
    /// at capacity.
    pub fn register(
        &self,
        id: PeerId,
        label: Option<String>,
        outbox: Outbox,
    ) -> Result<PeerInfo> {
        let policy = self.policy;
        self.with_state(|d| {
            let now = d.now;
            let info = d.state.registry.register(id.clone(), label, outbox, now)?.info(now);
            info!(peer_id = %id, label = ?info.label, "Peer connected");

            d.send(
                &id,
                ServerMessage::Welcome {
                    peer_id: id.clone(),
                    policy,
                },
            );
            Ok(info)
        })
    }

    /// Remove a peer, closing its sessions and notifying counterparts
    ///
    /// Returns false if the peer was not registered.
    pub fn unregister(&self, id: &PeerId) -> bool {
        self.with_state(|d| {
            if !d.state.registry.contains(id) {
                return false;
            }
            let closed = d.teardown(id, CloseReason::PeerGone);
            d.state.registry.unregister(id);
            info!(peer_id = %id, closed_sessions = closed, "Peer disconnected");
            true
        })
    }

    pub fn lookup(&self, id: &PeerId) -> Option<PeerInfo> {
        let state = self.state.lock();
        let now = Instant::now();
        state.registry.lookup(id).map(|peer| peer.info(now))
    }

    /// Record inbound activity (any frame, including pongs)
    pub fn touch(&self, id: &PeerId) -> bool {
        let mut state = self.state.lock();
        state.registry.touch(id, Instant::now())
    }

    /// Parse a text frame and route it
    pub fn handle_text(&self, from: &PeerId, text: &str) -> RouteOutcome {
        match ClientMessage::parse(text) {
            Ok(msg) => self.handle_message(from, msg),
            Err(e) => {
                warn!(peer_id = %from, bytes = text.len(), "Dropping malformed message: {}", e);
                RouteOutcome::Dropped(DropReason::Malformed)
            }
        }
    }

    /// Route one message from `from`
    pub fn handle_message(&self, from: &PeerId, msg: ClientMessage) -> RouteOutcome {
        if let Err(e) = msg.validate() {
            warn!(peer_id = %from, "Dropping malformed message: {}", e);
            return RouteOutcome::Dropped(DropReason::Malformed);
        }

        let policy = self.policy;
        let kind = msg.kind();

        self.with_state(|d| {
            if !d.state.registry.touch(from, d.now) {
                warn!(peer_id = %from, kind, "Message from unregistered peer");
                return RouteOutcome::Dropped(DropReason::UnknownSender);
            }

            let outcome = match msg {
                ClientMessage::Offer { payload, target } => {
                    d.route_offer(from, payload, target, policy)
                }
                ClientMessage::Answer { payload } => d.route_answer(from, payload),
                ClientMessage::IceCandidate { payload } => d.route_ice_candidate(from, payload),
                ClientMessage::Hangup => d.hangup(from),
            };

            if let RouteOutcome::Dropped(reason) = outcome {
                warn!(peer_id = %from, kind, ?reason, "Dropping message");
            }
            outcome
        })
    }

    /// Disconnect peers with no inbound activity for longer than `timeout`
    pub fn evict_idle(&self, timeout: Duration) -> Vec<PeerId> {
        self.with_state(|d| {
            let stale = d.state.registry.stale_peers(d.now, timeout);
            for id in &stale {
                warn!(peer_id = %id, ?timeout, "Peer idle too long, disconnecting");
                if !d.evicted.contains(id) {
                    d.evicted.push(id.clone());
                }
            }
            stale
        })
    }

    /// Sessions `peer` currently belongs to
    pub fn sessions_of(&self, peer: &PeerId) -> Vec<SessionInfo> {
        let state = self.state.lock();
        state
            .sessions
            .sessions_of(peer)
            .iter()
            .filter_map(|sid| state.sessions.get(*sid))
            .map(Session::info)
            .collect()
    }

    pub fn stats(&self) -> RelayStats {
        let state = self.state.lock();
        RelayStats {
            peers: state.registry.len(),
            sessions: state.sessions.len(),
            established_calls: state
                .sessions
                .iter()
                .filter(|s| s.state() == SessionState::Answered)
                .count(),
        }
    }

    /// Check registry/session consistency
    pub fn verify_invariants(&self) -> Result<()> {
        self.state.lock().check_invariants()
    }
}
