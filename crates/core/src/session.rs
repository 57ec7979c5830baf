//! Session table
//!
//! A session pairs a caller with one callee. Sessions live in an arena keyed
//! by [`SessionId`] with a per-peer index, so several call attempts can be in
//! flight at once. Under broadcast routing one offer opens a tentative session
//! per recipient; all of them share an [`AttemptId`].

use crate::protocol::PeerId;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;
use tracing::debug;

/// Session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-{}", self.0)
    }
}

/// Groups the tentative sessions created by one offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a-{}", self.0)
    }
}

/// Negotiation state
///
/// The relay never sees media flow, so `Answered` is treated as the active
/// call until a hangup or disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, offer not yet delivered
    Idle,
    /// Offer delivered to the callee
    Offered,
    /// Callee answered; call is live
    Answered,
    /// Torn down
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Offered)
                | (Self::Offered, Self::Answered)
                | (Self::Idle | Self::Offered | Self::Answered, Self::Closed)
        )
    }
}

/// Role a peer plays in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// A pairing between two peers
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    attempt: AttemptId,
    caller: PeerId,
    callee: PeerId,
    state: SessionState,
    created_at: Instant,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn caller(&self) -> &PeerId {
        &self.caller
    }

    pub fn callee(&self) -> &PeerId {
        &self.callee
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The other member of the session, if `peer` is a member
    pub fn counterpart(&self, peer: &PeerId) -> Option<&PeerId> {
        if *peer == self.caller {
            Some(&self.callee)
        } else if *peer == self.callee {
            Some(&self.caller)
        } else {
            None
        }
    }

    pub fn role_of(&self, peer: &PeerId) -> Option<Role> {
        if *peer == self.caller {
            Some(Role::Caller)
        } else if *peer == self.callee {
            Some(Role::Callee)
        } else {
            None
        }
    }

    /// Move to `next`, rejecting edges the state machine does not allow
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvariantViolation(format!(
                "session {} cannot move from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        debug!(
            session_id = %self.id,
            "Session state transition: {:?} -> {:?}", self.state, next
        );
        self.state = next;
        Ok(())
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            caller: self.caller.clone(),
            callee: self.callee.clone(),
            state: self.state,
        }
    }
}

/// Snapshot of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub caller: PeerId,
    pub callee: PeerId,
    pub state: SessionState,
}

/// Arena of sessions with a per-peer index
#[derive(Debug, Default)]
pub struct SessionTable {
    next_session: u64,
    next_attempt: u64,
    sessions: HashMap<SessionId, Session>,
    by_peer: HashMap<PeerId, Vec<SessionId>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an identifier for a new offer
    pub fn new_attempt(&mut self) -> AttemptId {
        self.next_attempt += 1;
        AttemptId(self.next_attempt)
    }

    /// Open a session in state `Idle`
    ///
    /// # Errors
    ///
    /// Refuses to open a session that would put the callee in a second
    /// session, make the caller a callee elsewhere, or mix attempts on one
    /// caller. These are invariant violations, not client errors.
    pub fn open(
        &mut self,
        caller: PeerId,
        callee: PeerId,
        attempt: AttemptId,
        now: Instant,
    ) -> Result<SessionId> {
        if caller == callee {
            return Err(Error::InvariantViolation(format!(
                "peer {} cannot call itself",
                caller
            )));
        }

        if !self.sessions_of(&callee).is_empty() {
            return Err(Error::InvariantViolation(format!(
                "callee {} already belongs to a session",
                callee
            )));
        }

        for sid in self.sessions_of(&caller) {
            let existing = &self.sessions[sid];
            if existing.caller != caller || existing.attempt != attempt {
                return Err(Error::InvariantViolation(format!(
                    "caller {} already belongs to session {}",
                    caller, existing.id
                )));
            }
        }

        self.next_session += 1;
        let id = SessionId(self.next_session);

        debug!(session_id = %id, %caller, %callee, %attempt, "Opening session");

        self.by_peer.entry(caller.clone()).or_default().push(id);
        self.by_peer.entry(callee.clone()).or_default().push(id);
        self.sessions.insert(
            id,
            Session {
                id,
                attempt,
                caller,
                callee,
                state: SessionState::Idle,
                created_at: now,
            },
        );

        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Sessions `peer` belongs to, in creation order
    pub fn sessions_of(&self, peer: &PeerId) -> &[SessionId] {
        self.by_peer.get(peer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The session in which `peer` is the callee
    pub fn callee_session(&self, peer: &PeerId) -> Option<SessionId> {
        self.sessions_of(peer)
            .iter()
            .copied()
            .find(|sid| self.sessions[sid].callee == *peer)
    }

    /// Other sessions opened by the same offer
    pub fn siblings(&self, id: SessionId) -> Vec<SessionId> {
        let Some(session) = self.sessions.get(&id) else {
            return Vec::new();
        };
        self.sessions_of(&session.caller)
            .iter()
            .copied()
            .filter(|sid| *sid != id && self.sessions[sid].attempt == session.attempt)
            .collect()
    }

    /// Remove a session and drop it from both peers' indexes
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        for peer in [&session.caller, &session.callee] {
            if let Some(ids) = self.by_peer.get_mut(peer) {
                ids.retain(|sid| *sid != id);
                if ids.is_empty() {
                    self.by_peer.remove(peer);
                }
            }
        }
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Check that the peer index agrees with the arena
    pub fn check_index(&self) -> Result<()> {
        for (peer, ids) in &self.by_peer {
            for sid in ids {
                let session = self.sessions.get(sid).ok_or_else(|| {
                    Error::InvariantViolation(format!("index of {} names missing {}", peer, sid))
                })?;
                if session.role_of(peer).is_none() {
                    return Err(Error::InvariantViolation(format!(
                        "index of {} names foreign {}",
                        peer, sid
                    )));
                }
            }
        }
        for session in self.sessions.values() {
            for peer in [&session.caller, &session.callee] {
                if !self.sessions_of(peer).contains(&session.id) {
                    return Err(Error::InvariantViolation(format!(
                        "{} missing from index of {}",
                        session.id, peer
                    )));
                }
            }
        }
        Ok(())
    }
}
