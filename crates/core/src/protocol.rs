//! Signaling wire protocol
//!
//! JSON messages tagged by `type`. The relay never inspects `payload`
//! beyond checking that it is a JSON object.

use crate::config::RoutingPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque connection identifier assigned at connect time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message sent by a peer to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Session description offering a call
    Offer {
        payload: Value,
        /// Callee, only meaningful under addressed routing
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<PeerId>,
    },

    /// Session description accepting an offer
    Answer { payload: Value },

    /// Network path proposal for the media connection
    IceCandidate { payload: Value },

    /// End the call
    Hangup,
}

impl ClientMessage {
    /// Parse and validate a text frame
    pub fn parse(text: &str) -> Result<Self> {
        let msg: ClientMessage = serde_json::from_str(text)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Reject payloads that cannot be a session description or candidate
    pub fn validate(&self) -> Result<()> {
        match self.payload() {
            Some(payload) if !payload.is_object() => Err(Error::Protocol(format!(
                "{} payload must be a JSON object",
                self.kind()
            ))),
            _ => Ok(()),
        }
    }

    /// Wire name of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Hangup => "hangup",
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Offer { payload, .. }
            | Self::Answer { payload }
            | Self::IceCandidate { payload } => Some(payload),
            Self::Hangup => None,
        }
    }
}

/// Message sent by the relay to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First message on every connection
    Welcome { peer_id: PeerId, policy: RoutingPolicy },

    /// Incoming call
    Offer {
        from: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        payload: Value,
    },

    /// Callee accepted
    Answer { from: PeerId, payload: Value },

    IceCandidate { from: PeerId, payload: Value },

    /// Counterpart ended the call, left, or lost the race
    Hangup { from: PeerId },
}

impl ServerMessage {
    /// Wire name of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Hangup { .. } => "hangup",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Serialized size of a payload, for logging without exposing SDP contents
pub fn payload_len(payload: &Value) -> usize {
    serde_json::to_string(payload).map(|s| s.len()).unwrap_or(0)
}
