use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::pool_id::PoolId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignalFlag {
    #[default]
    Unknown,
    Candidate,
    Answer,
    Offer,
}

/// One negotiation record exchanged through the relay.
///
/// `id` always carries the sender's own view of the negotiation; the
/// receiver routes it to `id.flipped()`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub flag: SignalFlag,
    pub id: PoolId,
    pub source: String,
    pub target: String,
    /// Session description, offers and answers only.
    pub sdp: String,
    /// Opaque ICE payload, candidates only.
    pub candidate: Vec<u8>,
    /// Envelope type requested by the initiator, offers only.
    pub remote_request_type: i32,
}

impl SignalingMessage {
    pub fn offer(id: PoolId, source: &str, target: &str, sdp: String, request_type: i32) -> Self {
        Self {
            flag: SignalFlag::Offer,
            id,
            source: source.to_string(),
            target: target.to_string(),
            sdp,
            remote_request_type: request_type,
            ..Default::default()
        }
    }

    pub fn answer(id: PoolId, source: &str, target: &str, sdp: String) -> Self {
        Self {
            flag: SignalFlag::Answer,
            id,
            source: source.to_string(),
            target: target.to_string(),
            sdp,
            ..Default::default()
        }
    }

    pub fn candidate(id: PoolId, source: &str, target: &str, candidate: Vec<u8>) -> Self {
        Self {
            flag: SignalFlag::Candidate,
            id,
            source: source.to_string(),
            target: target.to_string(),
            candidate,
            ..Default::default()
        }
    }

    /// The zero value a pull returns when nothing arrived in time.
    pub fn is_empty(&self) -> bool {
        self.flag == SignalFlag::Unknown && self.id.is_zero() && self.source.is_empty()
    }

    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.source.is_empty() {
            return Err(ProtoError::InvalidMessage("empty source"));
        }
        if self.target.is_empty() {
            return Err(ProtoError::InvalidMessage("empty target"));
        }
        if self.id.is_zero() {
            return Err(ProtoError::InvalidMessage("zero id"));
        }
        Ok(())
    }
}
