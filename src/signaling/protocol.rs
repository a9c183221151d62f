//! Signaling message types
//!
//! Messages are transient: they bootstrap a peer connection and are never
//! persisted. The transport gives no delivery or cross-type ordering
//! guarantee, so receivers tolerate loss (via renegotiation) and duplicates
//! (via idempotent handling).

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Envelope for a single signaling exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalingMessage {
    /// Participant that produced the message
    pub sender_id: String,

    /// Call session this message belongs to
    pub session_id: String,

    /// Wall-clock send time in milliseconds since the Unix epoch
    pub timestamp_ms: u64,

    /// Negotiation payload
    pub payload: SignalingPayload,
}

/// Signaling payload variants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingPayload {
    /// SDP offer from the initiator
    Offer {
        /// SDP offer
        sdp: String,
    },

    /// SDP answer from the responder
    Answer {
        /// SDP answer
        sdp: String,
    },

    /// Trickled ICE candidate
    IceCandidate {
        /// ICE candidate string
        candidate: String,

        /// SDP media section identifier
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,

        /// SDP media line index
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },

    /// Participant presence broadcast
    Presence {
        /// Presence status
        status: PresenceStatus,
    },
}

/// Presence status carried by [`SignalingPayload::Presence`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceStatus {
    /// Local media is acquired and the participant can negotiate
    Ready,
    /// The participant left the call
    Ended,
}

impl SignalingMessage {
    /// Build a message with the current timestamp
    pub fn new(
        sender_id: impl Into<String>,
        session_id: impl Into<String>,
        payload: SignalingPayload,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            session_id: session_id.into(),
            timestamp_ms: unix_millis(),
            payload,
        }
    }

    /// Build an offer message
    pub fn offer(sender_id: impl Into<String>, session_id: impl Into<String>, sdp: String) -> Self {
        Self::new(sender_id, session_id, SignalingPayload::Offer { sdp })
    }

    /// Build an answer message
    pub fn answer(
        sender_id: impl Into<String>,
        session_id: impl Into<String>,
        sdp: String,
    ) -> Self {
        Self::new(sender_id, session_id, SignalingPayload::Answer { sdp })
    }

    /// Build a presence message
    pub fn presence(
        sender_id: impl Into<String>,
        session_id: impl Into<String>,
        status: PresenceStatus,
    ) -> Self {
        Self::new(sender_id, session_id, SignalingPayload::Presence { status })
    }

    /// Message kind for logging
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            SignalingPayload::Offer { .. } => "offer",
            SignalingPayload::Answer { .. } => "answer",
            SignalingPayload::IceCandidate { .. } => "ice-candidate",
            SignalingPayload::Presence { .. } => "presence",
        }
    }

    /// Convert message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::Serialization(format!("failed to serialize signaling message: {}", e))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::Serialization(format!("failed to deserialize signaling message: {}", e))
        })
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
