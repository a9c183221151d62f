//! Two-party WebRTC call engine for telehealth consultations
//!
//! This crate establishes, monitors, degrades, and tears down a
//! peer-to-peer audio/video session between exactly two participants over
//! an unreliable network, coordinated through an out-of-band signaling
//! channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  UI layer                                                │
//! │  ↓ start / toggles / reconnect / end    ↑ state snapshot │
//! │  CallSession                                             │
//! │  ├─ StreamManager (camera + mic capture, mute, release)  │
//! │  ├─ ConnectionManager (peer connection, offer/answer/ICE)│
//! │  ├─ QualityMonitor (stats sampling → quality tiers)      │
//! │  ├─ RetryPolicy (backoff for sends and reconnection)     │
//! │  └─ SignalingChannel (abstract duplex transport)         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The session owns at most one live peer connection at a time; the local
//! capture stream outlives reconnections and is released exactly once when
//! the call reaches a terminal phase.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use telecare_rtc::{
//!     CallConfig, CallDescriptor, CallRole, CallSession, MemorySignaling,
//!     SyntheticMediaSource,
//! };
//!
//! # async fn example() -> telecare_rtc::Result<()> {
//! let session = CallSession::new(
//!     CallDescriptor {
//!         session_id: "consultation-42".to_string(),
//!         local_participant_id: "patient-7".to_string(),
//!         remote_participant_id: "physician-3".to_string(),
//!         role: CallRole::Initiator,
//!     },
//!     CallConfig::default(),
//!     Arc::new(MemorySignaling::new()),
//!     Arc::new(SyntheticMediaSource::new()),
//! )?;
//!
//! session.start().await?;
//! let mut states = session.subscribe_state();
//! while states.changed().await.is_ok() {
//!     let snapshot = states.borrow().clone();
//!     println!("phase: {:?}", snapshot.phase);
//!     if snapshot.phase.is_terminal() {
//!         break;
//!     }
//! }
//! session.end().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod quality;
pub mod retry;
pub mod session;
pub mod signaling;

// Re-exports for the public API
pub use config::{CallConfig, QualityThresholds, TurnServerConfig};
pub use error::{Error, Result};
pub use media::{
    LocalTrack, MediaDeviceSource, MediaStreamHandle, RemoteStreamHandle, RemoteTrack,
    StreamManager, SyntheticMediaSource, TrackKind,
};
pub use peer::{ConnectionEvent, ConnectionEventKind, ConnectionManager, PeerState};
pub use quality::{
    DegradeTracker, QualityLevel, QualityMonitor, QualityShift, QualitySnapshot, StatsSource,
    TransportStats,
};
pub use retry::RetryPolicy;
pub use session::{CallDescriptor, CallPhase, CallRole, CallSession, CallSessionState};
pub use signaling::{
    MemorySignaling, PresenceStatus, SignalingChannel, SignalingMessage, SignalingPayload,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
