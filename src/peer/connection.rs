//! Peer connection ownership and negotiation

use crate::config::CallConfig;
use crate::media::{MediaStreamHandle, RemoteStreamHandle, RemoteTrack, TrackKind};
use crate::quality::{StatsSource, TransportStats};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Initial state, negotiation not yet started
    New,
    /// Transport negotiation in progress
    Connecting,
    /// Connection established
    Connected,
    /// Transient connectivity loss; may recover on its own
    Disconnected,
    /// Connection failed and will not recover without renegotiation
    Failed,
    /// Connection closed
    Closed,
}

/// Event raised by a [`ConnectionManager`] toward the orchestrator
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// Connection instance that produced the event
    pub connection_id: String,
    pub kind: ConnectionEventKind,
}

/// Event payloads
#[derive(Debug, Clone)]
pub enum ConnectionEventKind {
    /// A local ICE candidate was gathered and must be forwarded over
    /// signaling
    LocalCandidate(RTCIceCandidateInit),
    /// The remote stream gained a track
    RemoteStream(RemoteStreamHandle),
    /// The underlying peer connection changed state
    StateChanged { old: PeerState, new: PeerState },
}

/// Owner of a single peer connection
///
/// One instance owns exactly one `RTCPeerConnection`; renegotiation replaces
/// the whole instance rather than reusing it, so a CallSession never holds
/// two live connections at once.
pub struct ConnectionManager {
    connection_id: String,
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    state: Arc<RwLock<PeerState>>,
    remote_stream: Arc<RwLock<RemoteStreamHandle>>,

    /// Candidates that arrived before the remote description; flushed in
    /// arrival order once it commits.
    pending_candidates: Arc<Mutex<Vec<RTCIceCandidateInit>>>,
    remote_committed: Arc<AtomicBool>,

    made_offer: AtomicBool,
    closed: AtomicBool,

    /// RTP senders retained so local tracks stay attached
    _senders: Vec<Arc<RTCRtpSender>>,
}

impl ConnectionManager {
    /// Create a peer connection with the local tracks attached
    ///
    /// # Arguments
    ///
    /// * `config` - STUN/TURN servers and timers
    /// * `session_id` - owning call session, for logs
    /// * `local_stream` - capture tracks to publish; the stream stays owned
    ///   by the StreamManager and survives this connection
    /// * `events` - channel the connection reports on
    pub async fn new(
        config: &CallConfig,
        session_id: &str,
        local_stream: &MediaStreamHandle,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        info!(session_id, connection_id = %connection_id, "creating peer connection");

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine)
                .map_err(|e| Error::WebRtc(format!("failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers_from(config),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::WebRtc(format!("failed to create peer connection: {}", e)))?,
        );

        let state = Arc::new(RwLock::new(PeerState::New));
        let remote_stream = Arc::new(RwLock::new(RemoteStreamHandle::new(connection_id.clone())));

        // Publish local tracks before any offer/answer so they land in the
        // first negotiated description.
        let mut senders = Vec::with_capacity(local_stream.tracks().len());
        for track in local_stream.tracks() {
            let sender = pc
                .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| {
                    Error::MediaTrack(format!("failed to attach {} track: {}", track.kind(), e))
                })?;
            senders.push(sender);
        }

        // Connection state transitions.
        {
            let state = Arc::clone(&state);
            let events = events.clone();
            let connection_id = connection_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = Arc::clone(&state);
                let events = events.clone();
                let connection_id = connection_id.clone();

                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => PeerState::New,
                        RTCPeerConnectionState::Connecting => PeerState::Connecting,
                        RTCPeerConnectionState::Connected => PeerState::Connected,
                        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                        RTCPeerConnectionState::Failed => PeerState::Failed,
                        RTCPeerConnectionState::Closed => PeerState::Closed,
                        _ => return,
                    };

                    let mut guard = state.write().await;
                    let old_state = *guard;
                    if old_state == new_state {
                        return;
                    }
                    *guard = new_state;
                    drop(guard);

                    debug!(
                        connection_id = %connection_id,
                        ?old_state,
                        ?new_state,
                        "peer connection state changed"
                    );
                    let _ = events.send(ConnectionEvent {
                        connection_id,
                        kind: ConnectionEventKind::StateChanged {
                            old: old_state,
                            new: new_state,
                        },
                    });
                })
            }));
        }

        // Trickle ICE: forward every gathered candidate immediately.
        {
            let events = events.clone();
            let connection_id = connection_id.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let connection_id = connection_id.clone();

                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(ConnectionEvent {
                                connection_id,
                                kind: ConnectionEventKind::LocalCandidate(init),
                            });
                        }
                        Err(e) => warn!(
                            connection_id = %connection_id,
                            error = %e,
                            "could not serialize local candidate"
                        ),
                    }
                })
            }));
        }

        // Remote track arrival; the handle grows in place and a fresh
        // snapshot is emitted each time.
        {
            let remote_stream = Arc::clone(&remote_stream);
            let connection_id = connection_id.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let remote_stream = Arc::clone(&remote_stream);
                let events = events.clone();
                let connection_id = connection_id.clone();

                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => {
                            debug!(connection_id = %connection_id, "ignoring track of unknown kind");
                            return;
                        }
                    };
                    info!(connection_id = %connection_id, %kind, "remote track arrived");

                    let snapshot = {
                        let mut guard = remote_stream.write().await;
                        guard.push(RemoteTrack::new(track.id(), kind, track));
                        guard.clone()
                    };
                    let _ = events.send(ConnectionEvent {
                        connection_id,
                        kind: ConnectionEventKind::RemoteStream(snapshot),
                    });
                })
            }));
        }

        Ok(Self {
            connection_id,
            session_id: session_id.to_string(),
            pc,
            state,
            remote_stream,
            pending_candidates: Arc::new(Mutex::new(Vec::new())),
            remote_committed: Arc::new(AtomicBool::new(false)),
            made_offer: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            _senders: senders,
        })
    }

    /// Unique id of this connection instance
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Current connection state
    pub async fn state(&self) -> PeerState {
        *self.state.read().await
    }

    /// The remote stream received on this connection so far
    pub async fn remote_stream(&self) -> RemoteStreamHandle {
        self.remote_stream.read().await.clone()
    }

    /// Generate and locally commit an offer (initiator only)
    pub async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("failed to commit offer: {}", e)))?;

        let local = self.pc.local_description().await.ok_or_else(|| {
            Error::NegotiationFailed("no local description after committing offer".to_string())
        })?;

        self.made_offer.store(true, Ordering::SeqCst);
        debug!(
            session_id = %self.session_id,
            connection_id = %self.connection_id,
            "offer created"
        );
        Ok(local.sdp)
    }

    /// Commit a remote offer and produce the local answer (responder only)
    pub async fn create_answer(&self, offer_sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| Error::NegotiationFailed(format!("malformed offer: {}", e)))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("failed to commit offer: {}", e)))?;

        self.remote_committed.store(true, Ordering::SeqCst);
        self.flush_pending_candidates().await;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("failed to commit answer: {}", e)))?;

        let local = self.pc.local_description().await.ok_or_else(|| {
            Error::NegotiationFailed("no local description after committing answer".to_string())
        })?;

        debug!(
            session_id = %self.session_id,
            connection_id = %self.connection_id,
            "answer created"
        );
        Ok(local.sdp)
    }

    /// Complete the initiator's negotiation with the remote answer
    ///
    /// A duplicate answer after the remote description is already committed
    /// is ignored; an answer with no pending local offer is a protocol
    /// violation.
    pub async fn apply_answer(&self, answer_sdp: String) -> Result<()> {
        if !self.made_offer.load(Ordering::SeqCst) {
            return Err(Error::NegotiationFailed(
                "answer received but no local offer is pending".to_string(),
            ));
        }

        if self.pc.remote_description().await.is_some() {
            debug!(
                connection_id = %self.connection_id,
                "duplicate answer ignored"
            );
            return Ok(());
        }

        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| Error::NegotiationFailed(format!("malformed answer: {}", e)))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("failed to commit answer: {}", e)))?;

        self.remote_committed.store(true, Ordering::SeqCst);
        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Add a remote ICE candidate
    ///
    /// Candidates delivered before the paired offer/answer are queued and
    /// applied in arrival order once the remote description commits.
    pub async fn apply_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            debug!(connection_id = %self.connection_id, "candidate after close ignored");
            return Ok(());
        }

        if !self.remote_committed.load(Ordering::SeqCst) {
            let mut pending = self.pending_candidates.lock();
            pending.push(candidate);
            debug!(
                connection_id = %self.connection_id,
                queued = pending.len(),
                "candidate queued until the remote description is set"
            );
            return Ok(());
        }

        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::IceCandidate(format!("failed to add candidate: {}", e)))
    }

    /// Candidates currently waiting for the remote description
    pub fn queued_candidate_count(&self) -> usize {
        self.pending_candidates.lock().len()
    }

    async fn flush_pending_candidates(&self) {
        let drained: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut *self.pending_candidates.lock());
        if drained.is_empty() {
            return;
        }

        debug!(
            connection_id = %self.connection_id,
            count = drained.len(),
            "applying queued candidates"
        );
        for candidate in drained {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!(
                    connection_id = %self.connection_id,
                    error = %e,
                    "queued candidate rejected"
                );
            }
        }
    }

    /// Release the underlying connection; safe to call repeatedly
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(
            session_id = %self.session_id,
            connection_id = %self.connection_id,
            "closing peer connection"
        );
        *self.state.write().await = PeerState::Closed;

        self.pc
            .close()
            .await
            .map_err(|e| Error::WebRtc(format!("failed to close connection: {}", e)))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        debug!(connection_id = %self.connection_id, "connection manager dropped");
    }
}

/// Map config entries onto ICE servers
fn ice_servers_from(config: &CallConfig) -> Vec<RTCIceServer> {
    config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .chain(config.turn_servers.iter().map(|turn| {
            #[allow(clippy::needless_update)]
            RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }
        }))
        .collect()
}

#[async_trait::async_trait]
impl StatsSource for ConnectionManager {
    /// Reduce the stats report to the counters the quality monitor needs
    ///
    /// Loss comes from the remote receiver reports; until those exist the
    /// transport has no usable signal and `None` is returned.
    async fn transport_stats(&self) -> Option<TransportStats> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let report = self.pc.get_stats().await;

        let mut stats = TransportStats::default();
        let mut saw_remote = false;
        let mut rtt_sum = 0.0f64;
        let mut rtt_count = 0u32;

        for stat in report.reports.values() {
            match stat {
                StatsReportType::OutboundRTP(outbound) => {
                    stats.packets_sent += outbound.packets_sent;
                    stats.bytes_sent += outbound.bytes_sent;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    saw_remote = true;
                    stats.packets_lost += remote.packets_lost;
                    if let Some(rtt) = remote.round_trip_time {
                        rtt_sum += rtt;
                        rtt_count += 1;
                    }
                }
                _ => {}
            }
        }

        if !saw_remote {
            return None;
        }

        if rtt_count > 0 {
            // round_trip_time is reported in seconds.
            stats.round_trip_time_ms = Some(rtt_sum / rtt_count as f64 * 1000.0);
        }
        Some(stats)
    }
}
