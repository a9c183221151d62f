//! Session event loop
//!
//! The driver is the single ordered consumer of signaling messages,
//! connection events, and quality samples for one call. Handlers mutate
//! driver-private state and publish snapshots through the shared watch
//! channel; nothing else touches the peer connection.

use super::{CallDescriptor, CallPhase, CallRole, Shared};
use crate::config::CallConfig;
use crate::media::{MediaStreamHandle, StreamManager};
use crate::peer::{ConnectionEvent, ConnectionEventKind, ConnectionManager, PeerState};
use crate::quality::{DegradeTracker, QualityMonitor, QualityShift, QualitySnapshot, StatsSource};
use crate::signaling::{
    PresenceStatus, SignalingChannel, SignalingMessage, SignalingPayload,
};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Imperative requests forwarded from the session facade
#[derive(Debug, Clone, Copy)]
pub(crate) enum Command {
    Reconnect,
}

pub(crate) struct Driver {
    descriptor: CallDescriptor,
    config: CallConfig,
    signaling: Arc<dyn SignalingChannel>,
    streams: Arc<StreamManager>,
    /// Owned by the StreamManager for the whole call; lent to every
    /// connection instance, including reconnections.
    local_stream: MediaStreamHandle,
    shared: Arc<Shared>,

    shutdown: watch::Receiver<bool>,
    sig_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,

    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    quality_tx: mpsc::UnboundedSender<QualitySnapshot>,
    quality_rx: mpsc::UnboundedReceiver<QualitySnapshot>,

    conn: Option<Arc<ConnectionManager>>,
    monitor: Option<QualityMonitor>,
    degrade: DegradeTracker,

    /// Candidates that arrived before any connection existed
    pending_candidates: Vec<RTCIceCandidateInit>,
    /// Last offer SDP seen, for duplicate-delivery idempotence
    last_remote_offer: Option<String>,
    offer_sent: bool,
    remote_ended: bool,
    disconnected_since: Option<Instant>,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        descriptor: CallDescriptor,
        config: CallConfig,
        signaling: Arc<dyn SignalingChannel>,
        streams: Arc<StreamManager>,
        local_stream: MediaStreamHandle,
        shared: Arc<Shared>,
        shutdown: watch::Receiver<bool>,
        sig_rx: mpsc::UnboundedReceiver<SignalingMessage>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (quality_tx, quality_rx) = mpsc::unbounded_channel();
        let degrade = DegradeTracker::new(config.degrade_after_ticks);

        Self {
            descriptor,
            config,
            signaling,
            streams,
            local_stream,
            shared,
            shutdown,
            sig_rx,
            cmd_rx,
            conn_tx,
            conn_rx,
            quality_tx,
            quality_rx,
            conn: None,
            monitor: None,
            degrade,
            pending_candidates: Vec::new(),
            last_remote_offer: None,
            offer_sent: false,
            remote_ended: false,
            disconnected_since: None,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(session_id = %self.descriptor.session_id, "session driver started");
        let grace = Duration::from_millis(self.config.disconnect_grace_ms);

        loop {
            if self.is_shutdown() || self.shared.phase().is_terminal() {
                break;
            }
            if self.remote_ended {
                self.finish_remote_ended().await;
                break;
            }

            let (grace_armed, grace_deadline) = match self.disconnected_since {
                Some(since) => (true, since + grace),
                None => (false, Instant::now()),
            };

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                Some(command) = self.cmd_rx.recv() => match command {
                    Command::Reconnect => {
                        let phase = self.shared.phase();
                        if matches!(
                            phase,
                            CallPhase::Connecting | CallPhase::Connected | CallPhase::Degraded
                        ) {
                            self.run_reconnect("reconnect requested").await;
                        } else {
                            debug!(?phase, "reconnect request ignored in current phase");
                        }
                    }
                },
                Some(message) = self.sig_rx.recv() => {
                    if let Err(err) = self.handle_signaling(message).await {
                        self.fail(err).await;
                    }
                }
                Some(event) = self.conn_rx.recv() => {
                    if self.apply_connection_event(event).await == Some(PeerState::Failed) {
                        self.run_reconnect("peer connection failed").await;
                    }
                }
                Some(snapshot) = self.quality_rx.recv() => self.handle_quality(snapshot),
                _ = tokio::time::sleep_until(grace_deadline), if grace_armed => {
                    self.disconnected_since = None;
                    self.run_reconnect("peer connection stayed disconnected").await;
                }
            }
        }

        self.stop_monitor();
        self.close_conn().await;
        debug!(session_id = %self.descriptor.session_id, "session driver stopped");
    }

    fn role(&self) -> CallRole {
        self.descriptor.role
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Send one signaling message, retrying transient failures
    async fn send_signal(&self, payload: SignalingPayload) -> Result<()> {
        let message = SignalingMessage::new(
            self.descriptor.local_participant_id.clone(),
            self.descriptor.session_id.clone(),
            payload,
        );
        self.config
            .signaling_send
            .execute(|| {
                let signaling = Arc::clone(&self.signaling);
                let session_id = self.descriptor.session_id.clone();
                let message = message.clone();
                async move { signaling.send(&session_id, message).await }
            })
            .await
    }

    async fn new_connection(&self) -> Result<Arc<ConnectionManager>> {
        let conn = ConnectionManager::new(
            &self.config,
            &self.descriptor.session_id,
            &self.local_stream,
            self.conn_tx.clone(),
        )
        .await?;
        Ok(Arc::new(conn))
    }

    /// Build a connection and send the offer (initiator side)
    async fn begin_offer(&mut self) -> Result<()> {
        let conn = self.new_connection().await?;
        let offer = conn.create_offer().await?;
        self.conn = Some(conn);
        self.disconnected_since = None;
        self.flush_driver_candidates().await;

        self.send_signal(SignalingPayload::Offer { sdp: offer }).await?;
        self.offer_sent = true;
        self.shared.set_phase(CallPhase::Connecting);
        Ok(())
    }

    /// Process one inbound signaling message
    ///
    /// Errors returned here are fatal for the current attempt; candidate
    /// problems are swallowed locally.
    async fn handle_signaling(&mut self, message: SignalingMessage) -> Result<()> {
        if message.sender_id == self.descriptor.local_participant_id {
            // Pub/sub transports echo our own broadcasts.
            return Ok(());
        }
        if message.session_id != self.descriptor.session_id {
            debug!(
                session_id = %message.session_id,
                "message for another session discarded"
            );
            return Ok(());
        }

        match message.payload {
            SignalingPayload::Presence {
                status: PresenceStatus::Ready,
            } => {
                if self.role() == CallRole::Initiator && !self.offer_sent {
                    info!(
                        session_id = %self.descriptor.session_id,
                        "peer ready, sending offer"
                    );
                    self.begin_offer().await?;
                } else if self.role() == CallRole::Responder && self.conn.is_none() {
                    // The initiator joined after our announcement and missed
                    // it; repeat it so the offer can flow.
                    debug!("initiator ready, repeating readiness announcement");
                    if let Err(err) = self
                        .send_signal(SignalingPayload::Presence {
                            status: PresenceStatus::Ready,
                        })
                        .await
                    {
                        warn!(error = %err, "failed to repeat readiness announcement");
                    }
                } else {
                    debug!("peer ready ignored (already negotiating)");
                }
                Ok(())
            }
            SignalingPayload::Presence {
                status: PresenceStatus::Ended,
            } => {
                info!(
                    session_id = %self.descriptor.session_id,
                    "remote participant ended the call"
                );
                self.remote_ended = true;
                Ok(())
            }
            SignalingPayload::Offer { sdp } => self.handle_offer(sdp).await,
            SignalingPayload::Answer { sdp } => match &self.conn {
                Some(conn) => conn.apply_answer(sdp).await,
                None => {
                    warn!("answer received with no connection, discarded");
                    Ok(())
                }
            },
            SignalingPayload::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    username_fragment: None,
                };
                match &self.conn {
                    Some(conn) => {
                        if let Err(err) = conn.apply_remote_candidate(init).await {
                            // A single bad candidate never ends the call.
                            warn!(error = %err, "remote candidate rejected");
                        }
                    }
                    None => {
                        debug!("candidate queued until a connection exists");
                        self.pending_candidates.push(init);
                    }
                }
                Ok(())
            }
        }
    }

    /// Commit a remote offer, replacing any existing connection
    async fn handle_offer(&mut self, sdp: String) -> Result<()> {
        if self.last_remote_offer.as_deref() == Some(sdp.as_str()) {
            debug!("duplicate offer ignored");
            return Ok(());
        }
        if self.role() == CallRole::Initiator {
            warn!("offer received while initiating, discarded");
            return Ok(());
        }

        if self.conn.is_some() {
            info!(
                session_id = %self.descriptor.session_id,
                "renegotiation offer, replacing peer connection"
            );
            self.stop_monitor();
            self.close_conn().await;
            self.shared.update(|state| state.remote_stream = None);
        }

        self.last_remote_offer = Some(sdp.clone());
        let conn = self.new_connection().await?;
        let answer = conn.create_answer(sdp).await?;
        self.conn = Some(conn);
        self.disconnected_since = None;
        self.degrade.reset();
        self.flush_driver_candidates().await;

        self.send_signal(SignalingPayload::Answer { sdp: answer }).await?;
        self.shared.set_phase(CallPhase::Connecting);
        Ok(())
    }

    /// Feed candidates that arrived before the connection existed
    async fn flush_driver_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let Some(conn) = self.conn.clone() else { return };

        let drained = std::mem::take(&mut self.pending_candidates);
        debug!(count = drained.len(), "feeding early candidates to the connection");
        for candidate in drained {
            if let Err(err) = conn.apply_remote_candidate(candidate).await {
                warn!(error = %err, "early candidate rejected");
            }
        }
    }

    /// Process one connection event; returns the new state on transitions
    async fn apply_connection_event(&mut self, event: ConnectionEvent) -> Option<PeerState> {
        let current_id = self.conn.as_ref().map(|c| c.connection_id().to_string())?;
        if event.connection_id != current_id {
            debug!(
                connection_id = %event.connection_id,
                "event from a replaced connection discarded"
            );
            return None;
        }

        match event.kind {
            ConnectionEventKind::LocalCandidate(init) => {
                let payload = SignalingPayload::IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                };
                if let Err(err) = self.send_signal(payload).await {
                    // Candidates are redundant; the next one may get through.
                    warn!(error = %err, "failed to forward local candidate");
                }
                None
            }
            ConnectionEventKind::RemoteStream(stream) => {
                self.shared
                    .update(|state| state.remote_stream = Some(stream));
                None
            }
            ConnectionEventKind::StateChanged { old, new } => {
                debug!(?old, ?new, "connection state observed");
                match new {
                    PeerState::Connected => {
                        self.disconnected_since = None;
                        self.degrade.reset();
                        self.shared.set_phase(CallPhase::Connected);
                        self.start_monitor();
                    }
                    PeerState::Disconnected => {
                        let phase = self.shared.phase();
                        if matches!(phase, CallPhase::Connected | CallPhase::Degraded)
                            && self.disconnected_since.is_none()
                        {
                            warn!(
                                session_id = %self.descriptor.session_id,
                                grace_ms = self.config.disconnect_grace_ms,
                                "peer connection disconnected, starting grace timer"
                            );
                            self.disconnected_since = Some(Instant::now());
                        }
                    }
                    _ => {}
                }
                Some(new)
            }
        }
    }

    /// Fold one quality sample into the session state
    fn handle_quality(&mut self, snapshot: QualitySnapshot) {
        let level = snapshot.level;
        self.shared
            .update(|state| state.quality = Some(snapshot));

        let phase = self.shared.phase();
        if !matches!(phase, CallPhase::Connected | CallPhase::Degraded) {
            return;
        }

        match self.degrade.observe(level) {
            Some(QualityShift::Degraded) => {
                warn!(
                    session_id = %self.descriptor.session_id,
                    "link quality persistently poor, marking call degraded"
                );
                self.shared.set_phase(CallPhase::Degraded);
            }
            Some(QualityShift::Recovered) => {
                info!(
                    session_id = %self.descriptor.session_id,
                    "link quality recovered"
                );
                self.shared.set_phase(CallPhase::Connected);
            }
            None => {}
        }
    }

    fn start_monitor(&mut self) {
        if self.monitor.is_some() {
            return;
        }
        let Some(conn) = &self.conn else { return };

        let monitor = QualityMonitor::new(
            Arc::clone(conn) as Arc<dyn StatsSource>,
            self.config.quality.clone(),
            self.quality_tx.clone(),
        );
        monitor.start(Duration::from_millis(self.config.quality_interval_ms));
        self.monitor = Some(monitor);
    }

    fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
    }

    async fn close_conn(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = conn.close().await {
                warn!(error = %err, "error closing peer connection");
            }
        }
    }

    /// Close the current connection and re-run the handshake, pacing
    /// attempts with the configured retry schedule; media is never
    /// re-acquired
    async fn run_reconnect(&mut self, reason: &str) {
        if self.shared.phase().is_terminal() {
            return;
        }
        warn!(
            session_id = %self.descriptor.session_id,
            reason,
            "connection lost, reconnecting"
        );

        // Quality sampling is suspended for the whole replacement; a tick
        // must never observe a connection mid-swap.
        self.stop_monitor();
        while self.quality_rx.try_recv().is_ok() {}
        self.close_conn().await;
        self.disconnected_since = None;
        self.last_remote_offer = None;
        self.offer_sent = false;
        self.shared.update(|state| state.remote_stream = None);
        self.shared.set_phase(CallPhase::Connecting);

        let policy = self.config.reconnect.clone();
        let mut attempt = 0u32;
        loop {
            if self.is_shutdown() || self.remote_ended {
                return;
            }

            match self.reconnect_once().await {
                Ok(()) => {
                    info!(
                        session_id = %self.descriptor.session_id,
                        attempt = attempt + 1,
                        "reconnected"
                    );
                    return;
                }
                Err(err) => {
                    self.stop_monitor();
                    self.close_conn().await;
                    if self.is_shutdown() || self.remote_ended {
                        return;
                    }

                    if policy.should_retry(attempt) {
                        let delay = policy.delay_for(attempt);
                        warn!(
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "reconnect attempt failed, backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.shutdown.changed() => return,
                        }
                        attempt += 1;
                    } else {
                        let mut reason = err.to_string();
                        if self.config.turn_servers.is_empty() {
                            reason.push_str(
                                "; no TURN relay is configured, the network may be restrictive",
                            );
                        }
                        self.fail(Error::ReconnectExhausted {
                            attempts: attempt + 1,
                            reason,
                        })
                        .await;
                        return;
                    }
                }
            }
        }
    }

    /// One reconnection attempt: rebuild the connection and drive the
    /// handshake until it connects, fails, or times out
    async fn reconnect_once(&mut self) -> Result<()> {
        self.offer_sent = false;
        self.last_remote_offer = None;

        if self.role() == CallRole::Initiator {
            self.begin_offer().await?;
        }
        // The responder waits for the initiator's fresh offer, which
        // handle_signaling answers on a new connection.

        let deadline = Instant::now() + Duration::from_millis(self.config.handshake_timeout_ms);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    return Err(Error::Internal("session shutting down".to_string()));
                }
                Some(message) = self.sig_rx.recv() => {
                    self.handle_signaling(message).await?;
                    if self.remote_ended {
                        return Err(Error::Internal("remote ended the call".to_string()));
                    }
                }
                Some(event) = self.conn_rx.recv() => {
                    match self.apply_connection_event(event).await {
                        Some(PeerState::Connected) => return Ok(()),
                        Some(PeerState::Failed) => {
                            return Err(Error::ConnectionLost(
                                "peer connection failed during reconnect".to_string(),
                            ));
                        }
                        _ => {}
                    }
                }
                Some(_command) = self.cmd_rx.recv() => {
                    debug!("command ignored while reconnecting");
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::ConnectionLost(
                        "reconnect handshake timed out".to_string(),
                    ));
                }
            }
        }
    }

    /// Terminal failure: release everything and surface the error
    async fn fail(&mut self, err: Error) {
        error!(
            session_id = %self.descriptor.session_id,
            error = %err,
            "call failed"
        );
        self.stop_monitor();
        self.close_conn().await;
        // The resource-safety invariant: no live capture past a terminal
        // phase.
        self.streams.release().await;
        self.shared.update(|state| {
            if !state.phase.is_terminal() {
                state.phase = CallPhase::Failed;
            }
            state.error = Some(err.to_string());
            state.local_stream = None;
            state.remote_stream = None;
            if state.ended_at.is_none() {
                state.ended_at = Some(SystemTime::now());
            }
        });
    }

    /// The peer hung up: converge to Ended
    async fn finish_remote_ended(&mut self) {
        self.stop_monitor();
        self.close_conn().await;
        self.streams.release().await;
        self.shared.update(|state| {
            if !state.phase.is_terminal() {
                state.phase = CallPhase::Ended;
            }
            state.local_stream = None;
            state.remote_stream = None;
            if state.ended_at.is_none() {
                state.ended_at = Some(SystemTime::now());
            }
        });
    }
}
