//! Call session orchestration
//!
//! [`CallSession`] drives the end-to-end lifecycle of one two-party
//! consultation: media acquisition, the signaling handshake, the connected
//! call with quality monitoring, bounded reconnection, and teardown. The UI
//! layer talks only to this type: imperative methods in, a reactive
//! [`CallSessionState`] snapshot out.

mod driver;

use crate::config::CallConfig;
use crate::media::{MediaDeviceSource, MediaStreamHandle, RemoteStreamHandle, StreamManager};
use crate::quality::QualitySnapshot;
use crate::signaling::{PresenceStatus, SignalingChannel, SignalingMessage};
use crate::{Error, Result};
use driver::{Command, Driver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Which side of the handshake this participant drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    /// Sends the offer once the peer announces readiness
    Initiator,
    /// Answers the initiator's offer
    Responder,
}

/// Lifecycle phase of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    AcquiringMedia,
    Signaling,
    Connecting,
    Connected,
    /// Connected, but link quality is persistently poor
    Degraded,
    /// Terminal: a fatal error ended the call
    Failed,
    /// Terminal: the call ended normally
    Ended,
}

impl CallPhase {
    /// Whether the phase is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPhase::Failed | CallPhase::Ended)
    }
}

/// Identity of one call session
#[derive(Debug, Clone)]
pub struct CallDescriptor {
    /// Session id shared by both participants (keys the signaling channel)
    pub session_id: String,
    /// This participant
    pub local_participant_id: String,
    /// The other participant
    pub remote_participant_id: String,
    /// Handshake role
    pub role: CallRole,
}

/// Reactive snapshot exposed to the UI layer
#[derive(Debug, Clone, Default)]
pub struct CallSessionState {
    pub phase: CallPhase,
    pub local_stream: Option<MediaStreamHandle>,
    pub remote_stream: Option<RemoteStreamHandle>,
    pub quality: Option<QualitySnapshot>,
    /// Human-readable description of the fatal error, when `phase` is
    /// [`CallPhase::Failed`]
    pub error: Option<String>,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
}

/// Shared mutable session state behind the watch channel
pub(crate) struct Shared {
    session_id: String,
    tx: watch::Sender<CallSessionState>,
}

impl Shared {
    fn new(session_id: String) -> (Arc<Self>, watch::Receiver<CallSessionState>) {
        let (tx, rx) = watch::channel(CallSessionState::default());
        (Arc::new(Self { session_id, tx }), rx)
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut CallSessionState)) {
        self.tx.send_modify(f);
    }

    pub(crate) fn snapshot(&self) -> CallSessionState {
        self.tx.borrow().clone()
    }

    pub(crate) fn phase(&self) -> CallPhase {
        self.tx.borrow().phase
    }

    pub(crate) fn set_phase(&self, new_phase: CallPhase) {
        self.tx.send_modify(|state| {
            if state.phase != new_phase {
                debug!(
                    session_id = %self.session_id,
                    old_phase = ?state.phase,
                    ?new_phase,
                    "session phase transition"
                );
                state.phase = new_phase;
            }
        });
    }
}

/// One two-party audio/video consultation
///
/// Construct one per consultation and call [`end`](CallSession::end) when
/// the owning scope tears down; construction/destruction is explicit so
/// camera and microphone release stays deterministic and testable.
pub struct CallSession {
    descriptor: CallDescriptor,
    config: CallConfig,
    signaling: Arc<dyn SignalingChannel>,
    streams: Arc<StreamManager>,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<CallSessionState>,
    commands: mpsc::UnboundedSender<Command>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    started: AtomicBool,
    ended: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl CallSession {
    /// Create a session over the given signaling channel and capture source
    pub fn new(
        descriptor: CallDescriptor,
        config: CallConfig,
        signaling: Arc<dyn SignalingChannel>,
        media_source: Arc<dyn MediaDeviceSource>,
    ) -> Result<Self> {
        config.validate()?;

        let (shared, state_rx) = Shared::new(descriptor.session_id.clone());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            descriptor,
            config,
            signaling,
            streams: Arc::new(StreamManager::new(media_source)),
            shared,
            state_rx,
            commands,
            commands_rx: Mutex::new(Some(commands_rx)),
            shutdown_tx,
            shutdown_rx,
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            driver: Mutex::new(None),
        })
    }

    /// Session id
    pub fn id(&self) -> &str {
        &self.descriptor.session_id
    }

    /// Handshake role
    pub fn role(&self) -> CallRole {
        self.descriptor.role
    }

    /// This participant's id
    pub fn local_participant_id(&self) -> &str {
        &self.descriptor.local_participant_id
    }

    /// The other participant's id
    pub fn remote_participant_id(&self) -> &str {
        &self.descriptor.remote_participant_id
    }

    /// Current state snapshot
    pub fn state(&self) -> CallSessionState {
        self.shared.snapshot()
    }

    /// Watch the state as it changes
    pub fn subscribe_state(&self) -> watch::Receiver<CallSessionState> {
        self.state_rx.clone()
    }

    /// Begin the call: acquire media, announce readiness, and hand control
    /// to the session driver
    ///
    /// Media failures are surfaced as-is and are not retried; permission
    /// prompts are user-interactive, so only the user can unblock them.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal("call session already started".to_string()));
        }
        if self.ended.load(Ordering::SeqCst) {
            return Err(Error::Internal("call session already ended".to_string()));
        }

        info!(
            session_id = %self.descriptor.session_id,
            role = ?self.descriptor.role,
            "starting call"
        );
        self.shared.update(|state| {
            if !state.phase.is_terminal() {
                state.phase = CallPhase::AcquiringMedia;
                state.started_at = Some(SystemTime::now());
            }
        });

        let local_stream = match self.streams.acquire().await {
            Ok(handle) => handle,
            Err(err) => {
                error!(
                    session_id = %self.descriptor.session_id,
                    error = %err,
                    "media acquisition failed"
                );
                self.shared.update(|state| {
                    if !state.phase.is_terminal() {
                        state.phase = CallPhase::Failed;
                    }
                    state.error = Some(err.to_string());
                });
                return Err(err);
            }
        };

        // end() may have raced media acquisition; release the fresh stream
        // instead of attaching it.
        if self.ended.load(Ordering::SeqCst) {
            debug!(
                session_id = %self.descriptor.session_id,
                "call ended during media acquisition"
            );
            self.streams.release().await;
            self.shared.update(|state| {
                if !state.phase.is_terminal() {
                    state.phase = CallPhase::Ended;
                }
            });
            return Ok(());
        }

        self.shared
            .update(|state| state.local_stream = Some(local_stream.clone()));

        let sig_rx = match self.signaling.subscribe(&self.descriptor.session_id).await {
            Ok(rx) => rx,
            Err(err) => {
                self.fail_start(&err).await;
                return Err(err);
            }
        };

        // Announce readiness; transient send failures are retried.
        let ready = SignalingMessage::presence(
            self.descriptor.local_participant_id.clone(),
            self.descriptor.session_id.clone(),
            PresenceStatus::Ready,
        );
        let send_result = self
            .config
            .signaling_send
            .execute(|| {
                let signaling = Arc::clone(&self.signaling);
                let session_id = self.descriptor.session_id.clone();
                let message = ready.clone();
                async move { signaling.send(&session_id, message).await }
            })
            .await;
        if let Err(err) = send_result {
            self.fail_start(&err).await;
            return Err(err);
        }

        self.shared.set_phase(CallPhase::Signaling);

        let Some(cmd_rx) = self.commands_rx.lock().take() else {
            return Err(Error::Internal("session driver already launched".to_string()));
        };
        let driver = Driver::new(
            self.descriptor.clone(),
            self.config.clone(),
            Arc::clone(&self.signaling),
            Arc::clone(&self.streams),
            local_stream,
            Arc::clone(&self.shared),
            self.shutdown_rx.clone(),
            sig_rx,
            cmd_rx,
        );
        *self.driver.lock() = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    async fn fail_start(&self, err: &Error) {
        error!(
            session_id = %self.descriptor.session_id,
            error = %err,
            "call setup failed"
        );
        self.streams.release().await;
        self.shared.update(|state| {
            if !state.phase.is_terminal() {
                state.phase = CallPhase::Failed;
            }
            state.error = Some(err.to_string());
            state.local_stream = None;
        });
    }

    /// Mute or unmute outgoing video without renegotiating
    pub async fn set_video_enabled(&self, enabled: bool) {
        self.streams.set_video_enabled(enabled).await;
    }

    /// Mute or unmute outgoing audio without renegotiating
    pub async fn set_audio_enabled(&self, enabled: bool) {
        self.streams.set_audio_enabled(enabled).await;
    }

    /// Request a manual reconnection
    ///
    /// A no-op unless the session is in a connected or connecting phase.
    pub fn reconnect(&self) {
        debug!(session_id = %self.descriptor.session_id, "reconnect requested");
        let _ = self.commands.send(Command::Reconnect);
    }

    /// End the call and release every resource
    ///
    /// Callable from any state, any number of times, and after failure;
    /// local tracks are stopped exactly once regardless. The `ended`
    /// presence broadcast is best-effort (the call is already terminating),
    /// so it is not retried.
    pub async fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.descriptor.session_id, "end already in progress");
            return;
        }

        info!(session_id = %self.descriptor.session_id, "ending call");
        let _ = self.shutdown_tx.send(true);

        self.streams.release().await;

        let bye = SignalingMessage::presence(
            self.descriptor.local_participant_id.clone(),
            self.descriptor.session_id.clone(),
            PresenceStatus::Ended,
        );
        if let Err(err) = self
            .signaling
            .send(&self.descriptor.session_id, bye)
            .await
        {
            debug!(
                session_id = %self.descriptor.session_id,
                error = %err,
                "best-effort ended broadcast failed"
            );
        }

        let handle = self.driver.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                warn!(
                    session_id = %self.descriptor.session_id,
                    "session driver did not stop in time, aborting"
                );
                handle.abort();
            }
        }

        self.shared.update(|state| {
            if !matches!(state.phase, CallPhase::Failed) {
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

impl Drop for CallSession {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) && !self.ended.load(Ordering::SeqCst) {
            warn!(
                session_id = %self.descriptor.session_id,
                "call session dropped without end(); call end() for deterministic cleanup"
            );
            let _ = self.shutdown_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticMediaSource;
    use crate::signaling::MemorySignaling;

    fn descriptor(role: CallRole) -> CallDescriptor {
        CallDescriptor {
            session_id: "session-1".to_string(),
            local_participant_id: "patient-1".to_string(),
            remote_participant_id: "physician-1".to_string(),
            role,
        }
    }

    fn session_with(source: Arc<dyn MediaDeviceSource>) -> CallSession {
        CallSession::new(
            descriptor(CallRole::Initiator),
            CallConfig::default(),
            Arc::new(MemorySignaling::new()),
            source,
        )
        .unwrap()
    }

    #[test]
    fn test_new_session_is_idle() {
        let session = session_with(Arc::new(SyntheticMediaSource::new()));
        let state = session.state();
        assert_eq!(state.phase, CallPhase::Idle);
        assert!(state.local_stream.is_none());
        assert!(state.error.is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = CallConfig::default();
        config.stun_servers.clear();
        let result = CallSession::new(
            descriptor(CallRole::Initiator),
            config,
            Arc::new(MemorySignaling::new()),
            Arc::new(SyntheticMediaSource::new()),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_media_denial_fails_the_call() {
        let session = session_with(Arc::new(SyntheticMediaSource::denying_access()));
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::MediaAccessDenied(_)));

        let state = session.state();
        assert_eq!(state.phase, CallPhase::Failed);
        assert!(state.error.is_some());

        // end() after failure neither panics nor double-releases.
        session.end().await;
        session.end().await;
        assert_eq!(session.state().phase, CallPhase::Failed);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let session = session_with(Arc::new(SyntheticMediaSource::new()));
        session.start().await.unwrap();
        assert!(session.start().await.is_err());
        session.end().await;
    }

    #[tokio::test]
    async fn test_end_before_start_is_safe() {
        let session = session_with(Arc::new(SyntheticMediaSource::new()));
        session.end().await;
        assert_eq!(session.state().phase, CallPhase::Ended);
        assert!(session.start().await.is_err());
    }

    #[tokio::test]
    async fn test_repeated_end_releases_once() {
        let session = session_with(Arc::new(SyntheticMediaSource::new()));
        session.start().await.unwrap();
        let local = session.state().local_stream.unwrap();

        session.end().await;
        session.end().await;
        session.end().await;

        assert_eq!(session.state().phase, CallPhase::Ended);
        // The first end() stopped every track; nothing else did since.
        for track in local.tracks() {
            assert!(!track.stop());
        }
    }

    #[tokio::test]
    async fn test_toggles_reach_local_tracks() {
        let session = session_with(Arc::new(SyntheticMediaSource::new()));
        session.start().await.unwrap();
        let local = session.state().local_stream.unwrap();

        session.set_video_enabled(false).await;
        session.set_audio_enabled(false).await;
        assert!(!local.video().unwrap().is_enabled());
        assert!(!local.audio().unwrap().is_enabled());

        session.set_audio_enabled(true).await;
        assert!(local.audio().unwrap().is_enabled());

        session.end().await;
    }
}
