//! Local capture and media stream handles
//!
//! [`StreamManager`] owns the local camera+microphone capture for the whole
//! lifetime of a call: it is the only component allowed to stop local
//! tracks, and its handle is lent (never copied) to successive peer
//! connections across reconnections. Remote tracks are owned by the peer
//! connection that produced them and are replaced wholesale on
//! renegotiation.

mod synthetic;

pub use synthetic::SyntheticMediaSource;

use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// A local capture track
///
/// Wraps the sample-based WebRTC track together with the mute flag and the
/// stop latch. Muting suppresses sample emission instead of detaching the
/// track, so mute/unmute never triggers renegotiation.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    /// Create a track of the given kind
    ///
    /// Audio tracks carry Opus at 48kHz; video tracks VP8 on the standard
    /// 90kHz clock.
    pub fn new(kind: TrackKind, track_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let track_id = track_id.into();
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
                channels: 1,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };

        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            track_id.clone(),
            stream_id.into(),
        ));

        Self {
            id: track_id,
            kind,
            rtc,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Enable or disable (mute) the track
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        debug!(track = %self.id, kind = %self.kind, enabled, "track toggled");
    }

    /// Whether the track currently emits samples
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Stop the track
    ///
    /// Returns `true` only for the call that actually stopped it; later
    /// calls are no-ops. Once stopped a track never emits again.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    /// Whether the track has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The underlying WebRTC track, for attaching to a peer connection
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// Write one encoded sample to the track
    ///
    /// Disabled tracks swallow the sample (mute); stopped tracks reject it
    /// so capture pumps know to shut down.
    pub async fn write_sample(&self, payload: Vec<u8>, duration: Duration) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::MediaTrack(format!("track {} is stopped", self.id)));
        }
        if !self.is_enabled() {
            return Ok(());
        }

        self.rtc
            .write_sample(&Sample {
                data: payload.into(),
                duration,
                timestamp: std::time::SystemTime::now(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::MediaTrack(format!("failed to write sample: {}", e)))
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Handle to the local set of capture tracks
#[derive(Debug, Clone)]
pub struct MediaStreamHandle {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl MediaStreamHandle {
    pub(crate) fn new(id: String, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self { id, tracks }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks in the stream
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// The audio track, if present
    pub fn audio(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    /// The video track, if present
    pub fn video(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }
}

/// One remote media track
#[derive(Clone)]
pub struct RemoteTrack {
    id: String,
    kind: TrackKind,
    inner: Arc<TrackRemote>,
}

impl RemoteTrack {
    pub(crate) fn new(id: String, kind: TrackKind, inner: Arc<TrackRemote>) -> Self {
        Self { id, kind, inner }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// The underlying WebRTC track, for reading RTP
    pub fn track(&self) -> Arc<TrackRemote> {
        Arc::clone(&self.inner)
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Handle to the remote participant's tracks
///
/// Owned by the peer connection that received them; a reconnection starts
/// from an empty handle and the old one is discarded wholesale.
#[derive(Debug, Clone, Default)]
pub struct RemoteStreamHandle {
    id: String,
    tracks: Vec<RemoteTrack>,
}

impl RemoteStreamHandle {
    pub(crate) fn new(id: String) -> Self {
        Self {
            id,
            tracks: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, track: RemoteTrack) {
        self.tracks.push(track);
    }

    /// Stream identifier (matches the owning connection)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All remote tracks received so far
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    /// The remote audio track, if present
    pub fn audio(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    /// The remote video track, if present
    pub fn video(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Whether any remote track has arrived
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Source of local capture tracks
///
/// Implementations front the platform capture stack. Failures are
/// user-actionable and terminal for the call attempt:
/// [`Error::MediaAccessDenied`] when the platform refuses capture,
/// [`Error::NoDeviceFound`] when no device exists.
#[async_trait]
pub trait MediaDeviceSource: Send + Sync {
    /// Open camera + microphone capture
    async fn open(&self) -> Result<Vec<Arc<LocalTrack>>>;
}

/// Owner of the local capture stream
///
/// Acquires capture once per call and releases it exactly once no matter
/// how many teardown paths run.
pub struct StreamManager {
    source: Arc<dyn MediaDeviceSource>,
    handle: RwLock<Option<MediaStreamHandle>>,
}

impl StreamManager {
    /// Create a manager backed by the given device source
    pub fn new(source: Arc<dyn MediaDeviceSource>) -> Self {
        Self {
            source,
            handle: RwLock::new(None),
        }
    }

    /// Request camera + microphone access
    ///
    /// Returns the existing handle if capture is already open. Failures are
    /// surfaced to the caller and never retried here: permission prompts are
    /// user-interactive, so retrying without user action cannot succeed.
    pub async fn acquire(&self) -> Result<MediaStreamHandle> {
        let mut guard = self.handle.write().await;
        if let Some(existing) = guard.as_ref() {
            debug!(stream = %existing.id(), "local stream already acquired");
            return Ok(existing.clone());
        }

        let tracks = self.source.open().await?;
        let handle = MediaStreamHandle::new(uuid::Uuid::new_v4().to_string(), tracks);
        info!(
            stream = %handle.id(),
            tracks = handle.tracks().len(),
            "local media acquired"
        );
        *guard = Some(handle.clone());
        Ok(handle)
    }

    /// Mute or unmute the local video track without renegotiating
    pub async fn set_video_enabled(&self, enabled: bool) {
        if let Some(handle) = self.handle.read().await.as_ref() {
            if let Some(track) = handle.video() {
                track.set_enabled(enabled);
            }
        }
    }

    /// Mute or unmute the local audio track without renegotiating
    pub async fn set_audio_enabled(&self, enabled: bool) {
        if let Some(handle) = self.handle.read().await.as_ref() {
            if let Some(track) = handle.audio() {
                track.set_enabled(enabled);
            }
        }
    }

    /// Stop every track and clear the handle
    ///
    /// Safe to call any number of times from any teardown path; each track
    /// is stopped at most once.
    pub async fn release(&self) {
        let taken = self.handle.write().await.take();
        match taken {
            Some(handle) => {
                for track in handle.tracks() {
                    if track.stop() {
                        debug!(track = %track.id(), kind = %track.kind(), "track stopped");
                    }
                }
                info!(stream = %handle.id(), "local media released");
            }
            None => debug!("release with no active stream"),
        }
    }

    /// The current handle, if capture is open
    pub async fn handle(&self) -> Option<MediaStreamHandle> {
        self.handle.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_stops_exactly_once() {
        let track = LocalTrack::new(TrackKind::Audio, "audio-0", "stream-0");
        assert!(!track.is_stopped());
        assert!(track.stop());
        assert!(!track.stop());
        assert!(track.is_stopped());
    }

    #[tokio::test]
    async fn test_disabled_track_swallows_samples() {
        let track = LocalTrack::new(TrackKind::Audio, "audio-0", "stream-0");
        track.set_enabled(false);
        // Unbound and muted: the write is a silent no-op.
        track
            .write_sample(vec![0xf8, 0xff, 0xfe], Duration::from_millis(20))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_track_rejects_samples() {
        let track = LocalTrack::new(TrackKind::Video, "video-0", "stream-0");
        track.stop();
        let err = track
            .write_sample(vec![0u8; 16], Duration::from_millis(33))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaTrack(_)));
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let manager = StreamManager::new(Arc::new(SyntheticMediaSource::new()));
        let handle = manager.acquire().await.unwrap();
        assert_eq!(handle.tracks().len(), 2);
        assert!(handle.audio().is_some());
        assert!(handle.video().is_some());

        manager.release().await;
        assert!(manager.handle().await.is_none());
        for track in handle.tracks() {
            assert!(track.is_stopped());
        }
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let manager = StreamManager::new(Arc::new(SyntheticMediaSource::new()));
        let handle = manager.acquire().await.unwrap();

        manager.release().await;
        manager.release().await;
        manager.release().await;

        // Each track was stopped by the first release and only once: a
        // direct stop() now reports "already stopped".
        for track in handle.tracks() {
            assert!(!track.stop());
        }
    }

    #[tokio::test]
    async fn test_acquire_twice_reuses_handle() {
        let manager = StreamManager::new(Arc::new(SyntheticMediaSource::new()));
        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_denied_source_surfaces_error() {
        let manager = StreamManager::new(Arc::new(SyntheticMediaSource::denying_access()));
        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, Error::MediaAccessDenied(_)));
        assert!(err.is_media_error());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_devices_surface_error() {
        let manager = StreamManager::new(Arc::new(SyntheticMediaSource::without_devices()));
        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, Error::NoDeviceFound(_)));
    }

    #[tokio::test]
    async fn test_toggle_flips_only_matching_kind() {
        let manager = StreamManager::new(Arc::new(SyntheticMediaSource::new()));
        let handle = manager.acquire().await.unwrap();

        manager.set_video_enabled(false).await;
        assert!(!handle.video().unwrap().is_enabled());
        assert!(handle.audio().unwrap().is_enabled());

        manager.set_video_enabled(true).await;
        assert!(handle.video().unwrap().is_enabled());
    }
}
