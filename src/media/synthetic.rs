//! Generated capture device
//!
//! Emits Opus silence and solid-color video payloads on a fixed cadence.
//! Used by tests and local development; real device capture lives behind
//! the same [`MediaDeviceSource`] trait in the host integration.

use super::{LocalTrack, MediaDeviceSource, TrackKind};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Opus PLC silence frame
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(40);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Available,
    Denied,
    Missing,
}

/// Synthetic camera + microphone
#[derive(Debug, Clone)]
pub struct SyntheticMediaSource {
    mode: Mode,
}

impl SyntheticMediaSource {
    /// A working synthetic camera + microphone pair
    pub fn new() -> Self {
        Self {
            mode: Mode::Available,
        }
    }

    /// A source whose platform refuses capture permission
    pub fn denying_access() -> Self {
        Self { mode: Mode::Denied }
    }

    /// A source with no capture hardware at all
    pub fn without_devices() -> Self {
        Self { mode: Mode::Missing }
    }

    fn spawn_pump(track: Arc<LocalTrack>) {
        let (payload, frame) = match track.kind() {
            TrackKind::Audio => (OPUS_SILENCE.to_vec(), AUDIO_FRAME),
            // Opaque placeholder payload; synthetic peers do not decode it.
            TrackKind::Video => (vec![0u8; 128], VIDEO_FRAME),
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = track.write_sample(payload.clone(), frame).await {
                    trace!(track = %track.id(), error = %err, "capture pump stopping");
                    break;
                }
            }
            debug!(track = %track.id(), "capture pump ended");
        });
    }
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDeviceSource for SyntheticMediaSource {
    async fn open(&self) -> Result<Vec<Arc<LocalTrack>>> {
        match self.mode {
            Mode::Denied => Err(Error::MediaAccessDenied(
                "capture permission refused by the platform".to_string(),
            )),
            Mode::Missing => Err(Error::NoDeviceFound(
                "no camera or microphone present".to_string(),
            )),
            Mode::Available => {
                let stream_id = uuid::Uuid::new_v4().to_string();
                let audio = Arc::new(LocalTrack::new(
                    TrackKind::Audio,
                    format!("audio-{stream_id}"),
                    stream_id.clone(),
                ));
                let video = Arc::new(LocalTrack::new(
                    TrackKind::Video,
                    format!("video-{stream_id}"),
                    stream_id,
                ));

                Self::spawn_pump(Arc::clone(&audio));
                Self::spawn_pump(Arc::clone(&video));

                Ok(vec![audio, video])
            }
        }
    }
}
