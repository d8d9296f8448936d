use async_trait::async_trait;
use tracing::{info, warn};

use super::{audio, video, MediaConstraints, MediaTrackSet, Track, TrackKind};
use crate::error::DeviceError;

/// Local capture/playback hardware, `getUserMedia`-style.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire every requested kind, or nothing: on failure any track already
    /// opened for this request is stopped before returning the error.
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaTrackSet, DeviceError>;

    /// Start presenting a remote track (speaker for audio).
    fn attach_remote(&self, track: &Track);
}

/// Real camera (nokhwa) and microphone/speaker (cpal).
#[derive(Debug, Clone, Default)]
pub struct HardwareDevices {
    pub camera_index: Option<u32>,
}

impl HardwareDevices {
    pub fn new(camera_index: Option<u32>) -> Self {
        Self { camera_index }
    }

    async fn open(&self, kind: TrackKind) -> Result<Track, DeviceError> {
        let camera_index = self.camera_index;
        let opened = tokio::task::spawn_blocking(move || match kind {
            TrackKind::Video => video::start_camera(camera_index),
            TrackKind::Audio => audio::start_capture(),
        })
        .await;

        match opened {
            Ok(Ok(track)) => Ok(track),
            Ok(Err(reason)) => Err(DeviceError::Unavailable { kind, reason }),
            Err(e) => Err(DeviceError::Unavailable {
                kind,
                reason: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl MediaDevices for HardwareDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaTrackSet, DeviceError> {
        let mut set = MediaTrackSet::default();

        for kind in [TrackKind::Video, TrackKind::Audio] {
            if !constraints.wants(kind) {
                continue;
            }
            match self.open(kind).await {
                Ok(track) => {
                    info!("Acquired local {} track {}", kind, track.id());
                    set.insert(track);
                }
                Err(e) => {
                    warn!("Failed to acquire {}: {}", kind, e);
                    set.stop_all();
                    return Err(e);
                }
            }
        }

        Ok(set)
    }

    fn attach_remote(&self, track: &Track) {
        let track = track.clone();
        match track.kind() {
            TrackKind::Audio => {
                tokio::spawn(audio::play_track(track));
            }
            TrackKind::Video => {
                tokio::spawn(video::watch_remote(track));
            }
        }
    }
}
