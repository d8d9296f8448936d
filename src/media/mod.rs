pub mod audio;
pub mod codec;
pub mod controller;
pub mod devices;
pub mod track;
pub mod video;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use controller::{AcquireOutcome, AcquireRequest, MediaDeviceController};
pub use devices::{HardwareDevices, MediaDevices};
pub use track::{Track, TrackFeed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOrigin {
    Local,
    Remote,
}

/// One encoded unit: an Opus packet for audio, a JPEG image for video.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// What to ask the hardware for, `getUserMedia`-style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl MediaConstraints {
    pub fn is_empty(&self) -> bool {
        !self.video && !self.audio
    }

    pub fn wants(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio,
            TrackKind::Video => self.video,
        }
    }
}

/// At most one track per kind.
#[derive(Debug, Clone, Default)]
pub struct MediaTrackSet {
    pub video: Option<Track>,
    pub audio: Option<Track>,
}

impl MediaTrackSet {
    pub fn get(&self, kind: TrackKind) -> Option<&Track> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    fn slot(&mut self, kind: TrackKind) -> &mut Option<Track> {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }

    /// Put `track` in its kind's slot, handing back whatever was there.
    pub fn insert(&mut self, track: Track) -> Option<Track> {
        self.slot(track.kind()).replace(track)
    }

    pub fn take(&mut self, kind: TrackKind) -> Option<Track> {
        self.slot(kind).take()
    }

    /// True if a live track of this kind is held.
    pub fn is_live(&self, kind: TrackKind) -> bool {
        self.get(kind).map(Track::is_live).unwrap_or(false)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.video.iter().chain(self.audio.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    /// Stop and drop every track.
    pub fn stop_all(&mut self) {
        for track in self.video.take().into_iter().chain(self.audio.take()) {
            track.stop();
        }
    }
}
