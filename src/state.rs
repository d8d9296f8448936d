use serde::Serialize;
use tokio::sync::watch;

use crate::media::TrackKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomOccupancy {
    #[default]
    Empty,
    Occupied,
}

/// Which screen the presentation layer shows. Not used for call correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModalPhase {
    #[default]
    ChoosingRole,
    EnteringRoomId,
    InCall,
}

/// Snapshot of call/UI state published to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallState {
    pub local_identity: Option<String>,
    pub remote_identity: Option<String>,
    pub room_occupancy: RoomOccupancy,
    pub local_video_active: bool,
    pub local_audio_active: bool,
    pub remote_video_active: bool,
    pub remote_audio_active: bool,
    pub modal_phase: ModalPhase,
    /// Bumped on every hang-up; async results carrying an older value are stale.
    pub generation: u64,
}

impl CallState {
    pub fn local_active(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.local_audio_active,
            TrackKind::Video => self.local_video_active,
        }
    }

    pub fn remote_active(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.remote_audio_active,
            TrackKind::Video => self.remote_video_active,
        }
    }
}

/// The single owner of [`CallState`].
///
/// All mutation goes through the update functions below; each one that
/// changes something republishes the snapshot on the watch channel.
pub struct CallStore {
    state: CallState,
    tx: watch::Sender<CallState>,
}

impl CallStore {
    pub fn new() -> (Self, watch::Receiver<CallState>) {
        let (tx, rx) = watch::channel(CallState::default());
        (
            Self {
                state: CallState::default(),
                tx,
            },
            rx,
        )
    }

    pub fn get(&self) -> &CallState {
        &self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.tx.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    fn update(&mut self, f: impl FnOnce(&mut CallState)) {
        let before = self.state.clone();
        f(&mut self.state);
        if self.state != before {
            // Receivers may all be gone during shutdown.
            let _ = self.tx.send(self.state.clone());
        }
    }

    pub fn set_local_identity(&mut self, identity: Option<String>) {
        self.update(|s| s.local_identity = identity);
    }

    pub fn set_remote_identity(&mut self, identity: Option<String>) {
        self.update(|s| s.remote_identity = identity);
    }

    pub fn set_local_active(&mut self, kind: TrackKind, active: bool) {
        self.update(|s| match kind {
            TrackKind::Audio => s.local_audio_active = active,
            TrackKind::Video => s.local_video_active = active,
        });
    }

    pub fn set_remote_active(&mut self, kind: TrackKind, active: bool) {
        self.update(|s| match kind {
            TrackKind::Audio => s.remote_audio_active = active,
            TrackKind::Video => s.remote_video_active = active,
        });
    }

    pub fn set_occupancy(&mut self, occupancy: RoomOccupancy) {
        self.update(|s| s.room_occupancy = occupancy);
    }

    pub fn set_modal_phase(&mut self, phase: ModalPhase) {
        self.update(|s| s.modal_phase = phase);
    }

    /// Drop everything tied to the remote party.
    pub fn clear_remote(&mut self) {
        self.update(|s| {
            s.remote_identity = None;
            s.room_occupancy = RoomOccupancy::Empty;
            s.remote_video_active = false;
            s.remote_audio_active = false;
        });
    }

    /// Invalidate every in-flight async result. Returns the new generation.
    pub fn bump_generation(&mut self) -> u64 {
        self.update(|s| s.generation = s.generation.wrapping_add(1));
        self.state.generation
    }
}
