use std::sync::Arc;
use tracing::{debug, info};

use super::{MediaConstraints, MediaDevices, MediaTrackSet, Track, TrackKind};
use crate::error::DeviceError;
use crate::state::CallStore;

/// A device request in flight, stamped with the generation it was made in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireRequest {
    pub constraints: MediaConstraints,
    pub generation: u64,
}

#[derive(Debug)]
pub enum AcquireOutcome {
    /// Newly held tracks (possibly none, if everything was already held).
    Acquired(Vec<Track>),
    /// A hang-up happened while the request was out; its tracks were stopped.
    Stale,
}

/// Owns the local camera and microphone tracks and keeps the local flags in
/// [`CallStore`] in step with them.
pub struct MediaDeviceController {
    devices: Arc<dyn MediaDevices>,
    local: MediaTrackSet,
}

impl MediaDeviceController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            local: MediaTrackSet::default(),
        }
    }

    pub fn devices(&self) -> Arc<dyn MediaDevices> {
        self.devices.clone()
    }

    pub fn local_tracks(&self) -> &MediaTrackSet {
        &self.local
    }

    /// Work out what to ask the hardware for. Kinds already held live are
    /// left out, so acquiring is additive.
    pub fn begin_acquire(&self, store: &CallStore, want_video: bool, want_audio: bool) -> AcquireRequest {
        AcquireRequest {
            constraints: MediaConstraints {
                video: want_video && !self.local.is_live(TrackKind::Video),
                audio: want_audio && !self.local.is_live(TrackKind::Audio),
            },
            generation: store.generation(),
        }
    }

    /// Apply the result of a device request.
    ///
    /// A failed request leaves state untouched. A request that outlived a
    /// hang-up has its tracks stopped instead of stored.
    pub fn complete_acquire(
        &mut self,
        store: &mut CallStore,
        request: AcquireRequest,
        result: Result<MediaTrackSet, DeviceError>,
    ) -> Result<AcquireOutcome, DeviceError> {
        let mut acquired = result?;

        if request.generation != store.generation() {
            debug!(
                "Discarding tracks from generation {} (now {})",
                request.generation,
                store.generation()
            );
            acquired.stop_all();
            return Ok(AcquireOutcome::Stale);
        }

        let mut added = Vec::new();
        for kind in [TrackKind::Video, TrackKind::Audio] {
            let Some(track) = acquired.take(kind) else {
                continue;
            };
            if let Some(previous) = self.local.insert(track.clone()) {
                if !previous.same_as(&track) {
                    previous.stop();
                }
            }
            store.set_local_active(kind, true);
            info!("Local {} track {} active", kind, track.id());
            added.push(track);
        }
        Ok(AcquireOutcome::Acquired(added))
    }

    /// Request and apply in one step.
    pub async fn acquire(
        &mut self,
        store: &mut CallStore,
        want_video: bool,
        want_audio: bool,
    ) -> Result<AcquireOutcome, DeviceError> {
        let request = self.begin_acquire(store, want_video, want_audio);
        if request.constraints.is_empty() {
            return Ok(AcquireOutcome::Acquired(Vec::new()));
        }
        let result = self.devices.get_user_media(request.constraints).await;
        self.complete_acquire(store, request, result)
    }

    /// Stop the held track of `kind`. The other kind is untouched.
    pub fn stop(&mut self, store: &mut CallStore, kind: TrackKind) -> Result<(), DeviceError> {
        let track = self
            .local
            .take(kind)
            .ok_or(DeviceError::TrackNotHeld(kind))?;
        track.stop();
        store.set_local_active(kind, false);
        info!("Local {} track {} stopped", kind, track.id());
        Ok(())
    }

    pub fn stop_video(&mut self, store: &mut CallStore) -> Result<(), DeviceError> {
        self.stop(store, TrackKind::Video)
    }

    pub fn stop_audio(&mut self, store: &mut CallStore) -> Result<(), DeviceError> {
        self.stop(store, TrackKind::Audio)
    }

    /// Drop `track` if it is the one held for its kind and its producer has
    /// gone away. Returns true if the local flag was lowered.
    pub fn forget_ended(&mut self, store: &mut CallStore, track: &Track) -> bool {
        let kind = track.kind();
        let held = self
            .local
            .get(kind)
            .is_some_and(|current| current.same_as(track) && !current.is_live());
        if !held {
            return false;
        }
        self.local.take(kind);
        store.set_local_active(kind, false);
        info!("Local {} track {} ended on its own", kind, track.id());
        true
    }

    /// Stop everything held and lower both local flags.
    pub fn release_all(&mut self, store: &mut CallStore) {
        self.local.stop_all();
        store.set_local_active(TrackKind::Video, false);
        store.set_local_active(TrackKind::Audio, false);
    }
}
