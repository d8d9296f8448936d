use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use super::{MediaFrame, TrackKind, TrackOrigin};

/// Frames buffered per subscriber before the slowest one starts lagging.
const FRAME_BUFFER: usize = 64;

/// A single live audio or video unit, local or remote.
///
/// Cloning shares the same underlying resource. The producer side holds a
/// [`TrackFeed`] and stops producing once the track is stopped or the last
/// `Track` handle is dropped. A producer that gives up on its own calls
/// [`TrackFeed::end`], which consumers see through [`Track::ended`].
#[derive(Clone)]
pub struct Track {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    origin: TrackOrigin,
    live: Arc<watch::Sender<bool>>,
    frames: broadcast::Sender<MediaFrame>,
}

impl Drop for TrackInner {
    fn drop(&mut self) {
        self.live.send_replace(false);
    }
}

/// Producer half of a [`Track`]: capture threads and RTP readers push here.
#[derive(Clone)]
pub struct TrackFeed {
    live: Arc<watch::Sender<bool>>,
    frames: broadcast::Sender<MediaFrame>,
}

impl TrackFeed {
    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// The source is gone (device unplugged, remote stopped sending).
    pub fn end(&self) {
        self.live.send_replace(false);
    }

    /// Publish a frame. Returns false once the track has been stopped.
    pub fn push(&self, frame: MediaFrame) -> bool {
        if !self.is_live() {
            return false;
        }
        // No subscribers is fine: nobody is watching this track yet.
        let _ = self.frames.send(frame);
        true
    }
}

impl Track {
    pub fn new(kind: TrackKind, origin: TrackOrigin) -> (Self, TrackFeed) {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, origin)
    }

    pub fn with_id(id: String, kind: TrackKind, origin: TrackOrigin) -> (Self, TrackFeed) {
        let live = Arc::new(watch::channel(true).0);
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        let feed = TrackFeed {
            live: live.clone(),
            frames: frames.clone(),
        };
        let track = Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                origin,
                live,
                frames,
            }),
        };
        (track, feed)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn origin(&self) -> TrackOrigin {
        self.inner.origin
    }

    pub fn is_live(&self) -> bool {
        *self.inner.live.borrow()
    }

    /// Stop the track. Stopping twice is harmless.
    pub fn stop(&self) {
        self.inner.live.send_replace(false);
    }

    /// Resolves once the track is no longer live, whoever ended it.
    pub async fn ended(&self) {
        let mut live = self.inner.live.subscribe();
        let _ = live.wait_for(|live| !*live).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.inner.frames.subscribe()
    }

    pub fn same_as(&self, other: &Track) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("origin", &self.inner.origin)
            .field("live", &self.is_live())
            .finish()
    }
}
