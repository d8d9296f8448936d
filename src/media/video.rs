use bytes::Bytes;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

use super::{MediaFrame, Track, TrackKind, TrackOrigin};

/// ~15 fps.
const FRAME_INTERVAL: Duration = Duration::from_millis(66);

/// Open a camera and return it as a local video track of JPEG frames.
/// Target: 640x480 @ 15fps.
///
/// The nokhwa Camera is not Send, so it lives on its own thread until the
/// track is stopped.
pub fn start_camera(device_index: Option<u32>) -> Result<Track, String> {
    let (track, feed) = Track::new(TrackKind::Video, TrackOrigin::Local);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

    std::thread::spawn(move || {
        let index = CameraIndex::Index(device_index.unwrap_or(0));
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(Resolution::new(640, 480), FrameFormat::MJPEG, 15),
        ));

        let mut camera = match Camera::new(index, requested) {
            Ok(c) => c,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("Failed to open camera: {}", e)));
                return;
            }
        };

        if let Err(e) = camera.open_stream() {
            let _ = ready_tx.send(Err(format!("Failed to open camera stream: {}", e)));
            return;
        }

        info!("Camera started: {}", camera.info().human_name());
        let _ = ready_tx.send(Ok(()));

        while feed.is_live() {
            match camera.frame() {
                Ok(frame) => match frame.decode_image::<RgbFormat>() {
                    Ok(rgb_image) => {
                        let mut jpeg = Vec::new();
                        let mut cursor = std::io::Cursor::new(&mut jpeg);
                        if let Err(e) = rgb_image.write_to(&mut cursor, image::ImageFormat::Jpeg) {
                            error!("JPEG encode failed: {}", e);
                            continue;
                        }
                        feed.push(MediaFrame {
                            data: Bytes::from(jpeg),
                            duration: FRAME_INTERVAL,
                        });
                    }
                    Err(e) => error!("Frame decode failed: {}", e),
                },
                Err(e) => {
                    if feed.is_live() {
                        error!("Camera frame error: {}", e);
                    }
                    break;
                }
            }

            std::thread::sleep(FRAME_INTERVAL);
        }

        feed.end();
        if let Err(e) = camera.stop_stream() {
            debug!("Camera stream did not stop cleanly: {}", e);
        }
        info!("Camera stopped");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(track),
        Ok(Err(e)) => Err(e),
        Err(_) => Err("Camera thread panicked".into()),
    }
}

/// Consume a remote video track until it stops, logging what arrives.
/// Rendering belongs to the presentation layer, which subscribes on its own.
pub async fn watch_remote(track: Track) {
    let mut frames = track.subscribe();
    let mut received: u64 = 0;

    while track.is_live() {
        match tokio::time::timeout(Duration::from_millis(500), frames.recv()).await {
            Ok(Ok(frame)) => {
                received += 1;
                if received == 1 {
                    match image::load_from_memory(&frame.data) {
                        Ok(img) => info!(
                            "Remote video {}: first frame {}x{}",
                            track.id(),
                            img.width(),
                            img.height()
                        ),
                        Err(e) => debug!("Remote video frame is not a JPEG: {}", e),
                    }
                }
            }
            Ok(Err(RecvError::Lagged(n))) => debug!("Remote video lagged, skipped {} frames", n),
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => {}
        }
    }

    info!("Remote video {} ended after {} frames", track.id(), received);
}
