use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use super::codec::{OpusDecoder, OpusEncoder, FRAME_SAMPLES, SAMPLE_RATE};
use super::{MediaFrame, Track, TrackKind, TrackOrigin};

const FRAME_DURATION: Duration = Duration::from_millis(20);
/// Playback buffer cap (~100ms) so latency cannot build up.
const MAX_BUFFERED: usize = 4800;

type Ring = Arc<Mutex<VecDeque<f32>>>;

fn stream_config() -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Open the default microphone and return it as a local audio track of
/// Opus packets (20ms each).
///
/// The cpal::Stream is !Send, so it is built and kept on a dedicated thread
/// that lives until the track is stopped.
pub fn start_capture() -> Result<Track, String> {
    let (track, feed) = Track::new(TrackKind::Audio, TrackOrigin::Local);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

    std::thread::spawn(move || {
        let host = cpal::default_host();
        let device = match host.default_input_device() {
            Some(d) => d,
            None => {
                let _ = ready_tx.send(Err("No input device available".into()));
                return;
            }
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".into());
        info!("Using input device: {}", device_name);

        let mut encoder = match OpusEncoder::new() {
            Ok(enc) => enc,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        let callback_feed = feed.clone();
        let error_feed = feed.clone();
        let mut buffer = Vec::with_capacity(FRAME_SAMPLES);

        let stream = match device.build_input_stream(
            &stream_config(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !callback_feed.is_live() {
                    return;
                }
                for &sample in data {
                    buffer.push(sample);
                    if buffer.len() == FRAME_SAMPLES {
                        match encoder.encode(&buffer) {
                            Ok(packet) => {
                                callback_feed.push(MediaFrame {
                                    data: packet,
                                    duration: FRAME_DURATION,
                                });
                            }
                            Err(e) => debug!("Dropping mic frame: {}", e),
                        }
                        buffer.clear();
                    }
                }
            },
            move |err| {
                error!("Audio capture error: {}", err);
                if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                    error_feed.end();
                }
            },
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("Failed to build input stream: {}", e)));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(format!("Failed to start capture: {}", e)));
            return;
        }

        info!("Microphone capture started (48kHz mono, 20ms frames)");
        let _ = ready_tx.send(Ok(()));

        while feed.is_live() {
            std::thread::sleep(Duration::from_millis(50));
        }

        drop(stream);
        feed.end();
        info!("Microphone capture stopped");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(track),
        Ok(Err(e)) => Err(e),
        Err(_) => Err("Audio capture thread panicked".into()),
    }
}

/// Open the default speaker; samples are pulled from `ring` until `track`
/// stops.
fn start_output(ring: Ring, track: Track) -> Result<(), String> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

    std::thread::spawn(move || {
        let host = cpal::default_host();
        let device = match host.default_output_device() {
            Some(d) => d,
            None => {
                let _ = ready_tx.send(Err("No output device available".into()));
                return;
            }
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".into());
        info!("Using output device: {}", device_name);

        let stream = match device.build_output_stream(
            &stream_config(),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| match ring.lock() {
                Ok(mut ring) => {
                    for sample in data.iter_mut() {
                        *sample = ring.pop_front().unwrap_or(0.0);
                    }
                }
                Err(_) => data.fill(0.0),
            },
            move |err| {
                error!("Audio playback error: {}", err);
            },
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("Failed to build output stream: {}", e)));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(format!("Failed to start playback: {}", e)));
            return;
        }

        let _ = ready_tx.send(Ok(()));

        while track.is_live() {
            std::thread::sleep(Duration::from_millis(50));
        }

        drop(stream);
        info!("Remote audio playback stopped");
    });

    match ready_rx.recv() {
        Ok(result) => result,
        Err(_) => Err("Audio playback thread panicked".into()),
    }
}

/// Decode a remote audio track and play it on the default speaker until the
/// track is stopped.
pub async fn play_track(track: Track) {
    let ring: Ring = Arc::new(Mutex::new(VecDeque::with_capacity(SAMPLE_RATE as usize)));

    let output_ring = ring.clone();
    let output_track = track.clone();
    match tokio::task::spawn_blocking(move || start_output(output_ring, output_track)).await {
        Ok(Ok(())) => info!("Playing remote audio track {}", track.id()),
        Ok(Err(e)) => {
            warn!("Cannot play remote audio: {}", e);
            return;
        }
        Err(e) => {
            warn!("Audio playback setup failed: {}", e);
            return;
        }
    }

    let mut decoder = match OpusDecoder::new() {
        Ok(dec) => dec,
        Err(e) => {
            warn!("Cannot play remote audio: {}", e);
            return;
        }
    };

    let mut frames = track.subscribe();
    while track.is_live() {
        // Wake up periodically so a silent, stopped track ends the loop.
        let frame = match tokio::time::timeout(Duration::from_millis(500), frames.recv()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(RecvError::Lagged(n))) => {
                debug!("Remote audio lagged, skipped {} frames", n);
                continue;
            }
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => continue,
        };

        let Ok(pcm) = decoder.decode(&frame.data) else {
            continue;
        };
        if let Ok(mut ring) = ring.lock() {
            while ring.len() > MAX_BUFFERED {
                ring.pop_front();
            }
            ring.extend(pcm);
        }
    }
}
