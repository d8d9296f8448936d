use bytes::Bytes;
use tracing::error;

/// 48kHz mono throughout: capture, RTP clock and playback all agree.
pub const SAMPLE_RATE: u32 = 48000;
/// 20ms of audio at [`SAMPLE_RATE`].
pub const FRAME_SAMPLES: usize = 960;
/// Largest Opus packet we ever produce.
const MAX_PACKET: usize = 4000;

/// Encodes microphone PCM into Opus packets for the outgoing audio track.
pub struct OpusEncoder {
    encoder: opus::Encoder,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, String> {
        let encoder = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
            .map_err(|e| format!("Failed to create Opus encoder: {}", e))?;
        Ok(Self { encoder })
    }

    pub fn encode(&mut self, pcm: &[f32]) -> Result<Bytes, String> {
        let mut output = vec![0u8; MAX_PACKET];
        let len = self
            .encoder
            .encode_float(pcm, &mut output)
            .map_err(|e| format!("Opus encode error: {}", e))?;
        output.truncate(len);
        Ok(Bytes::from(output))
    }
}

/// Decodes Opus packets from a remote audio track for playback.
pub struct OpusDecoder {
    decoder: opus::Decoder,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, String> {
        let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| format!("Failed to create Opus decoder: {}", e))?;
        Ok(Self { decoder })
    }

    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>, String> {
        let mut output = vec![0.0f32; FRAME_SAMPLES];
        let len = self
            .decoder
            .decode_float(packet, &mut output, false)
            .map_err(|e| {
                error!("Opus decode error: {}", e);
                format!("Opus decode error: {}", e)
            })?;
        output.truncate(len);
        Ok(output)
    }
}
