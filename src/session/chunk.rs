//! Video frames ride the `media-frames` data channel. SCTP messages are
//! capped near 16KB, so larger JPEGs are split into numbered chunks.
//!
//! Single message: `'V' | frame`.
//! Chunk: `'C' | frame_id: u32 LE | total: u16 LE | index: u16 LE | data`.
//! End of track: `'E'`, sent when the sender's camera stops.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Max data channel message size (under the 16KB SCTP limit).
pub const MAX_MESSAGE: usize = 15000;
const SINGLE: u8 = b'V';
const CHUNK: u8 = b'C';
const END: u8 = b'E';
const CHUNK_HEADER: usize = 9;
const MAX_CHUNK_DATA: usize = MAX_MESSAGE - CHUNK_HEADER;
/// Partial frames older than this many frame ids are abandoned.
const KEEP_FRAMES: u32 = 4;

#[derive(Debug, Default)]
pub struct FrameSplitter {
    next_frame_id: u32,
}

impl FrameSplitter {
    pub fn end_of_track() -> Bytes {
        Bytes::from_static(&[END])
    }

    pub fn split(&mut self, frame: &[u8]) -> Vec<Bytes> {
        if 1 + frame.len() <= MAX_MESSAGE {
            let mut msg = BytesMut::with_capacity(1 + frame.len());
            msg.put_u8(SINGLE);
            msg.put_slice(frame);
            return vec![msg.freeze()];
        }

        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        let total = frame.len().div_ceil(MAX_CHUNK_DATA) as u16;

        frame
            .chunks(MAX_CHUNK_DATA)
            .enumerate()
            .map(|(index, data)| {
                let mut msg = BytesMut::with_capacity(CHUNK_HEADER + data.len());
                msg.put_u8(CHUNK);
                msg.put_u32_le(frame_id);
                msg.put_u16_le(total);
                msg.put_u16_le(index as u16);
                msg.put_slice(data);
                msg.freeze()
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    Frame(Bytes),
    /// The sender stopped its video track.
    End,
}

/// Reassembles chunked frames from one remote peer.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    /// frame_id -> (total chunks, received chunks)
    pending: HashMap<u32, (u16, HashMap<u16, Bytes>)>,
}

impl FrameAssembler {
    /// Feed one data channel message; returns a frame once it is complete.
    pub fn push(&mut self, message: &[u8]) -> Option<Assembled> {
        let (&kind, body) = message.split_first()?;
        match kind {
            SINGLE => Some(Assembled::Frame(Bytes::copy_from_slice(body))),
            CHUNK => self.push_chunk(body).map(Assembled::Frame),
            END => {
                self.pending.clear();
                Some(Assembled::End)
            }
            _ => None,
        }
    }

    fn push_chunk(&mut self, body: &[u8]) -> Option<Bytes> {
        let frame_id = u32::from_le_bytes(body.get(0..4)?.try_into().ok()?);
        let total = u16::from_le_bytes(body.get(4..6)?.try_into().ok()?);
        let index = u16::from_le_bytes(body.get(6..8)?.try_into().ok()?);
        let data = body.get(8..)?;
        if total == 0 || index >= total {
            return None;
        }

        self.pending
            .retain(|id, _| frame_id.wrapping_sub(*id) < KEEP_FRAMES);

        let entry = self
            .pending
            .entry(frame_id)
            .or_insert_with(|| (total, HashMap::new()));
        entry.1.insert(index, Bytes::copy_from_slice(data));
        if entry.1.len() < entry.0 as usize {
            return None;
        }

        let (total, mut chunks) = self.pending.remove(&frame_id)?;
        let mut frame = BytesMut::new();
        for i in 0..total {
            frame.put(chunks.remove(&i)?);
        }
        Some(frame.freeze())
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_frame_is_one_message() {
        let mut splitter = FrameSplitter::default();
        let messages = splitter.split(b"jpeg");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].len(), 5);

        let mut assembler = FrameAssembler::default();
        assert_eq!(
            assembler.push(&messages[0]),
            Some(Assembled::Frame(Bytes::from_static(b"jpeg")))
        );
    }

    #[test]
    fn large_frame_reassembles_out_of_order() {
        let frame: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let mut splitter = FrameSplitter::default();
        let mut messages = splitter.split(&frame);
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.len() <= MAX_MESSAGE));

        messages.swap(0, 2);
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(&messages[0]).is_none());
        assert!(assembler.push(&messages[1]).is_none());
        let Some(Assembled::Frame(whole)) = assembler.push(&messages[2]) else {
            panic!("frame not reassembled");
        };
        assert_eq!(whole.as_ref(), frame.as_slice());
        assert_eq!(assembler.pending_frames(), 0);
    }

    #[test]
    fn stale_partial_frames_are_dropped() {
        let frame = vec![7u8; MAX_MESSAGE * 2];
        let mut splitter = FrameSplitter::default();
        let mut assembler = FrameAssembler::default();

        // First chunk of each of six frames, never completed.
        for _ in 0..6 {
            let messages = splitter.split(&frame);
            assembler.push(&messages[0]);
        }
        assert_eq!(assembler.pending_frames(), KEEP_FRAMES as usize);
    }

    #[test]
    fn end_marker_drops_partial_frames() {
        let frame = vec![1u8; MAX_MESSAGE * 2];
        let mut splitter = FrameSplitter::default();
        let mut assembler = FrameAssembler::default();
        assembler.push(&splitter.split(&frame)[0]);
        assert_eq!(assembler.pending_frames(), 1);

        assert_eq!(
            assembler.push(&FrameSplitter::end_of_track()),
            Some(Assembled::End)
        );
        assert_eq!(assembler.pending_frames(), 0);
    }

    #[test]
    fn malformed_messages_are_ignored() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(&[]).is_none());
        assert!(assembler.push(b"X123").is_none());
        assert!(assembler.push(&[CHUNK, 1, 0]).is_none());
        // index past total
        assert!(assembler
            .push(&[CHUNK, 0, 0, 0, 0, 1, 0, 5, 0, 9])
            .is_none());
    }
}
