//! Byte-stream alignment to exact PCM frame units.
//!
//! The bridge socket carries raw bytes with no framing header, so both ends
//! enforce the 4096-byte unit themselves: the Station sink pads or drops
//! partials before writing, and the Tower ingest reassembles exact units
//! from whatever chunk sizes the kernel hands back.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol_constants::PCM_FRAME_BYTES;

/// Stateful assembler that turns arbitrary byte chunks into complete
/// 4096-byte PCM frames.
///
/// Bytes that do not yet complete a frame are held until the next `feed`.
/// On disconnect the caller invokes [`reset`](Self::reset), which discards
/// the held residue. A partial frame from a dead writer is never prepended
/// to the next writer's stream.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: BytesMut,
    frames_assembled: u64,
    bytes_discarded: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every frame it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.put_slice(chunk);

        let complete = self.pending.len() / PCM_FRAME_BYTES;
        let mut frames = Vec::with_capacity(complete);
        for _ in 0..complete {
            frames.push(self.pending.split_to(PCM_FRAME_BYTES).freeze());
        }
        self.frames_assembled += frames.len() as u64;
        frames
    }

    /// Discards any buffered partial frame, returning how many bytes were
    /// dropped. Called when the writer disconnects.
    pub fn reset(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.bytes_discarded += dropped as u64;
        dropped
    }

    /// Total complete frames produced over the assembler's lifetime.
    #[must_use]
    pub fn frames_assembled(&self) -> u64 {
        self.frames_assembled
    }

    /// Total residue bytes discarded across resets.
    #[must_use]
    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded
    }

    /// Bytes currently held waiting for the rest of a frame.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Zero-pads a short final read up to one full frame.
///
/// The Station sink uses this when a decoder's last stdout read ends
/// mid-frame; anything already frame-sized is returned unchanged.
#[must_use]
pub fn pad_to_frame(partial: &[u8]) -> Bytes {
    if partial.len() >= PCM_FRAME_BYTES {
        return Bytes::copy_from_slice(&partial[..PCM_FRAME_BYTES]);
    }
    let mut frame = BytesMut::with_capacity(PCM_FRAME_BYTES);
    frame.put_slice(partial);
    frame.resize(PCM_FRAME_BYTES, 0);
    frame.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_frame_passes_through() {
        let mut assembler = FrameAssembler::new();
        let frames = assembler.feed(&[7u8; PCM_FRAME_BYTES]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), PCM_FRAME_BYTES);
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn split_frame_reassembles_across_feeds() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.feed(&[1u8; 1000]).is_empty());
        assert!(assembler.feed(&[1u8; 3000]).is_empty());
        let frames = assembler.feed(&[1u8; 96]);
        assert_eq!(frames.len(), 1);
        assert_eq!(assembler.frames_assembled(), 1);
    }

    #[test]
    fn oversized_chunk_yields_multiple_frames_and_keeps_residue() {
        let mut assembler = FrameAssembler::new();
        let frames = assembler.feed(&[2u8; PCM_FRAME_BYTES * 2 + 100]);
        assert_eq!(frames.len(), 2);
        assert_eq!(assembler.pending_len(), 100);
    }

    #[test]
    fn frame_boundaries_preserve_byte_order() {
        let mut assembler = FrameAssembler::new();
        let mut input = vec![0u8; PCM_FRAME_BYTES * 2];
        input[0] = 0xAA;
        input[PCM_FRAME_BYTES] = 0xBB;
        let frames = assembler.feed(&input);
        assert_eq!(frames[0][0], 0xAA);
        assert_eq!(frames[1][0], 0xBB);
    }

    #[test]
    fn reset_discards_residue() {
        let mut assembler = FrameAssembler::new();
        assembler.feed(&[3u8; 500]);
        assert_eq!(assembler.reset(), 500);
        assert_eq!(assembler.bytes_discarded(), 500);

        // A fresh frame after reset is not contaminated by the residue.
        let frames = assembler.feed(&[4u8; PCM_FRAME_BYTES]);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].iter().all(|&b| b == 4));
    }

    #[test]
    fn pad_to_frame_zero_fills() {
        let frame = pad_to_frame(&[9u8; 100]);
        assert_eq!(frame.len(), PCM_FRAME_BYTES);
        assert!(frame[..100].iter().all(|&b| b == 9));
        assert!(frame[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn pad_to_frame_full_input_unchanged() {
        let frame = pad_to_frame(&[5u8; PCM_FRAME_BYTES]);
        assert_eq!(frame.len(), PCM_FRAME_BYTES);
        assert!(frame.iter().all(|&b| b == 5));
    }
}
