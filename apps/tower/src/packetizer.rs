//! MP3 byte packetizer.
//!
//! Turns the encoder's arbitrary stdout chunks into complete MP3 frames.
//! Nothing downstream ever sees a partial frame: clients joining mid-stream
//! resynchronize on the first complete frame header they receive, which only
//! works if frame boundaries are preserved exactly.
//!
//! The parser trusts nothing: malformed or impossible headers advance the
//! scan by a single byte, and a bounded internal buffer discards oldest
//! bytes under pathological input rather than growing without limit.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Upper bound on buffered unparsed bytes. The largest legal Layer III
/// frame is under 2 KB; holding 64 KB means even a long run of garbage
/// between frames cannot grow the buffer unboundedly.
const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Layer III bitrates (kbit/s) by header index, MPEG version 1.
const BITRATES_V1: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];

/// Layer III bitrates (kbit/s) by header index, MPEG versions 2 and 2.5.
const BITRATES_V2: [u32; 16] = [
    0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0,
];

/// Sample rates (Hz) by header index and MPEG version.
const SAMPLE_RATES_V1: [u32; 3] = [44_100, 48_000, 32_000];
const SAMPLE_RATES_V2: [u32; 3] = [22_050, 24_000, 16_000];
const SAMPLE_RATES_V25: [u32; 3] = [11_025, 12_000, 8_000];

/// Parses a 4-byte MP3 header, returning the exact frame length in bytes.
///
/// Returns `None` for anything that is not a plausible Layer III header:
/// bad sync, reserved version, wrong layer, free/invalid bitrate, reserved
/// sample rate.
fn frame_length(header: &[u8]) -> Option<usize> {
    if header.len() < 4 {
        return None;
    }
    // 11-bit sync: 0xFF then the high three bits of the next byte all set.
    if header[0] != 0xFF || header[1] & 0xE0 != 0xE0 {
        return None;
    }

    let version_bits = (header[1] >> 3) & 0x03; // 00=2.5, 01=reserved, 10=2, 11=1
    let layer_bits = (header[1] >> 1) & 0x03; // 01 = Layer III
    if version_bits == 0b01 || layer_bits != 0b01 {
        return None;
    }
    let is_v1 = version_bits == 0b11;

    let bitrate_index = (header[2] >> 4) as usize;
    let samplerate_index = ((header[2] >> 2) & 0x03) as usize;
    let padding = ((header[2] >> 1) & 0x01) as usize;

    if samplerate_index == 3 {
        return None;
    }
    let bitrate_kbps = if is_v1 {
        BITRATES_V1[bitrate_index]
    } else {
        BITRATES_V2[bitrate_index]
    };
    if bitrate_kbps == 0 {
        // Free-format and the reserved index are both rejected; the encoder
        // never emits them and accepting free-format would make frame length
        // unknowable.
        return None;
    }

    let sample_rate = match version_bits {
        0b11 => SAMPLE_RATES_V1[samplerate_index],
        0b10 => SAMPLE_RATES_V2[samplerate_index],
        _ => SAMPLE_RATES_V25[samplerate_index],
    };

    // Layer III: 144 (V1) or 72 (V2/2.5) slot-bytes per kbit at 1 Hz.
    let coefficient = if is_v1 { 144_000 } else { 72_000 };
    let length = (coefficient * bitrate_kbps / sample_rate) as usize + padding;
    Some(length)
}

fn is_sync(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0
}

/// Stateful assembler: encoder stdout bytes in, complete MP3 frames out.
#[derive(Debug, Default)]
pub struct Mp3Packetizer {
    pending: BytesMut,
    frames_emitted: u64,
    bytes_skipped: u64,
}

impl Mp3Packetizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every complete frame it unlocked, in
    /// input order. May return an empty vec when more bytes are needed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.put_slice(chunk);

        if self.pending.len() > MAX_PENDING_BYTES {
            let excess = self.pending.len() - MAX_PENDING_BYTES;
            self.pending.advance(excess);
            self.bytes_skipped += excess as u64;
            log::warn!(
                "[Packetizer] Pending buffer overflow, discarded {} oldest bytes",
                excess
            );
        }

        let mut frames = Vec::new();
        loop {
            // Hunt for the next sync position.
            let skip = self
                .pending
                .iter()
                .position(|&b| b == 0xFF)
                .unwrap_or(self.pending.len());
            if skip > 0 {
                self.pending.advance(skip);
                self.bytes_skipped += skip as u64;
            }
            if self.pending.len() < 4 {
                break;
            }

            let Some(length) = frame_length(&self.pending[..4]) else {
                // 0xFF that is not a frame start; skip it and rescan.
                self.pending.advance(1);
                self.bytes_skipped += 1;
                continue;
            };

            if self.pending.len() < length {
                break; // wait for the rest of this frame
            }

            // A plausible header followed by a non-sync byte where the next
            // frame should start is a false sync inside data; resync by one.
            if self.pending.len() >= length + 2 && !is_sync(&self.pending[length..length + 2]) {
                self.pending.advance(1);
                self.bytes_skipped += 1;
                continue;
            }

            frames.push(self.pending.split_to(length).freeze());
            self.frames_emitted += 1;
        }
        frames
    }

    #[must_use]
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    #[must_use]
    pub fn bytes_skipped(&self) -> u64 {
        self.bytes_skipped
    }

    /// Bytes currently buffered awaiting a complete frame.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a valid MPEG1 Layer III frame at 48 kHz.
    ///
    /// `bitrate_index` 9 = 128 kbit/s (384 bytes), 11 = 192 kbit/s (576).
    fn test_frame(bitrate_index: u8, padding: bool, fill: u8) -> Vec<u8> {
        let header = [
            0xFF,
            0xFB, // sync + MPEG1 + Layer III
            (bitrate_index << 4) | (1 << 2) | ((padding as u8) << 1),
            0x00,
        ];
        let bitrate = BITRATES_V1[bitrate_index as usize];
        let length = (144_000 * bitrate / 48_000) as usize + padding as usize;
        let mut frame = vec![fill; length];
        frame[..4].copy_from_slice(&header);
        frame
    }

    #[test]
    fn parses_frame_length_from_header() {
        let frame = test_frame(9, false, 0xAB);
        assert_eq!(frame_length(&frame[..4]), Some(384));

        let padded = test_frame(9, true, 0xAB);
        assert_eq!(frame_length(&padded[..4]), Some(385));
    }

    #[test]
    fn rejects_impossible_headers() {
        // Bad sync
        assert_eq!(frame_length(&[0xFE, 0xFB, 0x94, 0x00]), None);
        // Reserved version (bits 01)
        assert_eq!(frame_length(&[0xFF, 0xEB, 0x94, 0x00]), None);
        // Layer I (bits 11)
        assert_eq!(frame_length(&[0xFF, 0xFF, 0x94, 0x00]), None);
        // Free-format bitrate
        assert_eq!(frame_length(&[0xFF, 0xFB, 0x04, 0x00]), None);
        // Invalid bitrate index 15
        assert_eq!(frame_length(&[0xFF, 0xFB, 0xF4, 0x00]), None);
        // Reserved sample rate index 3
        assert_eq!(frame_length(&[0xFF, 0xFB, 0x9C, 0x00]), None);
    }

    #[test]
    fn emits_single_complete_frame() {
        let mut packetizer = Mp3Packetizer::new();
        let frame = test_frame(9, false, 1);
        let out = packetizer.feed(&frame);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &frame[..]);
    }

    #[test]
    fn reassembles_frame_split_across_feeds() {
        let mut packetizer = Mp3Packetizer::new();
        let frame = test_frame(9, false, 2);

        assert!(packetizer.feed(&frame[..100]).is_empty());
        assert!(packetizer.feed(&frame[100..300]).is_empty());
        let out = packetizer.feed(&frame[300..]);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &frame[..]);
    }

    #[test]
    fn emits_multiple_frames_from_one_chunk_in_order() {
        let mut packetizer = Mp3Packetizer::new();
        let a = test_frame(9, false, 1);
        let b = test_frame(9, false, 2);
        let mut input = a.clone();
        input.extend_from_slice(&b);

        let out = packetizer.feed(&input);
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][..], &a[..]);
        assert_eq!(&out[1][..], &b[..]);
    }

    #[test]
    fn handles_vbr_length_changes() {
        let mut packetizer = Mp3Packetizer::new();
        let a = test_frame(9, false, 1); // 384 bytes
        let b = test_frame(11, true, 2); // 577 bytes
        let c = test_frame(9, true, 3); // 385 bytes
        let mut input = a.clone();
        input.extend_from_slice(&b);
        input.extend_from_slice(&c);

        let out = packetizer.feed(&input);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].len(), 384);
        assert_eq!(out[1].len(), 577);
        assert_eq!(out[2].len(), 385);
    }

    #[test]
    fn skips_leading_garbage_to_first_sync() {
        let mut packetizer = Mp3Packetizer::new();
        let frame = test_frame(9, false, 4);
        let mut input = vec![0x00, 0x12, 0x34, 0x56];
        input.extend_from_slice(&frame);

        let out = packetizer.feed(&input);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &frame[..]);
        assert_eq!(packetizer.bytes_skipped(), 4);
    }

    #[test]
    fn false_sync_inside_data_is_stepped_over() {
        let mut packetizer = Mp3Packetizer::new();
        // A stray 0xFF followed by a byte that cannot complete a sync word.
        let mut input = vec![0xFF, 0x00];
        let frame = test_frame(9, false, 5);
        input.extend_from_slice(&frame);

        let out = packetizer.feed(&input);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &frame[..]);
    }

    #[test]
    fn plausible_header_without_followon_sync_resyncs() {
        let mut packetizer = Mp3Packetizer::new();
        // Craft data that parses as a 384-byte frame but is followed by
        // garbage instead of a next header, then a real frame.
        let fake = test_frame(9, false, 0);
        let real = test_frame(9, false, 6);
        let mut input = fake[..40].to_vec(); // truncated "frame" start
        input.extend_from_slice(&vec![0u8; 384 - 40]); // pad to full fake length
        input.extend_from_slice(&[0x11, 0x22]); // not a sync where one is due
        input.extend_from_slice(&real);

        let out = packetizer.feed(&input);
        assert_eq!(out.len(), 1, "only the real frame should be emitted");
        assert_eq!(&out[0][..], &real[..]);
    }

    #[test]
    fn bytes_are_emitted_exactly_once_and_in_order() {
        let mut packetizer = Mp3Packetizer::new();
        let frames: Vec<Vec<u8>> = (0..10u8).map(|i| test_frame(9, i % 2 == 0, i)).collect();
        let stream: Vec<u8> = frames.iter().flatten().copied().collect();

        // Feed in awkward 100-byte chunks.
        let mut out = Vec::new();
        for chunk in stream.chunks(100) {
            out.extend(packetizer.feed(chunk));
        }

        let reassembled: Vec<u8> = out.iter().flat_map(|f| f.iter().copied()).collect();
        assert_eq!(reassembled, stream);
        assert_eq!(packetizer.frames_emitted(), 10);
    }

    #[test]
    fn pending_buffer_is_bounded() {
        let mut packetizer = Mp3Packetizer::new();
        // 0xFF run: every byte scans as a sync candidate but never parses,
        // exercising both the reject path and the bound.
        for _ in 0..40 {
            packetizer.feed(&[0xFF; 4096]);
        }
        assert!(packetizer.pending_len() <= MAX_PENDING_BYTES);
    }
}
