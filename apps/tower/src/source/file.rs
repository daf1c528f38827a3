//! File fallback source.
//!
//! The configured WAV file is decoded into memory in one pass at startup;
//! after that, `next_frame` is pure array indexing with modulo arithmetic.
//! No I/O, locks, or subprocess calls ever happen on the frame path. EOF is
//! not a failure: playback loops, with a linear crossfade spliced into the
//! loop boundary at load time.

use std::path::Path;

use bytes::{Bytes, BytesMut};

use retrowaves_core::audio::{blend_loop_boundary, AudioFormat};
use retrowaves_core::protocol_constants::{
    BYTES_PER_SAMPLE, CHANNELS, FILE_LOOP_CROSSFADE_SAMPLES, FILE_SOURCE_MAX_SECS,
    PCM_FRAME_BYTES, SAMPLE_RATE,
};

use crate::error::{TowerError, TowerResult};

const STEREO_PAIR_BYTES: usize = CHANNELS as usize * BYTES_PER_SAMPLE;

/// In-memory looping PCM source.
#[derive(Debug)]
pub struct FileSource {
    /// Interleaved s16le PCM with the loop crossfade already applied.
    data: Vec<u8>,
    cursor: usize,
    path: String,
}

impl FileSource {
    /// Loads and validates a WAV file, preparing it for looped playback.
    ///
    /// Rejects anything that is not canonical-format PCM (48 kHz, stereo,
    /// 16-bit); the fallback path must never need resampling. Files longer
    /// than the cap are truncated, not rejected.
    pub fn load(path: &Path) -> TowerResult<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| TowerError::FallbackFile(format!("{}: {e}", path.display())))?;
        let (format, mut data) = parse_wav(&raw)
            .map_err(|e| TowerError::FallbackFile(format!("{}: {e}", path.display())))?;

        if !format.is_canonical() {
            return Err(TowerError::FallbackFile(format!(
                "{}: must be 48 kHz stereo 16-bit PCM, got {} Hz / {} ch / {}-bit",
                path.display(),
                format.sample_rate,
                format.channels,
                format.bits_per_sample
            )));
        }

        let max_bytes =
            FILE_SOURCE_MAX_SECS as usize * SAMPLE_RATE as usize * STEREO_PAIR_BYTES;
        if data.len() > max_bytes {
            log::warn!(
                "[FileSource] {} exceeds {} s cap, truncating",
                path.display(),
                FILE_SOURCE_MAX_SECS
            );
            data.truncate(max_bytes);
        }
        // Whole stereo pairs only.
        data.truncate(data.len() - data.len() % STEREO_PAIR_BYTES);

        if data.is_empty() {
            return Err(TowerError::FallbackFile(format!(
                "{}: no PCM data",
                path.display()
            )));
        }

        splice_loop_crossfade(&mut data);

        log::info!(
            "[FileSource] Loaded {} ({:.1} s)",
            path.display(),
            data.len() as f64 / (SAMPLE_RATE as usize * STEREO_PAIR_BYTES) as f64
        );

        Ok(Self {
            data,
            cursor: 0,
            path: path.display().to_string(),
        })
    }

    /// Builds a source directly from canonical PCM (tests, boot priming).
    #[cfg(test)]
    pub fn from_pcm(mut data: Vec<u8>) -> Self {
        data.truncate(data.len() - data.len() % STEREO_PAIR_BYTES);
        splice_loop_crossfade(&mut data);
        Self {
            data,
            cursor: 0,
            path: "<memory>".into(),
        }
    }

    /// Copies the next frame out of the preloaded buffer, wrapping at the
    /// loop point. Pure indexing; total unless the file was empty.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.data.is_empty() {
            return None;
        }

        let mut frame = BytesMut::with_capacity(PCM_FRAME_BYTES);
        let mut remaining = PCM_FRAME_BYTES;
        while remaining > 0 {
            let available = self.data.len() - self.cursor;
            let take = remaining.min(available);
            frame.extend_from_slice(&self.data[self.cursor..self.cursor + take]);
            self.cursor = (self.cursor + take) % self.data.len();
            remaining -= take;
        }
        Some(frame.freeze())
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Blends the file's tail into its head so the loop point is seamless, then
/// drops the tail region. Done once at load; the frame path never sees it.
fn splice_loop_crossfade(data: &mut Vec<u8>) {
    let fade_bytes = FILE_LOOP_CROSSFADE_SAMPLES * STEREO_PAIR_BYTES;
    if data.len() < fade_bytes * 2 {
        return; // too short to crossfade; loop hard
    }
    let tail = data.split_off(data.len() - fade_bytes);
    let head = &mut data[..fade_bytes];
    blend_loop_boundary(head, &tail);
}

/// Minimal RIFF/WAVE reader: finds `fmt ` and `data`, returns the format
/// and a copy of the PCM payload. Compressed formats are rejected.
fn parse_wav(raw: &[u8]) -> Result<(AudioFormat, Vec<u8>), String> {
    if raw.len() < 12 || &raw[0..4] != b"RIFF" || &raw[8..12] != b"WAVE" {
        return Err("not a RIFF/WAVE file".into());
    }

    let mut format: Option<AudioFormat> = None;
    let mut data: Option<Vec<u8>> = None;
    let mut offset = 12;

    while offset + 8 <= raw.len() {
        let chunk_id = &raw[offset..offset + 4];
        let chunk_len = u32::from_le_bytes([
            raw[offset + 4],
            raw[offset + 5],
            raw[offset + 6],
            raw[offset + 7],
        ]) as usize;
        let body_start = offset + 8;
        let body_end = (body_start + chunk_len).min(raw.len());
        let body = &raw[body_start..body_end];

        match chunk_id {
            b"fmt " => {
                if body.len() < 16 {
                    return Err("truncated fmt chunk".into());
                }
                let audio_format = u16::from_le_bytes([body[0], body[1]]);
                if audio_format != 1 {
                    return Err(format!("unsupported WAV format tag {audio_format} (want PCM)"));
                }
                format = Some(AudioFormat::new(
                    u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
                    u16::from_le_bytes([body[2], body[3]]),
                    u16::from_le_bytes([body[14], body[15]]),
                ));
            }
            b"data" => {
                data = Some(body.to_vec());
            }
            _ => {}
        }

        // Chunks are word-aligned; odd sizes carry a pad byte.
        offset = body_start + chunk_len + (chunk_len & 1);
    }

    match (format, data) {
        (Some(format), Some(data)) => Ok((format, data)),
        (None, _) => Err("missing fmt chunk".into()),
        (_, None) => Err("missing data chunk".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::io::Write;

    /// Builds a canonical-format WAV with the given number of sample pairs,
    /// every sample set to `value`.
    fn wav_bytes(pairs: usize, value: i16) -> Vec<u8> {
        let data_len = pairs * STEREO_PAIR_BYTES;
        let mut out = BytesMut::new();
        out.put_slice(b"RIFF");
        out.put_u32_le(36 + data_len as u32);
        out.put_slice(b"WAVE");
        out.put_slice(b"fmt ");
        out.put_u32_le(16);
        out.put_u16_le(1); // PCM
        out.put_u16_le(2);
        out.put_u32_le(48_000);
        out.put_u32_le(48_000 * 4);
        out.put_u16_le(4);
        out.put_u16_le(16);
        out.put_slice(b"data");
        out.put_u32_le(data_len as u32);
        for _ in 0..pairs * 2 {
            out.put_i16_le(value);
        }
        out.to_vec()
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[test]
    fn loads_canonical_wav() {
        let file = write_temp(&wav_bytes(48_000, 100));
        let source = FileSource::load(file.path()).unwrap();
        assert!(!source.data.is_empty());
    }

    #[test]
    fn rejects_wrong_sample_rate() {
        let mut bytes = wav_bytes(1_000, 0);
        // Patch sample rate field to 44100.
        bytes[24..28].copy_from_slice(&44_100u32.to_le_bytes());
        let file = write_temp(&bytes);
        assert!(FileSource::load(file.path()).is_err());
    }

    #[test]
    fn rejects_non_pcm() {
        let mut bytes = wav_bytes(1_000, 0);
        bytes[20..22].copy_from_slice(&3u16.to_le_bytes()); // IEEE float
        let file = write_temp(&bytes);
        assert!(FileSource::load(file.path()).is_err());
    }

    #[test]
    fn rejects_garbage() {
        let file = write_temp(b"definitely not audio");
        assert!(FileSource::load(file.path()).is_err());
    }

    #[test]
    fn frames_are_always_full_size() {
        // 3000 pairs is not a multiple of the 1024-pair frame, forcing a wrap.
        let mut source = FileSource::from_pcm(vec![7u8; 3000 * STEREO_PAIR_BYTES]);
        for _ in 0..10 {
            assert_eq!(source.next_frame().unwrap().len(), PCM_FRAME_BYTES);
        }
    }

    #[test]
    fn looping_wraps_to_start() {
        let pairs = 1536; // 1.5 frames, too short for the crossfade splice
        let mut data = Vec::new();
        for i in 0..pairs {
            let sample = (i % 100) as i16;
            data.extend_from_slice(&sample.to_le_bytes());
            data.extend_from_slice(&sample.to_le_bytes());
        }
        let mut source = FileSource::from_pcm(data.clone());

        let first = source.next_frame().unwrap();
        let second = source.next_frame().unwrap();

        // Second frame: 512 pairs of tail then wraps into the head again.
        let wrap_offset = 512 * STEREO_PAIR_BYTES;
        assert_eq!(&second[wrap_offset..wrap_offset + 8], &first[..8]);
    }

    #[test]
    fn crossfade_splice_blends_tail_into_head() {
        // Constant +10000 body with a -10000 tail region: after the splice
        // the head must start near -10000 (tail weight 1 at pair 0).
        let fade_pairs = FILE_LOOP_CROSSFADE_SAMPLES;
        let body_pairs = fade_pairs * 4;
        let mut data = Vec::new();
        for i in 0..body_pairs {
            let sample: i16 = if i >= body_pairs - fade_pairs {
                -10_000
            } else {
                10_000
            };
            data.extend_from_slice(&sample.to_le_bytes());
            data.extend_from_slice(&sample.to_le_bytes());
        }
        let source = FileSource::from_pcm(data);

        let first = i16::from_le_bytes([source.data[0], source.data[1]]);
        assert_eq!(first, -10_000);
        // Tail region was consumed by the splice.
        assert_eq!(source.data.len(), (body_pairs - fade_pairs) * STEREO_PAIR_BYTES);
    }
}
