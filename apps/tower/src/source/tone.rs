//! Fallback tone generator.
//!
//! A 440 Hz sine kept phase-continuous across frames, so mode flips into
//! and out of the tone never click. This and the silence source are the
//! only code in the process that synthesizes samples.

use std::f64::consts::TAU;

use bytes::{BufMut, Bytes, BytesMut};

use retrowaves_core::protocol_constants::{
    PCM_FRAME_BYTES, SAMPLES_PER_FRAME, SAMPLE_RATE, TONE_FREQUENCY_HZ,
};

/// Comfortable fallback level, ~-12 dBFS.
const TONE_AMPLITUDE: f64 = 8192.0;

/// Phase-accumulator sine source.
#[derive(Debug)]
pub struct ToneSource {
    phase: f64,
    step: f64,
}

impl ToneSource {
    pub fn new() -> Self {
        Self {
            phase: 0.0,
            step: TAU * TONE_FREQUENCY_HZ / SAMPLE_RATE as f64,
        }
    }

    /// Generates one frame, advancing the phase accumulator.
    pub fn next_frame(&mut self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PCM_FRAME_BYTES);
        for _ in 0..SAMPLES_PER_FRAME {
            let sample = (self.phase.sin() * TONE_AMPLITUDE) as i16;
            buf.put_i16_le(sample);
            buf.put_i16_le(sample);
            self.phase += self.step;
            if self.phase >= TAU {
                self.phase -= TAU;
            }
        }
        buf.freeze()
    }
}

impl Default for ToneSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(frame: &Bytes, index: usize) -> i16 {
        let offset = index * 4;
        i16::from_le_bytes([frame[offset], frame[offset + 1]])
    }

    #[test]
    fn frame_is_exactly_one_pcm_unit() {
        let mut tone = ToneSource::new();
        assert_eq!(tone.next_frame().len(), PCM_FRAME_BYTES);
    }

    #[test]
    fn channels_are_duplicated() {
        let mut tone = ToneSource::new();
        let frame = tone.next_frame();
        for i in (0..frame.len()).step_by(4) {
            assert_eq!(frame[i..i + 2], frame[i + 2..i + 4]);
        }
    }

    #[test]
    fn phase_is_continuous_across_frames() {
        let mut tone = ToneSource::new();
        let a = tone.next_frame();
        let b = tone.next_frame();

        // The jump from the last sample of one frame to the first of the
        // next must be no larger than the steepest slope of the sine:
        // amplitude · step, plus rounding.
        let last = sample_at(&a, SAMPLES_PER_FRAME - 1) as f64;
        let first = sample_at(&b, 0) as f64;
        let max_slope = TONE_AMPLITUDE * TAU * TONE_FREQUENCY_HZ / SAMPLE_RATE as f64;
        assert!(
            (first - last).abs() <= max_slope + 2.0,
            "discontinuity {} exceeds slope bound {}",
            (first - last).abs(),
            max_slope
        );
    }

    #[test]
    fn tone_has_expected_period() {
        let mut tone = ToneSource::new();
        let frame = tone.next_frame();

        // Count rising zero crossings; 1024 samples at 48 kHz spans
        // 21.33 ms, i.e. ~9.4 periods of 440 Hz.
        let mut crossings = 0;
        for i in 1..SAMPLES_PER_FRAME {
            if sample_at(&frame, i - 1) < 0 && sample_at(&frame, i) >= 0 {
                crossings += 1;
            }
        }
        assert!((9..=10).contains(&crossings), "got {crossings} crossings");
    }
}
