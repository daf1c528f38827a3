//! Fixed protocol constants that should NOT be changed.
//!
//! These values define the PCM frame unit shared by both processes and the
//! timing contract of the two clocks. Changing any of them breaks the wire
//! format on the bridge socket or desynchronizes the metronomes.

use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// PCM Frame Unit
// ─────────────────────────────────────────────────────────────────────────────

/// Canonical sample rate (Hz) for all PCM crossing the bridge.
pub const SAMPLE_RATE: u32 = 48_000;

/// Channel count (stereo).
pub const CHANNELS: u16 = 2;

/// Bytes per sample (signed 16-bit little-endian).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Samples per channel in one atomic PCM frame.
pub const SAMPLES_PER_FRAME: usize = 1024;

/// Size of one atomic PCM frame in bytes.
///
/// 1024 samples × 2 channels × 2 bytes = 4096. This is the only unit that
/// crosses the bridge socket; partials are padded or dropped by the sender
/// and residue is discarded by the receiver.
pub const PCM_FRAME_BYTES: usize = SAMPLES_PER_FRAME * CHANNELS as usize * BYTES_PER_SAMPLE;

/// Nominal duration of one PCM frame (21.333… ms), rounded to whole ns.
///
/// Use [`frame_deadline`] for scheduling; repeated addition of this rounded
/// value drifts by ~1.4 ms/day, which the exact integer math avoids.
pub const FRAME_DURATION: Duration = Duration::from_nanos(21_333_333);

/// Exact offset of the n-th frame deadline from a clock epoch.
///
/// Computed as `n · 1024 · 10⁹ / 48000` ns in 128-bit arithmetic, so the
/// schedule stays drift-free for the life of the process.
#[must_use]
pub fn frame_deadline(frame_index: u64) -> Duration {
    let nanos =
        frame_index as u128 * SAMPLES_PER_FRAME as u128 * 1_000_000_000 / SAMPLE_RATE as u128;
    Duration::from_nanos(nanos as u64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tower Ingest & Source Selection
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of the PCM ingest ring buffer (frames). ~100 ms of audio.
pub const PCM_RING_CAPACITY: usize = 5;

/// Consecutive non-empty ring pops required before Program PCM is admitted
/// as the active source. Guards against a single stray frame flipping modes.
pub const PROGRAM_ADMISSION_FRAMES: u32 = 3;

/// Silence bridge after Program PCM is lost, before the priority walk
/// resumes with file/tone fallback (ms).
pub const GRACE_WINDOW_MS: u64 = 1_500;

/// Maximum depth of the source-graph override stack.
pub const OVERRIDE_STACK_CAP: usize = 32;

/// Loop-boundary crossfade length for file sources (samples per channel).
pub const FILE_LOOP_CROSSFADE_SAMPLES: usize = 2_048;

/// Cap on pre-decoded file source length (10 minutes of 48 kHz stereo).
pub const FILE_SOURCE_MAX_SECS: u64 = 600;

/// Fallback tone frequency (Hz).
pub const TONE_FREQUENCY_HZ: f64 = 440.0;

// ─────────────────────────────────────────────────────────────────────────────
// Encoder Supervision
// ─────────────────────────────────────────────────────────────────────────────

/// Hard cap from encoder spawn to first MP3 frame on stdout (ms).
pub const ENCODER_BOOT_TIMEOUT_MS: u64 = 1_500;

/// Soft warning threshold for the first frame after BOOTING (ms).
pub const ENCODER_FIRST_FRAME_WARN_MS: u64 = 500;

/// Default maximum encoder restart attempts before FAILED.
pub const ENCODER_RESTART_MAX: u32 = 5;

/// Exponential restart backoff ladder (seconds), capped at the last entry.
pub const ENCODER_RESTART_BACKOFF_SECS: [u64; 5] = [1, 2, 4, 8, 10];

/// Capacity of the MP3 output buffer (frames). Sized so listeners ride out
/// a full restart backoff step without a gap; drop-oldest on overflow.
pub const MP3_BUFFER_FRAMES: usize = 128;

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Surface
// ─────────────────────────────────────────────────────────────────────────────

/// Per-client write budget before a slow listener is evicted (ms).
pub const CLIENT_WRITE_BUDGET_MS: u64 = 250;

/// Bounded buffer of recently ingested station events.
pub const EVENT_BUFFER_CAPACITY: usize = 1_000;

/// HTTP timeout for the Station-side buffer telemetry poll (ms).
pub const TELEMETRY_TIMEOUT_MS: u64 = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Station Pacing
// ─────────────────────────────────────────────────────────────────────────────

/// Default interval between telemetry polls by the PID controller (ms).
pub const PID_POLL_INTERVAL_MS: u64 = 500;

/// Default Tower buffer fill-ratio target for PID and pre-fill.
pub const BUFFER_TARGET_RATIO: f64 = 0.5;

/// PID sleep-adjustment clamp ceiling (ms). Floor is zero.
pub const PID_MAX_SLEEP_MS: u64 = 100;

/// Pre-fill exit: wall-clock cap (seconds).
pub const PREFILL_TIMEOUT_SECS: u64 = 5;

/// Pre-fill exit: maximum unpaced frames (~10 s of audio).
pub const PREFILL_MAX_FRAMES: u32 = 470;

/// Default cap on DRAINING before the current segment is force-terminated
/// (seconds).
pub const DRAINING_MAX_WAIT_SECS: u64 = 300;
