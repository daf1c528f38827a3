//! Adaptive decode pacing: tower telemetry poll + PID controller.
//!
//! The controller nudges Clock A's per-frame sleep so the tower's ingest
//! ring hovers at a target fill ratio. It only ever adjusts pacing; the
//! segment's elapsed time is wall-clock and is computed nowhere near this
//! module. When the tower is unreachable the integral resets and pacing
//! falls back to the plain frame duration.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use retrowaves_core::logging::LogSampler;
use retrowaves_core::protocol_constants::{PID_MAX_SLEEP_MS, TELEMETRY_TIMEOUT_MS};

// Gain defaults, tuned against the 5-frame ring: full-scale error (±0.5)
// contributes ~10 ms proportionally and the integral walks the rest.
const DEFAULT_KP: f64 = 0.02;
const DEFAULT_KI: f64 = 0.01;
const DEFAULT_KD: f64 = 0.002;

/// Derivative kicks in only with a usable time base.
const MIN_DERIVATIVE_DT: Duration = Duration::from_millis(1);

/// One poll of `/tower/buffer`. `ratio` is `None` when the tower was
/// unreachable or answered garbage.
#[derive(Debug, Clone, Copy)]
pub struct TelemetrySample {
    pub seq: u64,
    pub ratio: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BufferTelemetry {
    ratio: f64,
}

/// Polls the tower buffer endpoint on a fixed cadence, publishing samples
/// through a watch channel. Readers pick up the newest sample when they
/// care; nothing blocks on the poll.
pub fn spawn_telemetry_poller(
    url: String,
    interval: Duration,
    shutdown: CancellationToken,
) -> watch::Receiver<TelemetrySample> {
    let (tx, rx) = watch::channel(TelemetrySample {
        seq: 0,
        ratio: None,
    });

    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_millis(TELEMETRY_TIMEOUT_MS))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                log::error!("[Telemetry] HTTP client construction failed: {e}");
                return;
            }
        };
        let failure_log = LogSampler::one_in(10);
        let mut seq = 0u64;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => return,
            }

            seq += 1;
            let ratio = match client.get(&url).send().await {
                Ok(response) => match response.json::<BufferTelemetry>().await {
                    Ok(telemetry) => Some(telemetry.ratio.clamp(0.0, 1.0)),
                    Err(e) => {
                        if failure_log.admit() {
                            log::warn!("[Telemetry] Malformed buffer response: {e}");
                        }
                        None
                    }
                },
                Err(e) => {
                    if failure_log.admit() {
                        log::warn!("[Telemetry] Poll failed: {e}");
                    }
                    None
                }
            };

            if tx.send(TelemetrySample { seq, ratio }).is_err() {
                return; // all readers gone
            }
        }
    });

    rx
}

/// The PID state. Lives on the playout thread; nothing else touches it.
#[derive(Debug)]
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    /// Goal fill ratio, clamped to [0.1, 0.9].
    target: f64,
    min_sleep: Duration,
    max_sleep: Duration,
    integral: f64,
    prev_error: Option<f64>,
    last_seq: u64,
    last_update: Option<Instant>,
    /// Latest additive adjustment in seconds.
    adjustment: f64,
}

impl PidController {
    pub fn new(target: f64) -> Self {
        Self {
            kp: DEFAULT_KP,
            ki: DEFAULT_KI,
            kd: DEFAULT_KD,
            target: target.clamp(0.1, 0.9),
            min_sleep: Duration::ZERO,
            max_sleep: Duration::from_millis(PID_MAX_SLEEP_MS),
            integral: 0.0,
            prev_error: None,
            last_seq: 0,
            last_update: None,
            adjustment: 0.0,
        }
    }

    /// Feeds the newest telemetry sample. Only an unseen `seq` updates the
    /// terms; the playout loop may call this every frame.
    pub fn observe(&mut self, sample: &TelemetrySample, now: Instant, base: Duration) {
        if sample.seq == self.last_seq {
            return;
        }
        self.last_seq = sample.seq;

        let Some(ratio) = sample.ratio else {
            // Tower unreachable: forget the accumulated history and run on
            // the plain clock until it comes back.
            self.integral = 0.0;
            self.prev_error = None;
            self.last_update = None;
            self.adjustment = 0.0;
            return;
        };

        let error = self.target - ratio;
        let dt = self
            .last_update
            .map(|t| now.duration_since(t))
            .unwrap_or(Duration::ZERO);

        let p = self.kp * error;
        let d = match self.prev_error {
            Some(prev) if dt >= MIN_DERIVATIVE_DT => {
                self.kd * (error - prev) / dt.as_secs_f64()
            }
            _ => 0.0,
        };

        // Anti-windup: accumulate only while the clamped output is not
        // saturated by the candidate accumulation.
        let candidate_integral = self.integral + error * dt.as_secs_f64();
        let candidate = p + self.ki * candidate_integral + d;
        let raw_sleep = base.as_secs_f64() + candidate;
        let saturated = raw_sleep < self.min_sleep.as_secs_f64()
            || raw_sleep > self.max_sleep.as_secs_f64();

        if !saturated {
            self.integral = candidate_integral;
            self.adjustment = candidate;
        } else {
            self.adjustment = p + self.ki * self.integral + d;
        }

        self.prev_error = Some(error);
        self.last_update = Some(now);
    }

    /// The sleep for the next frame: base plus the additive adjustment,
    /// clamped to the configured window.
    #[must_use]
    pub fn frame_sleep(&self, base: Duration) -> Duration {
        let seconds = (base.as_secs_f64() + self.adjustment)
            .clamp(self.min_sleep.as_secs_f64(), self.max_sleep.as_secs_f64());
        Duration::from_secs_f64(seconds)
    }

    #[cfg(test)]
    fn integral(&self) -> f64 {
        self.integral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrowaves_core::protocol_constants::FRAME_DURATION;

    fn sample(seq: u64, ratio: f64) -> TelemetrySample {
        TelemetrySample {
            seq,
            ratio: Some(ratio),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn low_buffer_slows_decode() {
        let mut pid = PidController::new(0.5);
        let now = Instant::now();
        pid.observe(&sample(1, 0.1), now, FRAME_DURATION);
        assert!(
            pid.frame_sleep(FRAME_DURATION) > FRAME_DURATION,
            "positive error must lengthen the sleep"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn high_buffer_speeds_decode() {
        let mut pid = PidController::new(0.5);
        let now = Instant::now();
        pid.observe(&sample(1, 0.9), now, FRAME_DURATION);
        assert!(pid.frame_sleep(FRAME_DURATION) < FRAME_DURATION);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_sample_seq_is_a_noop() {
        let mut pid = PidController::new(0.5);
        let now = Instant::now();
        pid.observe(&sample(1, 0.1), now, FRAME_DURATION);
        let first = pid.frame_sleep(FRAME_DURATION);
        // The playout loop re-feeds the same sample once per frame.
        for _ in 0..50 {
            pid.observe(&sample(1, 0.1), now, FRAME_DURATION);
        }
        assert_eq!(pid.frame_sleep(FRAME_DURATION), first);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_low_buffer_ramps_to_max_and_stops_winding() {
        let mut pid = PidController::new(0.5);
        let mut now = Instant::now();
        let mut last_sleep = Duration::ZERO;

        for seq in 1..=200 {
            now += Duration::from_millis(500);
            pid.observe(&sample(seq, 0.1), now, FRAME_DURATION);
            let sleep = pid.frame_sleep(FRAME_DURATION);
            assert!(sleep >= last_sleep, "sleep must ramp monotonically");
            last_sleep = sleep;
        }
        // The ramp parks within one integral step of the ceiling; the
        // conditional integration refuses the step that would cross it.
        assert!(last_sleep >= Duration::from_millis(95));
        assert!(last_sleep <= Duration::from_millis(PID_MAX_SLEEP_MS));

        // Once clamped, the integral must stop accumulating.
        let frozen = pid.integral();
        now += Duration::from_millis(500);
        pid.observe(&sample(201, 0.1), now, FRAME_DURATION);
        assert_eq!(pid.integral(), frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_tower_resets_to_base_clock() {
        let mut pid = PidController::new(0.5);
        let mut now = Instant::now();
        for seq in 1..=20 {
            now += Duration::from_millis(500);
            pid.observe(&sample(seq, 0.1), now, FRAME_DURATION);
        }
        assert!(pid.integral() > 0.0);

        pid.observe(
            &TelemetrySample {
                seq: 21,
                ratio: None,
            },
            now,
            FRAME_DURATION,
        );
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.frame_sleep(FRAME_DURATION), FRAME_DURATION);
    }

    #[tokio::test(start_paused = true)]
    async fn target_is_clamped_to_sane_band() {
        let pid = PidController::new(0.99);
        assert!((pid.target - 0.9).abs() < f64::EPSILON);
    }
}
