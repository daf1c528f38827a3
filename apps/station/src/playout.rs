//! Playout engine: one segment at a time, paced by Clock A.
//!
//! The decode metronome is wall-clock paced: after each frame the loop
//! sleeps to `next_frame_time += FRAME_DURATION` (plus the PID's additive
//! adjustment when enabled). Segment elapsed time is always wall-clock,
//! `now - segment_start`, and is never derived from frame counts, decoder
//! speed, or anything the PID touches.
//!
//! The scheduler's THINK runs inside `on_segment_started` and DO inside
//! `on_segment_finished`, both synchronously on this task; there is
//! exactly one current segment and one live decoder at any time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use retrowaves_core::events::EventPayload;
use retrowaves_core::protocol_constants::{
    FRAME_DURATION, PREFILL_MAX_FRAMES,
};

use crate::bridge::{PcmBridge, SendOutcome};
use crate::config::{PacingConfig, StationConfig};
use crate::decoder::Decoder;
use crate::emitter::EventEmitter;
use crate::intent::{AudioEvent, SegmentKind};
use crate::pid::{PidController, TelemetrySample};
use crate::scheduler::{DrainControl, Scheduler};
use crate::state::{CurrentAudio, StationState, StationStateStore};

/// Clock-A lateness beyond which a skew event is emitted and the schedule
/// catches up instead of bursting.
const SKEW_TOLERANCE: std::time::Duration = std::time::Duration::from_millis(250);

/// Idle wait while in FALLBACK before re-planning.
const FALLBACK_RETRY: std::time::Duration = std::time::Duration::from_secs(1);

/// The single owner of the playout queue and the live decoder.
pub struct PlayoutEngine {
    pacing: PacingConfig,
    draining_max_wait: std::time::Duration,
    scheduler: Scheduler,
    bridge: Arc<PcmBridge>,
    emitter: Arc<dyn EventEmitter>,
    state: Arc<StationStateStore>,
    drain: Arc<DrainControl>,
    telemetry: watch::Receiver<TelemetrySample>,
    pid: Option<PidController>,
    queue: VecDeque<AudioEvent>,
    queue_depth: Arc<AtomicUsize>,
}

impl PlayoutEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &StationConfig,
        scheduler: Scheduler,
        bridge: Arc<PcmBridge>,
        emitter: Arc<dyn EventEmitter>,
        state: Arc<StationStateStore>,
        drain: Arc<DrainControl>,
        telemetry: watch::Receiver<TelemetrySample>,
        queue_depth: Arc<AtomicUsize>,
    ) -> Self {
        let pid = config
            .pacing
            .pid_enabled
            .then(|| PidController::new(config.pacing.prefill_target_ratio));
        Self {
            pacing: config.pacing.clone(),
            draining_max_wait: config.draining_max_wait,
            scheduler,
            bridge,
            emitter,
            state,
            drain,
            telemetry,
            pid,
            queue: VecDeque::new(),
            queue_depth,
        }
    }

    /// Runs the station lifecycle to completion.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.emitter.emit(EventPayload::StationStartup {});

        // Startup: the announcement is injected directly as the active
        // segment; it reaches the queue through no intent.
        match self.scheduler.startup_announcement() {
            Some(announcement) => self.play_segment(&announcement, &shutdown).await,
            None => {
                log::info!("[Playout] No startup announcement, priming rotation directly");
                self.scheduler.prime(&mut self.queue);
            }
        }

        while !self.scheduler.finished() && !shutdown.is_cancelled() {
            self.queue_depth.store(self.queue.len(), Ordering::Relaxed);
            match self.queue.pop_front() {
                Some(event) => self.play_segment(&event, &shutdown).await,
                None => {
                    if self.drain.is_draining() {
                        // Nothing left to play and the lifecycle is ending.
                        break;
                    }
                    self.state
                        .set(StationState::Fallback, Some(CurrentAudio::fallback()));
                    tokio::select! {
                        _ = tokio::time::sleep(FALLBACK_RETRY) => {}
                        _ = shutdown.cancelled() => break,
                    }
                    self.scheduler.replan(&mut self.queue);
                }
            }
        }

        self.state
            .set(StationState::ShuttingDown, Some(CurrentAudio::fallback()));
        self.emitter.emit(EventPayload::StationShutdown {});
        log::info!("[Playout] Lifecycle complete");
    }

    /// Plays one segment start to finish: state, events, THINK, pre-fill,
    /// the paced decode loop, teardown, DO.
    async fn play_segment(&mut self, event: &AudioEvent, shutdown: &CancellationToken) {
        let segment_start = Instant::now();
        self.announce_on_air(event);
        self.scheduler.on_segment_started(event);

        let decoder = Decoder::spawn(event.path.as_path(), event.gain_db, event.start_offset_ms);
        match decoder {
            Ok(mut decoder) => {
                let frames = self.drive_decoder(&mut decoder, shutdown).await;
                decoder.shutdown().await;
                log::info!(
                    "[Playout] Segment finished: {} ({} frames, {:.1}s wall)",
                    event.path.display(),
                    frames,
                    segment_start.elapsed().as_secs_f64()
                );
            }
            Err(e) => {
                // THINK validated this path against the index; failing to
                // even spawn for it is a broken contract, not bad luck.
                let violation = crate::error::StationError::Contract(format!(
                    "decoder spawn failed for validated path {}: {e}",
                    event.path.display()
                ));
                log::error!("[Playout] {violation}");
                self.state.set(StationState::Error, None);
            }
        }

        self.scheduler.on_segment_finished(event, &mut self.queue);
        self.queue_depth.store(self.queue.len(), Ordering::Relaxed);
    }

    fn announce_on_air(&self, event: &AudioEvent) {
        let current = CurrentAudio::for_event(event);
        match event.kind {
            SegmentKind::Song => {
                self.state.set(StationState::SongPlaying, Some(current));
                self.emitter.emit(EventPayload::SongPlaying {
                    file_path: event.path.display().to_string(),
                    title: event.metadata.title.clone(),
                    artist: event.metadata.artist.clone(),
                    album: event.metadata.album.clone(),
                    duration_sec: event.metadata.duration_sec,
                });
            }
            SegmentKind::Segment {
                class,
                role,
                production,
            } => {
                self.state.set(StationState::DjTalking, Some(current));
                self.emitter.emit(EventPayload::SegmentPlaying {
                    file_path: event.path.display().to_string(),
                    segment_class: class,
                    segment_role: role,
                    production_type: production,
                });
            }
        }
    }

    /// Pre-fill, then the Clock-A paced loop, until end of stream or a
    /// force-terminate condition.
    ///
    /// Returns the number of frames sent.
    async fn drive_decoder(&mut self, decoder: &mut Decoder, shutdown: &CancellationToken) -> u64 {
        let mut frames: u64 = 0;

        // Pre-fill: decode unpaced until the tower buffer reaches target.
        // The wall-clock segment start is untouched; this only front-loads
        // frames the paced loop would have sent anyway.
        if self.pacing.prefill_enabled && !self.drain.terminal_latched() {
            let deadline = Instant::now() + self.pacing.prefill_timeout;
            let mut sent: u32 = 0;
            loop {
                let ratio = self.telemetry.borrow().ratio;
                match ratio {
                    // Unknown tower state: pre-filling blind risks overflow.
                    None => break,
                    Some(r) if r >= self.pacing.prefill_target_ratio => break,
                    Some(_) => {}
                }
                if Instant::now() >= deadline || sent >= PREFILL_MAX_FRAMES {
                    break;
                }
                match decoder.read_frame().await {
                    Ok(Some(frame)) => {
                        self.bridge.send(frame);
                        sent += 1;
                        frames += 1;
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            if sent > 0 {
                log::debug!("[Playout] Pre-fill sent {sent} frames");
            }
        }

        // Paced loop: Clock A.
        let mut next_frame_time = tokio::time::Instant::now();
        let mut overflow_reported = false;
        let mut skew_reported = false;
        let mut underflow_reported = false;

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            // DRAINING overstayed its welcome: force-terminate the segment.
            if let Some(since) = self.drain.draining_since() {
                if since.elapsed() > self.draining_max_wait {
                    log::warn!(
                        "[Playout] DRAINING exceeded {:?}, force-terminating segment",
                        self.draining_max_wait
                    );
                    break;
                }
            }

            let read_started = Instant::now();
            let frame = match decoder.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("[Playout] Decode error, ending segment: {e}");
                    break;
                }
            };
            // A read that outruns the cadence means the decoder starved
            // the clock; the tower's ring is draining meanwhile.
            if read_started.elapsed() > FRAME_DURATION * 2 {
                if !underflow_reported {
                    self.emitter.emit(EventPayload::StationUnderflow {
                        dropped_frames: 1,
                    });
                    underflow_reported = true;
                }
            } else {
                underflow_reported = false;
            }

            match self.bridge.send(frame) {
                SendOutcome::Sent => overflow_reported = false,
                SendOutcome::Dropped | SendOutcome::Disconnected => {
                    if !overflow_reported {
                        self.emitter.emit(EventPayload::StationOverflow {
                            dropped_frames: self.bridge.frames_dropped(),
                        });
                        overflow_reported = true;
                    }
                }
            }
            frames += 1;

            // Clock A advance: base cadence plus the PID's adjustment.
            let sleep = match self.pid.as_mut() {
                Some(pid) => {
                    let sample = *self.telemetry.borrow();
                    pid.observe(&sample, tokio::time::Instant::now(), FRAME_DURATION);
                    pid.frame_sleep(FRAME_DURATION)
                }
                None => FRAME_DURATION,
            };
            next_frame_time += sleep;

            let now = tokio::time::Instant::now();
            if next_frame_time > now {
                tokio::time::sleep_until(next_frame_time).await;
            } else if now - next_frame_time > SKEW_TOLERANCE {
                // The decoder (or the host) fell badly behind; catch the
                // schedule up rather than bursting frames at the tower.
                if !skew_reported {
                    self.emitter.emit(EventPayload::DecodeClockSkew {
                        skew_ms: (now - next_frame_time).as_secs_f64() * 1000.0,
                    });
                    skew_reported = true;
                }
                next_frame_time = now;
            }
        }

        frames
    }
}
