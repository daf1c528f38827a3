//! AudioPump: the transmit metronome (Clock B).
//!
//! A strict absolute-schedule tick at the PCM frame cadence. Every tick
//! produces exactly one 4096-byte frame from the source graph and hands it
//! to the encoder, non-blocking. The tick schedule is independent of
//! station liveness, ring depth, encoder health, and client count: the
//! graph is total and the sink never blocks, so nothing upstream or
//! downstream can stall the clock.
//!
//! If a tick lands late beyond a small jitter allowance (the host was
//! suspended, the process was stopped under a debugger), the schedule is
//! resynchronized to now and the violation is logged rather than replayed
//! as a burst of catch-up ticks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use retrowaves_core::protocol_constants::{frame_deadline, PCM_FRAME_BYTES};

use crate::encoder::EncoderManager;
use crate::source::SourceGraph;

/// Lateness beyond which the schedule resyncs instead of bursting.
const RESYNC_JITTER: Duration = Duration::from_millis(50);

/// Where pump frames go. A seam so the tick loop is testable without a
/// live encoder subprocess.
pub trait PcmSink: Send + Sync {
    fn write_pcm(&self, frame: Bytes);
}

impl PcmSink for EncoderManager {
    fn write_pcm(&self, frame: Bytes) {
        EncoderManager::write_pcm(self, frame);
    }
}

/// Tick counters for `/status`.
#[derive(Debug, Default)]
pub struct PumpStats {
    ticks: AtomicU64,
    resyncs: AtomicU64,
}

impl PumpStats {
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn resyncs(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }
}

/// The Clock B loop.
pub struct AudioPump<S: PcmSink> {
    graph: Arc<Mutex<SourceGraph>>,
    sink: Arc<S>,
    stats: Arc<PumpStats>,
    epoch: Instant,
    ticks: u64,
}

impl<S: PcmSink> AudioPump<S> {
    pub fn new(graph: Arc<Mutex<SourceGraph>>, sink: Arc<S>, stats: Arc<PumpStats>) -> Self {
        Self {
            graph,
            sink,
            stats,
            epoch: Instant::now(),
            ticks: 0,
        }
    }

    /// Sleeps to the next absolute deadline, then emits exactly one frame.
    pub async fn tick(&mut self) {
        let deadline = self.epoch + frame_deadline(self.ticks);
        tokio::time::sleep_until(deadline).await;

        let now = Instant::now();
        if now > deadline + RESYNC_JITTER {
            let late = now - deadline;
            log::warn!(
                "[Pump] Tick {} late by {:?}, resynchronizing schedule",
                self.ticks,
                late
            );
            self.epoch = now - frame_deadline(self.ticks);
            self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
        }

        let frame = self.graph.lock().next_frame(std::time::Instant::now());
        debug_assert_eq!(frame.len(), PCM_FRAME_BYTES);
        self.sink.write_pcm(frame);

        self.ticks += 1;
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs until shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        log::info!("[Pump] Transmit clock started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.tick() => {}
            }
        }
        log::info!(
            "[Pump] Transmit clock stopped after {} ticks",
            self.stats.ticks()
        );
    }
}
