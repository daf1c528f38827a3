//! Encoder subprocess supervisor.
//!
//! Owns the external MP3 encoder (s16le 48 kHz stereo PCM on stdin → MP3 on
//! stdout) and drives the COLD → BOOTING → RUNNING → RESTARTING → FAILED
//! state machine. All transitions happen on one actor task; drain tasks and
//! timers report observations into its event queue tagged with the child
//! generation they watched, so a stale report from a dead child can never
//! re-enter the machine. Two failures racing during RESTARTING therefore
//! coalesce into a single restart.
//!
//! The MP3 fan-out channel lives outside this module (in the manager) and
//! is deliberately not touched by restarts: listeners keep draining frames
//! produced before the crash while the replacement child boots.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use retrowaves_core::audio::silence_frame;
use retrowaves_core::protocol_constants::{
    ENCODER_BOOT_TIMEOUT_MS, ENCODER_FIRST_FRAME_WARN_MS,
};

use crate::config::EncoderConfig;
use crate::packetizer::Mp3Packetizer;

/// Depth of the PCM hand-off queue to the stdin writer (~170 ms). A full
/// queue means the encoder has stopped consuming; the pump's frame is
/// dropped and a restart is requested.
const PCM_WRITE_QUEUE: usize = 8;

/// Silence frames burst into a fresh child's stdin so its first MP3 frame
/// appears quickly. Injected below source selection; never Program PCM.
const BOOT_PRIME_FRAMES: usize = 4;

/// Supervisor states. Raw state never leaves this module; the manager maps
/// it to an operational mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Cold,
    Booting,
    Running,
    Restarting,
    Failed,
}

/// Everything the actor needs to spawn and judge a child.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub program: String,
    pub args: Vec<String>,
    pub boot_timeout: Duration,
    pub restart_max: u32,
    pub restart_backoff: Duration,
    pub frame_timeout: Duration,
}

impl SupervisorSettings {
    /// The production encoder invocation: ffmpeg reading raw PCM from
    /// stdin, writing an MP3 stream to stdout.
    pub fn from_config(config: &EncoderConfig) -> Self {
        Self {
            program: "ffmpeg".into(),
            args: vec![
                "-hide_banner".into(),
                "-loglevel".into(),
                "warning".into(),
                "-f".into(),
                "s16le".into(),
                "-ar".into(),
                "48000".into(),
                "-ac".into(),
                "2".into(),
                "-i".into(),
                "pipe:0".into(),
                "-f".into(),
                "mp3".into(),
                "-b:a".into(),
                format!("{}k", config.bitrate_kbps),
                "pipe:1".into(),
            ],
            boot_timeout: Duration::from_millis(ENCODER_BOOT_TIMEOUT_MS),
            restart_max: config.restart_max,
            restart_backoff: config.restart_backoff,
            frame_timeout: config.frame_timeout,
        }
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.restart_backoff.as_millis() as u64;
        let shifted = base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(8));
        Duration::from_millis(shifted.min(10_000))
    }
}

/// Observations posted to the actor, tagged with the generation of the
/// child they concern.
#[derive(Debug)]
enum SupervisorEvent {
    Start,
    FirstFrame { generation: u64 },
    ChildFailed { generation: u64, reason: String },
    BootTimeout { generation: u64 },
    Stall { generation: u64 },
    RespawnDue,
}

/// State shared between the actor, drain tasks, and external readers.
pub struct SupervisorShared {
    state: Mutex<SupervisorState>,
    generation: AtomicU64,
    restart_count: AtomicU32,
    frames_encoded: AtomicU64,
    last_frame_at: Mutex<Option<Instant>>,
    /// stdin hand-off to the current child; `None` while no child accepts PCM.
    pcm_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    mp3_tx: broadcast::Sender<Bytes>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    fail_reason: Mutex<Option<String>>,
}

impl SupervisorShared {
    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
    }

    pub fn fail_reason(&self) -> Option<String> {
        self.fail_reason.lock().clone()
    }

    /// Non-blocking PCM hand-off. A full queue or a missing child drops the
    /// frame; a full queue additionally requests a restart, because it means
    /// the encoder stopped consuming its stdin.
    pub fn write_pcm(&self, frame: Bytes) {
        let sender = self.pcm_tx.lock().clone();
        let Some(sender) = sender else {
            return; // no child; frame dropped by design
        };
        match sender.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let generation = self.generation.load(Ordering::Relaxed);
                let _ = self.events.send(SupervisorEvent::ChildFailed {
                    generation,
                    reason: "stdin backpressure".into(),
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Writer task already reported the broken pipe.
            }
        }
    }
}

/// Handle used by the manager: spawns the actor and exposes shared state.
pub struct EncoderSupervisor {
    shared: Arc<SupervisorShared>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl EncoderSupervisor {
    /// Creates the supervisor and its actor task. The state machine stays
    /// COLD until [`start`](Self::start) is called.
    pub fn spawn(
        settings: SupervisorSettings,
        mp3_tx: broadcast::Sender<Bytes>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SupervisorShared {
            state: Mutex::new(SupervisorState::Cold),
            generation: AtomicU64::new(0),
            restart_count: AtomicU32::new(0),
            frames_encoded: AtomicU64::new(0),
            last_frame_at: Mutex::new(None),
            pcm_tx: Mutex::new(None),
            mp3_tx,
            events: events_tx.clone(),
            fail_reason: Mutex::new(None),
        });

        tokio::spawn(run_actor(
            Arc::clone(&shared),
            settings.clone(),
            events_rx,
            shutdown.clone(),
        ));
        tokio::spawn(stall_watchdog(Arc::clone(&shared), settings, shutdown));

        Self {
            shared,
            events: events_tx,
        }
    }

    /// Requests the first child spawn (COLD → BOOTING).
    pub fn start(&self) {
        let _ = self.events.send(SupervisorEvent::Start);
    }

    pub fn shared(&self) -> &Arc<SupervisorShared> {
        &self.shared
    }

    /// Posts a synthetic failure report, as a drain task would.
    #[cfg(test)]
    fn inject_failure(&self, generation: u64, reason: &str) {
        let _ = self.events.send(SupervisorEvent::ChildFailed {
            generation,
            reason: reason.to_string(),
        });
    }
}

/// Periodically checks frame recency while RUNNING; a silent encoder is as
/// dead as a crashed one.
async fn stall_watchdog(
    shared: Arc<SupervisorShared>,
    settings: SupervisorSettings,
    shutdown: CancellationToken,
) {
    let interval = settings.frame_timeout / 2;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => return,
        }
        if shared.state() != SupervisorState::Running {
            continue;
        }
        let stalled = shared
            .last_frame_at
            .lock()
            .map(|t| t.elapsed() > settings.frame_timeout)
            .unwrap_or(false);
        if stalled {
            let generation = shared.generation.load(Ordering::Relaxed);
            let _ = shared
                .events
                .send(SupervisorEvent::Stall { generation });
        }
    }
}

/// The single place where state transitions happen.
async fn run_actor(
    shared: Arc<SupervisorShared>,
    settings: SupervisorSettings,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
    shutdown: CancellationToken,
) {
    let mut child: Option<Child> = None;
    let mut attempts: u32 = 0;
    let mut boot_started: Option<Instant> = None;

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        match event {
            SupervisorEvent::Start => {
                if shared.state() == SupervisorState::Cold {
                    spawn_child(&shared, &settings, &mut child, &mut boot_started).await;
                }
            }

            SupervisorEvent::FirstFrame { generation } => {
                if generation != shared.generation.load(Ordering::Relaxed) {
                    continue;
                }
                if shared.state() != SupervisorState::Booting {
                    continue;
                }
                let boot_ms = boot_started
                    .map(|t| t.elapsed().as_millis() as u64)
                    .unwrap_or(0);
                if boot_ms > ENCODER_FIRST_FRAME_WARN_MS {
                    log::warn!("[Encoder] Slow first frame: {boot_ms} ms after spawn");
                } else {
                    log::info!("[Encoder] First MP3 frame after {boot_ms} ms");
                }
                attempts = 0;
                *shared.state.lock() = SupervisorState::Running;
            }

            SupervisorEvent::RespawnDue => {
                if shared.state() == SupervisorState::Restarting {
                    shared.restart_count.fetch_add(1, Ordering::Relaxed);
                    spawn_child(&shared, &settings, &mut child, &mut boot_started).await;
                }
            }

            other => {
                // ChildFailed, BootTimeout, Stall: unified failure path.
                let (generation, reason, only_booting) = match other {
                    SupervisorEvent::ChildFailed { generation, reason } => {
                        (generation, reason, false)
                    }
                    SupervisorEvent::BootTimeout { generation } => {
                        (generation, "boot timeout".to_string(), true)
                    }
                    SupervisorEvent::Stall { generation } => {
                        (generation, "frame interval stall".to_string(), false)
                    }
                    _ => continue,
                };

                if generation != shared.generation.load(Ordering::Relaxed) {
                    continue; // stale report from a replaced child
                }
                let state = shared.state();
                if only_booting && state != SupervisorState::Booting {
                    continue; // the deadline was met; the timer fired anyway
                }
                if !matches!(state, SupervisorState::Booting | SupervisorState::Running) {
                    continue; // coalesced: a restart is already in flight
                }

                kill_child(&shared, &mut child).await;
                attempts += 1;

                if attempts > settings.restart_max {
                    log::error!(
                        "[Encoder] Restart budget exhausted after {} attempts, giving up: {reason}",
                        attempts - 1
                    );
                    *shared.fail_reason.lock() = Some(reason);
                    *shared.state.lock() = SupervisorState::Failed;
                    continue;
                }

                let backoff = settings.backoff_for_attempt(attempts);
                log::warn!(
                    "[Encoder] Child failed ({reason}); restart attempt {attempts}/{} in {:?}",
                    settings.restart_max,
                    backoff
                );
                *shared.state.lock() = SupervisorState::Restarting;

                let events = shared.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = events.send(SupervisorEvent::RespawnDue);
                });
            }
        }
    }

    kill_child(&shared, &mut child).await;
}

/// Spawns a child, wires its pipes, and moves to BOOTING.
///
/// Drain tasks start before any PCM is written so early stderr diagnostics
/// are never lost.
async fn spawn_child(
    shared: &Arc<SupervisorShared>,
    settings: &SupervisorSettings,
    child_slot: &mut Option<Child>,
    boot_started: &mut Option<Instant>,
) {
    let generation = shared.generation.fetch_add(1, Ordering::Relaxed) + 1;

    let spawned = Command::new(&settings.program)
        .args(&settings.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            log::error!("[Encoder] Spawn of '{}' failed: {e}", settings.program);
            let _ = shared.events.send(SupervisorEvent::ChildFailed {
                generation,
                reason: format!("spawn: {e}"),
            });
            *shared.state.lock() = SupervisorState::Booting;
            return;
        }
    };

    log::info!(
        "[Encoder] Spawned '{}' (generation {generation})",
        settings.program
    );

    // Drains first: stderr...
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::info!("[Encoder:stderr] {line}");
            }
        });
    }

    // ...then stdout through the packetizer into the fan-out channel.
    if let Some(stdout) = child.stdout.take() {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut packetizer = Mp3Packetizer::new();
            let mut chunk = vec![0u8; 8192];
            let mut first_frame_sent = false;
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => {
                        log::debug!(
                            "[Encoder] Generation {generation} stdout closed after {} frames ({} bytes skipped)",
                            packetizer.frames_emitted(),
                            packetizer.bytes_skipped()
                        );
                        let _ = shared.events.send(SupervisorEvent::ChildFailed {
                            generation,
                            reason: "stdout eof".into(),
                        });
                        return;
                    }
                    Ok(n) => {
                        for frame in packetizer.feed(&chunk[..n]) {
                            if !first_frame_sent {
                                first_frame_sent = true;
                                let _ = shared
                                    .events
                                    .send(SupervisorEvent::FirstFrame { generation });
                            }
                            *shared.last_frame_at.lock() = Some(Instant::now());
                            shared.frames_encoded.fetch_add(1, Ordering::Relaxed);
                            // Send only fails with zero receivers; the
                            // manager holds a receiver for the lifetime of
                            // the process.
                            let _ = shared.mp3_tx.send(frame);
                        }
                    }
                    Err(e) => {
                        let _ = shared.events.send(SupervisorEvent::ChildFailed {
                            generation,
                            reason: format!("stdout: {e}"),
                        });
                        return;
                    }
                }
            }
        });
    }

    // Stdin writer with a bounded hand-off queue.
    let (pcm_tx, mut pcm_rx) = mpsc::channel::<Bytes>(PCM_WRITE_QUEUE);
    if let Some(mut stdin) = child.stdin.take() {
        let events = shared.events.clone();
        tokio::spawn(async move {
            while let Some(frame) = pcm_rx.recv().await {
                if let Err(e) = stdin.write_all(&frame).await {
                    let _ = events.send(SupervisorEvent::ChildFailed {
                        generation,
                        reason: format!("stdin: {e}"),
                    });
                    return;
                }
            }
        });
    }

    // Boot priming: a short silence burst flushes the codec's analysis
    // window so the first real frame is not delayed by buffering.
    for _ in 0..BOOT_PRIME_FRAMES {
        let _ = pcm_tx.try_send(silence_frame());
    }

    *shared.pcm_tx.lock() = Some(pcm_tx);
    *child_slot = Some(child);
    *boot_started = Some(Instant::now());
    *shared.state.lock() = SupervisorState::Booting;

    // Boot deadline.
    let events = shared.events.clone();
    let boot_timeout = settings.boot_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(boot_timeout).await;
        let _ = events.send(SupervisorEvent::BootTimeout { generation });
    });
}

/// Tears the current child down and detaches its stdin path.
async fn kill_child(shared: &Arc<SupervisorShared>, child_slot: &mut Option<Child>) {
    *shared.pcm_tx.lock() = None;
    if let Some(mut child) = child_slot.take() {
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shell one-liner that emits exactly one valid 384-byte MP3 frame
    /// (MPEG1 Layer III, 128 kbit/s, 48 kHz) and then consumes stdin.
    const ONE_FRAME_SCRIPT: &str =
        "printf '\\377\\373\\224\\000'; head -c 380 /dev/zero; cat >/dev/null";

    fn shell_settings(script: &str) -> SupervisorSettings {
        SupervisorSettings {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            boot_timeout: Duration::from_secs(5),
            restart_max: 2,
            restart_backoff: Duration::from_millis(20),
            frame_timeout: Duration::from_secs(30),
        }
    }

    fn spawn(
        settings: SupervisorSettings,
    ) -> (EncoderSupervisor, broadcast::Receiver<Bytes>, CancellationToken) {
        let (tx, rx) = broadcast::channel(128);
        let shutdown = CancellationToken::new();
        let supervisor = EncoderSupervisor::spawn(settings, tx, shutdown.clone());
        (supervisor, rx, shutdown)
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..400 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 4 s");
    }

    #[test]
    fn backoff_ladder_doubles_and_caps() {
        let settings = shell_settings("true");
        assert_eq!(settings.backoff_for_attempt(1), Duration::from_millis(20));
        assert_eq!(settings.backoff_for_attempt(2), Duration::from_millis(40));
        assert_eq!(settings.backoff_for_attempt(3), Duration::from_millis(80));

        let mut production = shell_settings("true");
        production.restart_backoff = Duration::from_secs(1);
        assert_eq!(production.backoff_for_attempt(1), Duration::from_secs(1));
        assert_eq!(production.backoff_for_attempt(4), Duration::from_secs(8));
        // The 1-2-4-8 ladder caps at 10 s.
        assert_eq!(production.backoff_for_attempt(5), Duration::from_secs(10));
        assert_eq!(production.backoff_for_attempt(12), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn reaches_running_on_first_frame() {
        let (supervisor, mut rx, shutdown) = spawn(shell_settings(ONE_FRAME_SCRIPT));
        let shared = Arc::clone(supervisor.shared());

        assert_eq!(shared.state(), SupervisorState::Cold);
        supervisor.start();

        wait_until(|| shared.state() == SupervisorState::Running).await;
        assert_eq!(shared.frames_encoded(), 1);

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("channel open");
        assert_eq!(frame.len(), 384);
        assert_eq!(frame[0], 0xFF);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn crash_loop_exhausts_restarts_into_failed() {
        // A child that exits immediately: stdout EOF before any frame.
        let (supervisor, _rx, shutdown) = spawn(shell_settings("exit 0"));
        let shared = Arc::clone(supervisor.shared());

        supervisor.start();
        wait_until(|| shared.state() == SupervisorState::Failed).await;

        // restart_max respawns happened, then the machine latched FAILED.
        assert_eq!(shared.restart_count(), 2);
        assert!(shared.fail_reason().is_some());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn boot_timeout_triggers_restart() {
        // `cat` echoes the silence priming, which contains no MP3 sync, so
        // no first frame ever arrives and the boot deadline fires.
        let mut settings = shell_settings("cat");
        settings.boot_timeout = Duration::from_millis(100);
        let (supervisor, _rx, shutdown) = spawn(settings);
        let shared = Arc::clone(supervisor.shared());

        supervisor.start();
        wait_until(|| shared.restart_count() >= 1).await;

        shutdown.cancel();
    }

    #[tokio::test]
    async fn overlapping_failures_coalesce_into_one_restart() {
        let (supervisor, _rx, shutdown) = spawn(shell_settings(ONE_FRAME_SCRIPT));
        let shared = Arc::clone(supervisor.shared());

        supervisor.start();
        wait_until(|| shared.state() == SupervisorState::Running).await;

        // Two failure reports for the same child generation, back to back.
        let generation = shared.generation.load(Ordering::Relaxed);
        supervisor.inject_failure(generation, "first report");
        supervisor.inject_failure(generation, "second report");

        // Exactly one restart results, and it boots back to RUNNING.
        wait_until(|| shared.state() == SupervisorState::Running).await;
        assert_eq!(shared.restart_count(), 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn stale_generation_reports_are_ignored() {
        let (supervisor, _rx, shutdown) = spawn(shell_settings(ONE_FRAME_SCRIPT));
        let shared = Arc::clone(supervisor.shared());

        supervisor.start();
        wait_until(|| shared.state() == SupervisorState::Running).await;

        supervisor.inject_failure(0, "report from a child that never existed");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(shared.state(), SupervisorState::Running);
        assert_eq!(shared.restart_count(), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn write_pcm_without_child_drops_silently() {
        let (supervisor, _rx, shutdown) = spawn(shell_settings(ONE_FRAME_SCRIPT));
        supervisor.shared().write_pcm(silence_frame());
        shutdown.cancel();
    }
}
