//! Encoder manager: the only surface higher layers see.
//!
//! Raw supervisor state never escapes; callers get an operational mode, a
//! PCM write entry point, and a subscription to the MP3 fan-out channel.
//! The channel doubles as the MP3 output buffer: it retains the most recent
//! frames (bounded, oldest dropped) and lives in the manager, not in the
//! supervisor, so an encoder restart cannot clear it.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use retrowaves_core::protocol_constants::MP3_BUFFER_FRAMES;

use crate::config::EncoderConfig;
use crate::encoder::supervisor::{EncoderSupervisor, SupervisorSettings, SupervisorState};

/// Externally visible encoder status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationalMode {
    Cold,
    Booting,
    Running,
    Restarting,
    Failed,
}

impl OperationalMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Booting => "booting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
        }
    }
}

/// Owns the supervisor and the MP3 output channel.
pub struct EncoderManager {
    supervisor: EncoderSupervisor,
    mp3_tx: broadcast::Sender<Bytes>,
    /// Standing receiver that pins frame history in the channel, so the
    /// buffer keeps its depth for restart tolerance even with no listeners.
    _monitor: Mutex<broadcast::Receiver<Bytes>>,
    stop_token: CancellationToken,
}

impl EncoderManager {
    /// Builds the manager and immediately requests the first encoder boot.
    pub fn start(config: &EncoderConfig, shutdown: &CancellationToken) -> Self {
        let (mp3_tx, monitor) = broadcast::channel(MP3_BUFFER_FRAMES);
        let stop_token = shutdown.child_token();
        let supervisor = EncoderSupervisor::spawn(
            SupervisorSettings::from_config(config),
            mp3_tx.clone(),
            stop_token.clone(),
        );
        supervisor.start();
        Self {
            supervisor,
            mp3_tx,
            _monitor: Mutex::new(monitor),
            stop_token,
        }
    }

    /// Hands one PCM frame toward the encoder's stdin, non-blocking.
    pub fn write_pcm(&self, frame: Bytes) {
        self.supervisor.shared().write_pcm(frame);
    }

    /// Subscribes to complete MP3 frames, starting from the next one
    /// produced after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.mp3_tx.subscribe()
    }

    #[must_use]
    pub fn operational_mode(&self) -> OperationalMode {
        match self.supervisor.shared().state() {
            SupervisorState::Cold => OperationalMode::Cold,
            SupervisorState::Booting => OperationalMode::Booting,
            SupervisorState::Running => OperationalMode::Running,
            SupervisorState::Restarting => OperationalMode::Restarting,
            SupervisorState::Failed => OperationalMode::Failed,
        }
    }

    /// MP3 frames currently retained in the output buffer.
    #[must_use]
    pub fn buffered_frames(&self) -> usize {
        self.mp3_tx.len()
    }

    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.supervisor.shared().restart_count()
    }

    #[must_use]
    pub fn frames_encoded(&self) -> u64 {
        self.supervisor.shared().frames_encoded()
    }

    /// Stops the supervisor and kills the child. Terminal.
    pub fn stop(&self) {
        self.stop_token.cancel();
    }
}
