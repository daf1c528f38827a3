//! PCM bridge sender.
//!
//! Non-blocking Unix-socket sink toward the tower. The decode clock calls
//! [`PcmBridge::send`] once per frame and is never allowed to wait: a
//! kernel buffer that will not take the bytes means the frame is dropped,
//! and a dead socket means frames are dropped until the background
//! reconnect task (1 s retry) restores the connection.
//!
//! Alignment invariant: only whole 4096-byte frames enter the socket. A
//! partial `try_write` is completed from a carry buffer before any new
//! frame, so the tower-side assembler never observes interleaved frames;
//! when a frame cannot even be queued it is dropped whole.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use retrowaves_core::logging::LogSampler;
use retrowaves_core::protocol_constants::PCM_FRAME_BYTES;

use crate::config::BridgeConfig;

/// Reconnect cadence while the tower socket is away.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Result of one frame hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued to the kernel (possibly partially; the rest is carried).
    Sent,
    /// Dropped: the socket would block and the carry buffer is occupied.
    Dropped,
    /// Dropped: no connection right now.
    Disconnected,
}

struct Connection {
    stream: UnixStream,
    /// Unwritten tail of a partially accepted frame.
    carry: BytesMut,
}

/// Shared bridge state.
pub struct PcmBridge {
    connection: Mutex<Option<Connection>>,
    connected: AtomicBool,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    error_log: LogSampler,
}

impl PcmBridge {
    /// Creates the bridge and its background connector.
    pub fn start(config: BridgeConfig, shutdown: CancellationToken) -> Arc<Self> {
        let bridge = Arc::new(Self {
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            error_log: LogSampler::one_in(10),
        });

        let connector = Arc::clone(&bridge);
        tokio::spawn(async move {
            loop {
                if !connector.connected.load(Ordering::Relaxed) {
                    match UnixStream::connect(&config.socket_path).await {
                        Ok(stream) => {
                            log::info!(
                                "[Bridge] Connected to {}",
                                config.socket_path.display()
                            );
                            *connector.connection.lock() = Some(Connection {
                                stream,
                                carry: BytesMut::new(),
                            });
                            connector.connected.store(true, Ordering::Relaxed);
                        }
                        Err(e) => {
                            if connector.error_log.admit() {
                                log::warn!(
                                    "[Bridge] Connect to {} failed: {e}",
                                    config.socket_path.display()
                                );
                            }
                        }
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        });

        bridge
    }

    /// Hands one frame toward the tower without blocking.
    pub fn send(&self, frame: Bytes) -> SendOutcome {
        debug_assert_eq!(frame.len(), PCM_FRAME_BYTES);

        let mut guard = self.connection.lock();
        let result = match guard.as_mut() {
            None => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return SendOutcome::Disconnected;
            }
            Some(connection) => write_frame(connection, &frame),
        };

        match result {
            Ok(SendOutcome::Sent) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Sent
            }
            Ok(outcome) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                outcome
            }
            Err(e) => {
                *guard = None;
                self.connected.store(false, Ordering::Relaxed);
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                if self.error_log.admit() {
                    log::warn!("[Bridge] Socket error, reconnecting in background: {e}");
                }
                SendOutcome::Disconnected
            }
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

/// Writes one frame, completing any carried tail first. A hard I/O error
/// bubbles up so the caller can tear the connection down.
fn write_frame(connection: &mut Connection, frame: &Bytes) -> Result<SendOutcome, std::io::Error> {
    // Finish any partially written frame first; byte order on the wire is
    // what keeps the receiver's assembler aligned.
    while !connection.carry.is_empty() {
        match connection.stream.try_write(&connection.carry) {
            Ok(n) => connection.carry.advance(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    if !connection.carry.is_empty() {
        // The kernel is still full; this frame is lost, the carried bytes
        // keep their place.
        return Ok(SendOutcome::Dropped);
    }

    let mut offset = 0;
    while offset < frame.len() {
        match connection.stream.try_write(&frame[offset..]) {
            Ok(n) => offset += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                connection.carry.extend_from_slice(&frame[offset..]);
                return Ok(SendOutcome::Sent);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(SendOutcome::Sent)
}
