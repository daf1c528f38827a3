//! PCM bridge ingest.
//!
//! Listens on the Unix domain socket, assembles exact 4096-byte frames
//! from whatever chunk sizes arrive, and pushes them into the ring buffer.
//! Trust-based: no validation beyond length. Multiple connections are
//! accepted but only the newest one is the writer; an older connection is
//! closed as soon as it is superseded.
//!
//! A socket error or EOF is end-of-stream for that connection: the
//! assembler's residue is discarded and ingest transitions to "no writer".
//! The tick loop notices via the emptying ring, never via ingest state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use retrowaves_core::frame::FrameAssembler;
use retrowaves_core::logging::LogSampler;

use crate::config::IngestConfig;
use crate::error::{TowerError, TowerResult};
use crate::ring::FrameRingBuffer;

/// Shared ingest counters, read by `/status`.
#[derive(Debug, Default)]
pub struct IngestStats {
    connected: AtomicBool,
    connections_total: AtomicU64,
    frames_received: AtomicU64,
    residue_bytes_discarded: AtomicU64,
}

impl IngestStats {
    #[must_use]
    pub fn writer_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn residue_bytes_discarded(&self) -> u64 {
        self.residue_bytes_discarded.load(Ordering::Relaxed)
    }
}

/// Binds the bridge socket, replacing any stale file from a previous run.
///
/// The socket is group-accessible (0660) so the station service user can
/// connect without the processes sharing a uid.
pub fn bind_socket(config: &IngestConfig) -> TowerResult<UnixListener> {
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            TowerError::Configuration(format!("creating {}: {e}", parent.display()))
        })?;
    }
    match std::fs::remove_file(&config.socket_path) {
        Ok(()) => log::debug!(
            "[Ingest] Removed stale socket {}",
            config.socket_path.display()
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(TowerError::Configuration(format!(
                "removing stale socket {}: {e}",
                config.socket_path.display()
            )))
        }
    }

    let listener = UnixListener::bind(&config.socket_path).map_err(|e| {
        TowerError::Configuration(format!("binding {}: {e}", config.socket_path.display()))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(
            &config.socket_path,
            std::fs::Permissions::from_mode(0o660),
        ) {
            log::warn!("[Ingest] Could not set socket permissions: {e}");
        }
    }

    log::info!("[Ingest] Listening on {}", config.socket_path.display());
    Ok(listener)
}

/// Accept loop. Runs until shutdown; each accepted connection gets its own
/// reader task tagged with a writer generation.
pub async fn run_ingest(
    listener: UnixListener,
    config: IngestConfig,
    ring: Arc<FrameRingBuffer>,
    stats: Arc<IngestStats>,
    shutdown: CancellationToken,
) {
    let current_writer = Arc::new(AtomicU64::new(0));

    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    log::warn!("[Ingest] Accept failed: {e}");
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };

        let generation = stats.connections_total.fetch_add(1, Ordering::Relaxed) + 1;
        let superseded = current_writer.swap(generation, Ordering::Relaxed);
        if superseded != 0 {
            log::info!("[Ingest] Writer #{generation} supersedes #{superseded}");
        } else {
            log::info!("[Ingest] Writer #{generation} connected");
        }
        stats.connected.store(true, Ordering::Relaxed);

        tokio::spawn(read_connection(
            stream,
            generation,
            config.read_chunk_size,
            Arc::clone(&ring),
            Arc::clone(&stats),
            Arc::clone(&current_writer),
            shutdown.clone(),
        ));
    }
}

/// Reads one connection to completion, pushing assembled frames while this
/// connection is still the current writer.
async fn read_connection(
    mut stream: UnixStream,
    generation: u64,
    chunk_size: usize,
    ring: Arc<FrameRingBuffer>,
    stats: Arc<IngestStats>,
    current_writer: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    let mut assembler = FrameAssembler::new();
    let mut chunk = vec![0u8; chunk_size];
    let overflow_log = LogSampler::one_in(10);

    let disconnect_reason = loop {
        if current_writer.load(Ordering::Relaxed) != generation {
            break "superseded";
        }

        let read = tokio::select! {
            read = stream.read(&mut chunk) => read,
            _ = shutdown.cancelled() => break "shutdown",
        };

        match read {
            Ok(0) => break "eof",
            Ok(n) => {
                for frame in assembler.feed(&chunk[..n]) {
                    stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    if !ring.push(frame) && overflow_log.admit() {
                        log::warn!(
                            "[Ingest] Ring full, dropped incoming frame (overflow #{})",
                            ring.overflow_count()
                        );
                    }
                }
            }
            Err(e) => {
                log::warn!("[Ingest] Writer #{generation} read error: {e}");
                break "error";
            }
        }
    };

    let residue = assembler.reset();
    stats
        .residue_bytes_discarded
        .fetch_add(residue as u64, Ordering::Relaxed);

    // Only the current writer's departure flips the connected flag; a
    // superseded reader exiting must not mark the new writer disconnected.
    let was_current = current_writer
        .compare_exchange(generation, 0, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok();
    if was_current {
        stats.connected.store(false, Ordering::Relaxed);
    }

    log::info!(
        "[Ingest] Writer #{generation} closed ({disconnect_reason}), {} frames total, {residue} residue bytes discarded",
        assembler.frames_assembled()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrowaves_core::protocol_constants::PCM_FRAME_BYTES;
    use std::path::PathBuf;
    use tokio::io::AsyncWriteExt;

    fn test_config(dir: &tempfile::TempDir) -> IngestConfig {
        IngestConfig {
            socket_path: dir.path().join("pcm.sock"),
            buffer_frames: 5,
            read_chunk_size: 1024,
        }
    }

    async fn start(
        config: &IngestConfig,
    ) -> (Arc<FrameRingBuffer>, Arc<IngestStats>, CancellationToken, PathBuf) {
        let ring = Arc::new(FrameRingBuffer::new(config.buffer_frames));
        let stats = Arc::new(IngestStats::default());
        let shutdown = CancellationToken::new();
        let listener = bind_socket(config).unwrap();
        tokio::spawn(run_ingest(
            listener,
            config.clone(),
            Arc::clone(&ring),
            Arc::clone(&stats),
            shutdown.clone(),
        ));
        (ring, stats, shutdown, config.socket_path.clone())
    }

    /// Polls until `predicate` holds or a short deadline passes.
    async fn wait_for(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn assembles_frames_from_fragmented_writes() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let (ring, stats, shutdown, path) = start(&config).await;

        let mut client = UnixStream::connect(&path).await.unwrap();
        let frame = vec![0xA5u8; PCM_FRAME_BYTES];
        client.write_all(&frame[..1000]).await.unwrap();
        client.flush().await.unwrap();
        client.write_all(&frame[1000..]).await.unwrap();
        client.flush().await.unwrap();

        wait_for(|| ring.len() == 1).await;
        assert_eq!(stats.frames_received(), 1);
        let got = ring.pop().unwrap();
        assert!(got.iter().all(|&b| b == 0xA5));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn residue_is_discarded_on_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let (ring, stats, shutdown, path) = start(&config).await;

        let mut client = UnixStream::connect(&path).await.unwrap();
        wait_for(|| stats.writer_connected()).await;

        // One full frame plus 100 stray bytes, then disconnect.
        client
            .write_all(&vec![1u8; PCM_FRAME_BYTES + 100])
            .await
            .unwrap();
        client.flush().await.unwrap();
        drop(client);

        wait_for(|| !stats.writer_connected()).await;
        assert_eq!(ring.len(), 1);
        assert_eq!(stats.residue_bytes_discarded(), 100);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn ring_overflow_drops_newest_frames() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let (ring, _stats, shutdown, path) = start(&config).await;

        let mut client = UnixStream::connect(&path).await.unwrap();
        // 8 frames into a 5-frame ring with no reader.
        for tag in 0..8u8 {
            client
                .write_all(&vec![tag; PCM_FRAME_BYTES])
                .await
                .unwrap();
        }
        client.flush().await.unwrap();

        wait_for(|| ring.overflow_count() == 3).await;
        assert_eq!(ring.len(), 5);
        // The oldest frames are the ones kept.
        assert_eq!(ring.pop().unwrap()[0], 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn newest_connection_supersedes_older_writer() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let (ring, stats, shutdown, path) = start(&config).await;

        let _first = UnixStream::connect(&path).await.unwrap();
        wait_for(|| stats.connections_total() == 1).await;

        let mut second = UnixStream::connect(&path).await.unwrap();
        wait_for(|| stats.connections_total() == 2).await;

        second
            .write_all(&vec![9u8; PCM_FRAME_BYTES])
            .await
            .unwrap();
        second.flush().await.unwrap();

        wait_for(|| ring.len() == 1).await;
        assert!(stats.writer_connected());

        shutdown.cancel();
    }
}
