//! Listener fan-out.
//!
//! Single producer (the encoder's MP3 channel), many consumers (HTTP
//! clients). Each accepted client gets its own forwarder task and a bounded
//! hand-off queue sized to the configured write budget; a client that stops
//! reading fills its queue and is evicted without ever delaying another
//! client or the producer. New clients receive audio starting from the next
//! complete MP3 frame after acceptance, with no backfill.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Nominal MP3 frame duration at 48 kHz (1152 samples), used to convert the
/// write budget into a queue depth.
const MP3_FRAME_MS: u64 = 24;

/// Registry entry for one connected listener.
#[derive(Debug)]
struct ClientEntry {
    addr: String,
    connected_at: Instant,
}

/// Why a forwarder ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    Disconnected,
    Evicted,
    Lagged,
    Shutdown,
}

/// Thread-safe listener registry plus per-client forwarding.
pub struct Broadcaster {
    clients: DashMap<u64, ClientEntry>,
    next_id: AtomicU64,
    evicted_total: AtomicU64,
    frames_delivered: AtomicU64,
    /// Per-client queue depth derived from the write budget.
    budget_frames: usize,
}

impl Broadcaster {
    pub fn new(client_timeout: Duration) -> Self {
        let budget_frames = (client_timeout.as_millis() as u64 / MP3_FRAME_MS).max(1) as usize;
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            budget_frames,
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }

    /// Registers a listener and spawns its forwarder task.
    ///
    /// Returns the bounded frame queue the HTTP body reads from. Dropping
    /// the returned receiver (client hung up) stops the forwarder; the
    /// forwarder dropping its sender (eviction) ends the HTTP body.
    pub fn attach(
        self: &Arc<Self>,
        mut frames: broadcast::Receiver<Bytes>,
        addr: String,
        shutdown: CancellationToken,
    ) -> mpsc::Receiver<Bytes> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let connected_at = Instant::now();
        self.clients.insert(
            id,
            ClientEntry {
                addr: addr.clone(),
                connected_at,
            },
        );
        log::info!(
            "[Broadcast] Client #{id} connected: {addr} ({} total)",
            self.clients.len()
        );

        let (tx, rx) = mpsc::channel::<Bytes>(self.budget_frames);
        let broadcaster = Arc::clone(self);

        tokio::spawn(async move {
            let mut sent: u64 = 0;
            let departure = loop {
                let received = tokio::select! {
                    received = frames.recv() => received,
                    _ = shutdown.cancelled() => break Departure::Shutdown,
                };
                match received {
                    Ok(frame) => match tx.try_send(frame) {
                        Ok(()) => {
                            sent += 1;
                            broadcaster.frames_delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // The client has not drained a full write budget
                            // of frames; it is too slow to keep.
                            break Departure::Evicted;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            break Departure::Disconnected;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[Broadcast] Client #{id} lagged by {n} frames");
                        break Departure::Lagged;
                    }
                    Err(broadcast::error::RecvError::Closed) => break Departure::Shutdown,
                }
            };

            broadcaster.clients.remove(&id);
            if matches!(departure, Departure::Evicted | Departure::Lagged) {
                broadcaster.evicted_total.fetch_add(1, Ordering::Relaxed);
            }
            log::info!(
                "[Broadcast] Client #{id} {}: {addr}, frames_sent={sent}, duration={:.1}s ({} remaining)",
                match departure {
                    Departure::Disconnected => "disconnected",
                    Departure::Evicted => "evicted (write budget exceeded)",
                    Departure::Lagged => "evicted (lagged)",
                    Departure::Shutdown => "closed (shutdown)",
                },
                connected_at.elapsed().as_secs_f32(),
                broadcaster.clients.len()
            );
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 384])
    }

    fn test_broadcaster() -> (Arc<Broadcaster>, broadcast::Sender<Bytes>, CancellationToken) {
        let broadcaster = Arc::new(Broadcaster::new(Duration::from_millis(250)));
        let (tx, _) = broadcast::channel(128);
        (broadcaster, tx, CancellationToken::new())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn budget_is_derived_from_timeout() {
        let broadcaster = Broadcaster::new(Duration::from_millis(250));
        assert_eq!(broadcaster.budget_frames, 10);
    }

    #[tokio::test]
    async fn client_receives_frames_in_order_from_join_point() {
        let (broadcaster, tx, shutdown) = test_broadcaster();

        // Frames sent before the client joins are not replayed.
        let _ = tx.send(frame(0));

        let mut rx = broadcaster.attach(tx.subscribe(), "test:1".into(), shutdown.clone());
        for tag in 1..=3 {
            tx.send(frame(tag)).unwrap();
        }

        for expected in 1..=3u8 {
            let got = rx.recv().await.unwrap();
            assert_eq!(got[0], expected);
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn stalled_client_is_evicted_without_affecting_others() {
        let (broadcaster, tx, shutdown) = test_broadcaster();

        // The stalled client never reads from its queue.
        let stalled_rx = broadcaster.attach(tx.subscribe(), "stalled:1".into(), shutdown.clone());
        let mut healthy_rx = broadcaster.attach(tx.subscribe(), "healthy:1".into(), shutdown.clone());
        settle().await;
        assert_eq!(broadcaster.client_count(), 2);

        // Overrun the stalled client's 10-frame budget while the healthy
        // client keeps draining.
        for tag in 0..12u8 {
            tx.send(frame(tag)).unwrap();
            let got = healthy_rx.recv().await.unwrap();
            assert_eq!(got[0], tag);
        }
        settle().await;

        assert_eq!(broadcaster.client_count(), 1);
        assert_eq!(broadcaster.evicted_total(), 1);

        drop(stalled_rx);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn disconnecting_client_is_removed_quietly() {
        let (broadcaster, tx, shutdown) = test_broadcaster();

        let rx = broadcaster.attach(tx.subscribe(), "fleeting:1".into(), shutdown.clone());
        settle().await;
        assert_eq!(broadcaster.client_count(), 1);

        drop(rx);
        // The forwarder only notices on the next frame.
        tx.send(frame(0)).unwrap();
        settle().await;

        assert_eq!(broadcaster.client_count(), 0);
        assert_eq!(broadcaster.evicted_total(), 0);
        shutdown.cancel();
    }
}
