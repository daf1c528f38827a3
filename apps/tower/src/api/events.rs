//! Station event ingest hub.
//!
//! One-way: Station POSTs edge-triggered events, the hub stamps each with a
//! receive time and an id, keeps a bounded recent-history buffer, and fans
//! the stamped event out to WebSocket subscribers. Tower never responds
//! with timing data.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use retrowaves_core::events::StationEvent;
use retrowaves_core::time::now_millis;

/// Events replayed to a WebSocket subscriber on connect, so a UI attaching
/// mid-broadcast sees context. Best-effort, bounded.
pub const WS_REPLAY_EVENTS: usize = 50;

/// A station event as seen by subscribers: the original payload plus the
/// tower's own receive stamp and id.
#[derive(Debug, Clone, Serialize)]
pub struct StampedEvent {
    pub event_id: String,
    /// Wall-clock receive time (Unix ms). The event's own `timestamp`
    /// stays monotonic-station time; the two are never mixed.
    pub tower_received_at: u64,
    #[serde(flatten)]
    pub event: StationEvent,
}

/// Bounded event history plus broadcast fan-out.
pub struct EventHub {
    recent: Mutex<VecDeque<StampedEvent>>,
    capacity: usize,
    tx: broadcast::Sender<StampedEvent>,
    ingested_total: AtomicU64,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            tx,
            ingested_total: AtomicU64::new(0),
        }
    }

    /// Stamps and stores an already-validated event, then fans it out.
    pub fn ingest(&self, event: StationEvent) -> StampedEvent {
        let stamped = StampedEvent {
            event_id: Uuid::new_v4().to_string(),
            tower_received_at: now_millis(),
            event,
        };

        {
            let mut recent = self.recent.lock();
            if recent.len() >= self.capacity {
                recent.pop_front();
            }
            recent.push_back(stamped.clone());
        }
        self.ingested_total.fetch_add(1, Ordering::Relaxed);

        // Send fails only with zero subscribers, which is fine.
        let _ = self.tx.send(stamped.clone());
        stamped
    }

    /// Subscribes to live events.
    pub fn subscribe(&self) -> broadcast::Receiver<StampedEvent> {
        self.tx.subscribe()
    }

    /// The most recent `n` events, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<StampedEvent> {
        let recent = self.recent.lock();
        recent
            .iter()
            .skip(recent.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn ingested_total(&self) -> u64 {
        self.ingested_total.load(Ordering::Relaxed)
    }
}
