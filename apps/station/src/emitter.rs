//! Edge-triggered event emission toward the tower.
//!
//! Emission must never block or slow the playout thread: `emit` stamps the
//! event and drops it into a bounded queue; a background task POSTs to the
//! tower's ingest endpoint. Delivery is best-effort: state remains
//! authoritative on the station, and the tower treats absence of events as
//! meaning nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use retrowaves_core::events::{EventPayload, StationEvent};
use retrowaves_core::logging::LogSampler;
use retrowaves_core::time::Uptime;

use crate::config::TowerEndpoint;

/// Pending events held while the tower is slow or away.
const EMIT_QUEUE_DEPTH: usize = 64;

/// Per-request delivery budget.
const EMIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Trait seam so the scheduler and playout can be tested without a tower.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, payload: EventPayload);
}

/// Discards everything. For tests and for running without a tower.
#[derive(Default)]
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit(&self, _payload: EventPayload) {}
}

/// Queues events for HTTP delivery to `/tower/events/ingest`.
pub struct HttpEventEmitter {
    uptime: Uptime,
    tx: mpsc::Sender<StationEvent>,
}

impl HttpEventEmitter {
    /// Builds the emitter and spawns its delivery task.
    pub fn start(
        endpoint: &TowerEndpoint,
        uptime: Uptime,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(EMIT_QUEUE_DEPTH);
        tokio::spawn(deliver_events(endpoint.events_url(), rx, shutdown));
        Arc::new(Self { uptime, tx })
    }
}

impl EventEmitter for HttpEventEmitter {
    fn emit(&self, payload: EventPayload) {
        let event = StationEvent::new(self.uptime.seconds(), payload);
        if let Err(e) = self.tx.try_send(event) {
            log::debug!("[Emitter] Event queue full, dropping: {e}");
        }
    }
}

async fn deliver_events(
    url: String,
    mut rx: mpsc::Receiver<StationEvent>,
    shutdown: CancellationToken,
) {
    let client = match reqwest::Client::builder().timeout(EMIT_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            log::error!("[Emitter] HTTP client construction failed: {e}");
            return;
        }
    };
    let failure_log = LogSampler::one_in(10);

    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let event_type = event.event_type();
        match client.post(&url).json(&event).send().await {
            Ok(response) if response.status().is_success() => {
                log::trace!("[Emitter] Delivered {event_type}");
            }
            Ok(response) => {
                if failure_log.admit() {
                    log::warn!(
                        "[Emitter] Tower rejected {event_type}: {}",
                        response.status()
                    );
                }
            }
            Err(e) => {
                if failure_log.admit() {
                    log::warn!("[Emitter] Delivery of {event_type} failed: {e}");
                }
            }
        }
    }
}
