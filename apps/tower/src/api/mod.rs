//! HTTP/WebSocket API layer.
//!
//! Handlers are thin: they read shared state and delegate. The one
//! exception is `/stream`, which wires a listener into the broadcast
//! fan-out and hands its frame queue to the HTTP body.

pub mod events;
pub mod http;
pub mod response;
pub mod ws;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use retrowaves_core::time::Uptime;

use crate::broadcast::Broadcaster;
use crate::encoder::EncoderManager;
use crate::ingest::IngestStats;
use crate::pump::PumpStats;
use crate::ring::FrameRingBuffer;
use crate::source::SourceGraph;

pub use events::EventHub;

/// Shared application state for the API layer.
#[derive(Clone)]
pub struct AppState {
    pub ring: Arc<FrameRingBuffer>,
    pub ingest_stats: Arc<IngestStats>,
    pub manager: Arc<EncoderManager>,
    pub graph: Arc<Mutex<SourceGraph>>,
    pub broadcaster: Arc<Broadcaster>,
    pub pump_stats: Arc<PumpStats>,
    pub events: Arc<EventHub>,
    pub uptime: Uptime,
    pub shutdown: CancellationToken,
}
