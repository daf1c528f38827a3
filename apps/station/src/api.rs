//! Station HTTP surface: the authoritative state snapshot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::scheduler::DrainControl;
use crate::state::StationStateStore;

/// Shared state for the station API.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<StationStateStore>,
    pub drain: Arc<DrainControl>,
    pub queue_depth: Arc<AtomicUsize>,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/station/state", get(station_state))
        .with_state(state)
}

/// Coherent snapshot of the authoritative state. Readers never touch the
/// playout thread; consumers derive elapsed/remaining themselves from
/// `started_at` and `duration_sec`.
async fn station_state(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.store.snapshot();
    Json(json!({
        "station_state": snapshot.station_state,
        "since": snapshot.since,
        "current_audio": snapshot.current_audio,
        "terminal_latched": state.drain.terminal_latched(),
        "queue_depth": state.queue_depth.load(Ordering::Relaxed),
    }))
}
