//! HTTP route handlers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;

use retrowaves_core::events::StationEvent;

use crate::api::response::{api_ok, api_success};
use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::error::{TowerError, TowerResult};
use crate::source::SourceMode;

/// Content-Length used to suppress chunked transfer encoding on the
/// endless stream body. The connection never actually reaches this length;
/// it just signals "file-like" framing to picky renderers.
const STREAM_SIZE_MAX: u32 = u32::MAX;

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/stream", get(stream_audio))
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/tower/buffer", get(buffer_telemetry))
        .route("/tower/events/ingest", post(ingest_event))
        .route("/tower/events", get(ws_handler))
        .route("/control/source", post(control_source))
        // Status and event consumers are typically browser dashboards on
        // another origin.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener-facing
// ─────────────────────────────────────────────────────────────────────────────

/// The broadcast endpoint: a continuous MP3 body that starts at the next
/// complete frame and never ends from the server side unless the client is
/// evicted or the process shuts down.
async fn stream_audio(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> TowerResult<Response> {
    let frames = state.broadcaster.attach(
        state.manager.subscribe(),
        remote_addr.to_string(),
        state.shutdown.clone(),
    );

    let body = ReceiverStream::new(frames).map(Ok::<Bytes, Infallible>);

    Response::builder()
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header(header::CONTENT_LENGTH, STREAM_SIZE_MAX.to_string())
        .body(Body::from_stream(body))
        .map_err(|e| TowerError::Internal(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Health & Telemetry
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness with one failure condition: a FAILED encoder means the service
/// can no longer produce audio and should be restarted by the init system.
async fn health_check(State(state): State<AppState>) -> Response {
    let mode = state.manager.operational_mode();
    let healthy = mode != crate::encoder::OperationalMode::Failed;

    let body = json!({
        "status": if healthy { "ok" } else { "unhealthy" },
        "service": "retrowaves-tower",
        "encoder": mode,
    });

    if healthy {
        api_success(body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let source = state.graph.lock().status();
    api_success(json!({
        "encoder": state.manager.operational_mode(),
        "restart_count": state.manager.restart_count(),
        "frames_encoded": state.manager.frames_encoded(),
        "mp3_buffer_frames": state.manager.buffered_frames(),
        "pcm_ring": {
            "fill": state.ring.len(),
            "capacity": state.ring.capacity(),
            "ratio": state.ring.fill_ratio(),
            "overflow_count": state.ring.overflow_count(),
            "frames_pushed": state.ring.frames_pushed(),
            "frames_popped": state.ring.frames_popped(),
        },
        "ingest": {
            "writer_connected": state.ingest_stats.writer_connected(),
            "connections_total": state.ingest_stats.connections_total(),
            "frames_received": state.ingest_stats.frames_received(),
            "residue_bytes_discarded": state.ingest_stats.residue_bytes_discarded(),
        },
        "active_source": source.active_source,
        "primary_source": source.primary_source,
        "override_stack": source.override_stack,
        "program_admitted": source.program_admitted,
        "clients": state.broadcaster.client_count(),
        "clients_evicted": state.broadcaster.evicted_total(),
        "frames_delivered": state.broadcaster.frames_delivered(),
        "pump": {
            "ticks": state.pump_stats.ticks(),
            "resyncs": state.pump_stats.resyncs(),
        },
        "events_ingested": state.events.ingested_total(),
        "uptime_seconds": state.uptime.whole_seconds(),
    }))
}

/// The station's PID controller polls this; it must answer fast and never
/// block on anything the audio path holds.
async fn buffer_telemetry(State(state): State<AppState>) -> impl IntoResponse {
    api_success(json!({
        "fill": state.ring.len(),
        "capacity": state.ring.capacity(),
        "ratio": state.ring.fill_ratio(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Ingest
// ─────────────────────────────────────────────────────────────────────────────

/// Accepts one JSON station event. Validation is the schema itself: any
/// event type or metadata shape outside the closed set fails to parse and
/// is rejected with 400.
async fn ingest_event(
    State(state): State<AppState>,
    body: Bytes,
) -> TowerResult<impl IntoResponse> {
    let event: StationEvent =
        serde_json::from_slice(&body).map_err(|e| TowerError::InvalidEvent(e.to_string()))?;

    log::debug!("[Events] Ingested {}", event.event_type());
    let stamped = state.events.ingest(event);
    Ok(api_success(json!({ "event_id": stamped.event_id })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Source Control
// ─────────────────────────────────────────────────────────────────────────────

/// Exactly one action per request.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceControlRequest {
    mode: Option<SourceMode>,
    file_path: Option<PathBuf>,
    set_primary: Option<String>,
    push_override: Option<String>,
    pop_override: Option<bool>,
}

async fn control_source(State(state): State<AppState>, body: Bytes) -> TowerResult<Response> {
    let request: SourceControlRequest =
        serde_json::from_slice(&body).map_err(|e| TowerError::InvalidRequest(e.to_string()))?;

    let actions = [
        request.mode.is_some(),
        request.set_primary.is_some(),
        request.push_override.is_some(),
        request.pop_override.is_some(),
    ]
    .iter()
    .filter(|&&set| set)
    .count();
    if actions != 1 {
        return Err(TowerError::InvalidRequest(
            "exactly one of mode, set_primary, push_override, pop_override is required".into(),
        ));
    }
    if request.file_path.is_some() && request.mode != Some(SourceMode::File) {
        return Err(TowerError::InvalidRequest(
            "file_path is only valid with mode=file".into(),
        ));
    }

    if let Some(mode) = request.mode {
        if mode == SourceMode::File {
            let path = request.file_path.as_deref().ok_or_else(|| {
                TowerError::InvalidRequest("mode=file requires file_path".into())
            })?;
            // Decode the whole file before touching the graph so the tick
            // loop never waits on disk.
            let file = crate::source::FileSource::load(path)?;
            state.graph.lock().install_file(file)?;
        } else {
            state.graph.lock().set_mode(mode)?;
        }
        return Ok(api_ok().into_response());
    }

    let mut graph = state.graph.lock();
    if let Some(name) = request.set_primary {
        graph.set_primary(&name)?;
        return Ok(api_ok().into_response());
    }
    if let Some(name) = request.push_override {
        graph.push_override(&name)?;
        return Ok(api_ok().into_response());
    }
    match request.pop_override {
        Some(true) => {
            let popped = graph.pop_override()?;
            Ok(api_success(json!({ "ok": true, "popped": popped })).into_response())
        }
        Some(false) => Err(TowerError::InvalidRequest(
            "pop_override must be true".into(),
        )),
        None => unreachable!("exactly-one check above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_control_request_parses_each_variant() {
        let mode: SourceControlRequest =
            serde_json::from_value(json!({"mode": "file", "file_path": "/srv/f.wav"})).unwrap();
        assert_eq!(mode.mode, Some(SourceMode::File));

        let primary: SourceControlRequest =
            serde_json::from_value(json!({"set_primary": "tone"})).unwrap();
        assert_eq!(primary.set_primary.as_deref(), Some("tone"));

        let pop: SourceControlRequest =
            serde_json::from_value(json!({"pop_override": true})).unwrap();
        assert_eq!(pop.pop_override, Some(true));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result =
            serde_json::from_value::<SourceControlRequest>(json!({"set_primay": "tone"}));
        assert!(result.is_err());
    }
}
