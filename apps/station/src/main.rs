//! Retrowaves Station - the DJ brain.
//!
//! Decides what to play, decodes it through an external codec, and emits a
//! paced stream of PCM frames over the bridge socket toward the tower. The
//! station owns all programme decisions and none of the transmission: if
//! the tower is away, frames drop and the show goes on.

mod api;
mod assets;
mod bridge;
mod config;
mod decoder;
mod emitter;
mod error;
mod intent;
mod persist;
mod pid;
mod planner;
mod playout;
mod scheduler;
mod state;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use retrowaves_core::time::Uptime;

use crate::api::ApiState;
use crate::assets::AssetIndex;
use crate::bridge::PcmBridge;
use crate::config::StationConfig;
use crate::emitter::{EventEmitter, HttpEventEmitter};
use crate::persist::PersistedState;
use crate::planner::{DjPlanner, RotationPlanner};
use crate::playout::PlayoutEngine;
use crate::scheduler::{DrainControl, Scheduler};
use crate::state::StationStateStore;

/// Retrowaves Station - programme scheduling and decode pacing.
#[derive(Parser, Debug)]
#[command(name = "retrowaves-station")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "STATION_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Retrowaves Station v{}", env!("CARGO_PKG_VERSION"));

    let config = StationConfig::from_env().context("Failed to load configuration")?;
    let uptime = Uptime::start();
    let shutdown = CancellationToken::new();
    let drain = Arc::new(DrainControl::default());

    // Asset index and rotation, restoring persisted history.
    let assets = AssetIndex::scan(config.assets.clone());
    assets.spawn_rescan_task(shutdown.clone());
    let planner = Arc::new(RotationPlanner::new(Arc::clone(&assets)));
    if let Some(persisted) = persist::load(&config.state_path) {
        log::info!(
            "[Main] Restored rotation history ({} entries, {} songs played before)",
            persisted.rotation_history.len(),
            persisted.songs_played
        );
        planner.restore_history(persisted.rotation_history);
    }

    // Outbound plumbing: bridge socket, event emitter, telemetry.
    let pcm_bridge = PcmBridge::start(config.bridge.clone(), shutdown.clone());
    let event_emitter: Arc<dyn EventEmitter> =
        HttpEventEmitter::start(&config.tower, uptime, shutdown.clone());
    let telemetry = pid::spawn_telemetry_poller(
        config.tower.buffer_url(),
        config.pacing.poll_interval,
        shutdown.clone(),
    );

    // Authoritative state and its HTTP surface.
    let state_store = StationStateStore::new(uptime);
    let queue_depth = Arc::new(AtomicUsize::new(0));
    let api_state = ApiState {
        store: Arc::clone(&state_store),
        drain: Arc::clone(&drain),
        queue_depth: Arc::clone(&queue_depth),
    };
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    log::info!("[Http] Listening on 0.0.0.0:{}", config.http_port);
    {
        let router = api::create_router(api_state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });
    }

    // Signals: the first SIGINT/SIGTERM enters DRAINING; repeats are
    // absorbed by the drain latch and change nothing.
    {
        let drain = Arc::clone(&drain);
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("sigterm handler");
                loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => log::info!("SIGINT received"),
                        _ = sigterm.recv() => log::info!("SIGTERM received"),
                    }
                    drain.begin();
                }
            }
            #[cfg(not(unix))]
            loop {
                let _ = tokio::signal::ctrl_c().await;
                drain.begin();
            }
        });
    }

    // The playout engine runs the whole lifecycle on this task.
    let scheduler = Scheduler::new(
        Arc::clone(&planner) as Arc<dyn DjPlanner>,
        Arc::clone(&assets),
        Arc::clone(&event_emitter),
        Arc::clone(&drain),
    );
    let engine = PlayoutEngine::new(
        &config,
        scheduler,
        Arc::clone(&pcm_bridge),
        event_emitter,
        Arc::clone(&state_store),
        Arc::clone(&drain),
        telemetry,
        Arc::clone(&queue_depth),
    );
    engine.run(shutdown.clone()).await;
    log::info!(
        "[Main] Bridge totals: {} frames sent, {} dropped",
        pcm_bridge.frames_sent(),
        pcm_bridge.frames_dropped()
    );

    // SHUTTING_DOWN: persist rotation state atomically, then stop the
    // background tasks.
    let persisted = PersistedState {
        rotation_history: planner.history(),
        songs_played: planner.history().len() as u64,
    };
    if let Err(e) = persist::save(&config.state_path, &persisted) {
        log::error!("[Main] {e}");
    }

    shutdown.cancel();
    log::info!("Station stopped");
    Ok(())
}
