//! Retrowaves Tower - the dumb transmitter.
//!
//! Ingests PCM from the station over a Unix socket, re-encodes it to MP3
//! through a supervised external codec, and fans the byte stream out to
//! HTTP listeners. When PCM is absent it substitutes fallback audio so
//! listeners never hear dead air. The tower has no opinions about what
//! plays; it only refuses to stop transmitting.

mod api;
mod broadcast;
mod config;
mod encoder;
mod error;
mod ingest;
mod packetizer;
mod pump;
mod ring;
mod source;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use retrowaves_core::protocol_constants::EVENT_BUFFER_CAPACITY;
use retrowaves_core::time::Uptime;

use crate::api::{AppState, EventHub};
use crate::broadcast::Broadcaster;
use crate::config::TowerConfig;
use crate::encoder::EncoderManager;
use crate::ingest::IngestStats;
use crate::pump::{AudioPump, PumpStats};
use crate::ring::FrameRingBuffer;
use crate::source::SourceGraph;

/// Retrowaves Tower - always-on MP3 transmitter.
#[derive(Parser, Debug)]
#[command(name = "retrowaves-tower")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "TOWER_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Retrowaves Tower v{}", env!("CARGO_PKG_VERSION"));

    let config = TowerConfig::from_env().context("Failed to load configuration")?;
    let uptime = Uptime::start();
    let shutdown = CancellationToken::new();

    // PCM ingest: ring buffer lives for the process lifetime.
    let ring = Arc::new(FrameRingBuffer::new(config.ingest.buffer_frames));
    let ingest_stats = Arc::new(IngestStats::default());
    let bridge_listener =
        ingest::bind_socket(&config.ingest).context("Failed to bind bridge socket")?;
    tokio::spawn(ingest::run_ingest(
        bridge_listener,
        config.ingest.clone(),
        Arc::clone(&ring),
        Arc::clone(&ingest_stats),
        shutdown.clone(),
    ));

    // Encoder and source graph feeding the transmit clock.
    let manager = Arc::new(EncoderManager::start(&config.encoder, &shutdown));
    let graph = Arc::new(Mutex::new(
        SourceGraph::new(Arc::clone(&ring), &config.source)
            .context("Failed to build source graph")?,
    ));
    let pump_stats = Arc::new(PumpStats::default());
    let pump = AudioPump::new(
        Arc::clone(&graph),
        Arc::clone(&manager),
        Arc::clone(&pump_stats),
    );
    tokio::spawn(pump.run(shutdown.clone()));

    // HTTP surface.
    let broadcaster = Arc::new(Broadcaster::new(config.http.client_timeout));
    let events = Arc::new(EventHub::new(EVENT_BUFFER_CAPACITY));
    let state = AppState {
        ring,
        ingest_stats,
        manager: Arc::clone(&manager),
        graph,
        broadcaster,
        pump_stats,
        events,
        uptime,
        shutdown: shutdown.clone(),
    };
    let router = api::http::create_router(state);

    let bind_addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    log::info!("[Http] Listening on {bind_addr}");

    // Signals drive the cancellation token; everything else watches it.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let sigint = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("sigterm handler");
                tokio::select! {
                    _ = sigint => log::info!("SIGINT received, shutting down"),
                    _ = sigterm.recv() => log::info!("SIGTERM received, shutting down"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = sigint.await;
                log::info!("Ctrl-C received, shutting down");
            }
            shutdown.cancel();
        });
    }

    let serve_shutdown = shutdown.clone();
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { serve_shutdown.cancelled().await });

    // Serve until shutdown, then allow the graceful budget before exiting
    // with whatever is still pending forcibly dropped.
    tokio::select! {
        served = server => served.context("HTTP server error")?,
        _ = wait_for_budget(&shutdown, config.shutdown_timeout) => {
            log::warn!(
                "Graceful shutdown budget ({:?}) exceeded, forcing exit",
                config.shutdown_timeout
            );
        }
    }

    manager.stop();
    log::info!("Tower stopped");
    Ok(())
}

/// Resolves one budget after the shutdown token fires; pending forever
/// until then.
async fn wait_for_budget(shutdown: &CancellationToken, budget: Duration) {
    shutdown.cancelled().await;
    tokio::time::sleep(budget).await;
}
