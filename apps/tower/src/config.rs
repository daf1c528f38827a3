//! Tower configuration.
//!
//! The configuration surface is a closed set of `TOWER_*` environment
//! variables, parsed once at startup into a typed record and validated
//! before anything is spawned. Components receive only the slice they need.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use retrowaves_core::protocol_constants::{
    CHANNELS, CLIENT_WRITE_BUDGET_MS, ENCODER_RESTART_MAX, PCM_RING_CAPACITY, SAMPLE_RATE,
};

use crate::error::{TowerError, TowerResult};
use crate::source::SourceMode;

/// Default path of the PCM bridge socket.
const DEFAULT_SOCKET_PATH: &str = "/var/run/retrowaves/pcm.sock";

/// Top-level tower configuration, assembled from the environment.
#[derive(Debug, Clone)]
pub struct TowerConfig {
    pub http: HttpConfig,
    pub ingest: IngestConfig,
    pub encoder: EncoderConfig,
    pub source: SourceConfig,
    /// Graceful shutdown budget before workers are aborted.
    pub shutdown_timeout: Duration,
}

/// HTTP server slice.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Per-client write budget before a slow listener is evicted.
    pub client_timeout: Duration,
}

/// PCM ingest slice.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub socket_path: PathBuf,
    /// Ring buffer capacity in frames.
    pub buffer_frames: usize,
    /// Socket read chunk size in bytes.
    pub read_chunk_size: usize,
}

/// Encoder supervision slice.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Output bitrate in kbit/s.
    pub bitrate_kbps: u32,
    /// Maximum consecutive restart attempts before FAILED.
    pub restart_max: u32,
    /// Base restart backoff; doubles per attempt, capped at 10 s.
    pub restart_backoff: Duration,
    /// RUNNING-state stall tolerance: no MP3 frame for this long triggers
    /// a restart.
    pub frame_timeout: Duration,
}

/// Source graph slice.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Primary fallback when Program PCM is absent.
    pub default_source: SourceMode,
    /// Pre-decoded WAV file for the file fallback node, if configured.
    pub fallback_file: Option<PathBuf>,
}

impl TowerConfig {
    /// Reads the closed `TOWER_*` variable set from the environment.
    ///
    /// Unset variables take their defaults; set-but-malformed variables are
    /// a startup error, never silently defaulted.
    pub fn from_env() -> TowerResult<Self> {
        // The wire format is fixed; these two exist so a misconfigured
        // deployment fails loudly instead of shipping undecodable PCM.
        let sample_rate: u32 = parse_var("TOWER_SAMPLE_RATE", SAMPLE_RATE)?;
        let channels: u16 = parse_var("TOWER_CHANNELS", CHANNELS)?;
        if sample_rate != SAMPLE_RATE || channels != CHANNELS {
            return Err(TowerError::Configuration(format!(
                "bridge PCM is fixed at {} Hz / {} ch, got {} Hz / {} ch",
                SAMPLE_RATE, CHANNELS, sample_rate, channels
            )));
        }

        let config = Self {
            http: HttpConfig {
                host: string_var("TOWER_HOST", "0.0.0.0"),
                port: parse_var("TOWER_PORT", 8000u16)?,
                client_timeout: Duration::from_millis(parse_var(
                    "TOWER_CLIENT_TIMEOUT_MS",
                    CLIENT_WRITE_BUDGET_MS,
                )?),
            },
            ingest: IngestConfig {
                socket_path: PathBuf::from(string_var("TOWER_SOCKET_PATH", DEFAULT_SOCKET_PATH)),
                buffer_frames: parse_var("TOWER_BUFFER_SIZE", PCM_RING_CAPACITY)?,
                read_chunk_size: parse_var("TOWER_READ_CHUNK_SIZE", 16_384usize)?,
            },
            encoder: EncoderConfig {
                bitrate_kbps: parse_var("TOWER_BITRATE", 128u32)?,
                restart_max: parse_var("TOWER_ENCODER_RESTART_MAX", ENCODER_RESTART_MAX)?,
                restart_backoff: Duration::from_millis(parse_var(
                    "TOWER_ENCODER_RESTART_BACKOFF_MS",
                    1_000u64,
                )?),
                frame_timeout: Duration::from_millis(parse_var(
                    "TOWER_FRAME_TIMEOUT_MS",
                    1_000u64,
                )?),
            },
            source: SourceConfig {
                default_source: string_var("TOWER_DEFAULT_SOURCE", "tone")
                    .parse()
                    .map_err(TowerError::Configuration)?,
                fallback_file: env::var("TOWER_SILENCE_MP3_PATH").ok().map(PathBuf::from),
            },
            shutdown_timeout: Duration::from_secs(parse_var("TOWER_SHUTDOWN_TIMEOUT", 5u64)?),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> TowerResult<()> {
        if self.ingest.buffer_frames == 0 {
            return Err(TowerError::Configuration(
                "TOWER_BUFFER_SIZE must be >= 1".into(),
            ));
        }
        if self.ingest.read_chunk_size == 0 {
            return Err(TowerError::Configuration(
                "TOWER_READ_CHUNK_SIZE must be >= 1".into(),
            ));
        }
        if self.encoder.restart_max == 0 {
            return Err(TowerError::Configuration(
                "TOWER_ENCODER_RESTART_MAX must be >= 1".into(),
            ));
        }
        if self.http.client_timeout.is_zero() {
            return Err(TowerError::Configuration(
                "TOWER_CLIENT_TIMEOUT_MS must be >= 1".into(),
            ));
        }
        if self.source.default_source == SourceMode::File && self.source.fallback_file.is_none() {
            return Err(TowerError::Configuration(
                "TOWER_DEFAULT_SOURCE=file requires TOWER_SILENCE_MP3_PATH".into(),
            ));
        }
        Ok(())
    }
}

fn string_var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> TowerResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| TowerError::Configuration(format!("{name}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> TowerConfig {
        TowerConfig {
            http: HttpConfig {
                host: "127.0.0.1".into(),
                port: 8000,
                client_timeout: Duration::from_millis(250),
            },
            ingest: IngestConfig {
                socket_path: PathBuf::from("/tmp/pcm.sock"),
                buffer_frames: 5,
                read_chunk_size: 16_384,
            },
            encoder: EncoderConfig {
                bitrate_kbps: 128,
                restart_max: 5,
                restart_backoff: Duration::from_millis(1_000),
                frame_timeout: Duration::from_millis(1_000),
            },
            source: SourceConfig {
                default_source: SourceMode::Tone,
                fallback_file: None,
            },
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn base_config_validates() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn zero_ring_capacity_rejected() {
        let mut config = base_config();
        config.ingest.buffer_frames = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_primary_requires_file_path() {
        let mut config = base_config();
        config.source.default_source = SourceMode::File;
        assert!(config.validate().is_err());
        config.source.fallback_file = Some(PathBuf::from("/srv/fallback.wav"));
        assert!(config.validate().is_ok());
    }

}
