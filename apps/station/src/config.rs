//! Station configuration.
//!
//! Parsed once at startup from the closed environment-variable set and
//! validated before the playout thread exists. Components receive slices.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use retrowaves_core::protocol_constants::{
    BUFFER_TARGET_RATIO, DRAINING_MAX_WAIT_SECS, PID_POLL_INTERVAL_MS, PREFILL_TIMEOUT_SECS,
};

use crate::error::{StationError, StationResult};

/// Top-level station configuration.
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub assets: AssetConfig,
    pub bridge: BridgeConfig,
    pub tower: TowerEndpoint,
    pub pacing: PacingConfig,
    pub http_port: u16,
    /// DRAINING cap before the current segment is force-terminated.
    pub draining_max_wait: Duration,
    /// Where rotation history and DJ state are persisted on shutdown.
    pub state_path: PathBuf,
}

/// Asset directory slice.
#[derive(Debug, Clone)]
pub struct AssetConfig {
    pub regular_music_path: PathBuf,
    pub holiday_music_path: Option<PathBuf>,
    pub dj_path: Option<PathBuf>,
}

/// Bridge socket slice.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub socket_path: PathBuf,
}

/// Where to find the tower's HTTP surface.
#[derive(Debug, Clone)]
pub struct TowerEndpoint {
    pub host: String,
    pub port: u16,
}

impl TowerEndpoint {
    #[must_use]
    pub fn buffer_url(&self) -> String {
        format!("http://{}:{}/tower/buffer", self.host, self.port)
    }

    #[must_use]
    pub fn events_url(&self) -> String {
        format!("http://{}:{}/tower/events/ingest", self.host, self.port)
    }
}

/// Decode pacing slice: PID and pre-fill switches.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub pid_enabled: bool,
    pub prefill_enabled: bool,
    pub prefill_target_ratio: f64,
    pub prefill_timeout: Duration,
    pub poll_interval: Duration,
}

impl StationConfig {
    pub fn from_env() -> StationResult<Self> {
        let config = Self {
            assets: AssetConfig {
                regular_music_path: PathBuf::from(required_var("REGULAR_MUSIC_PATH")?),
                holiday_music_path: env::var("HOLIDAY_MUSIC_PATH").ok().map(PathBuf::from),
                dj_path: env::var("DJ_PATH").ok().map(PathBuf::from),
            },
            bridge: BridgeConfig {
                socket_path: PathBuf::from(string_var(
                    "TOWER_SOCKET_PATH",
                    "/var/run/retrowaves/pcm.sock",
                )),
            },
            tower: TowerEndpoint {
                host: string_var("TOWER_HOST", "127.0.0.1"),
                port: parse_var("TOWER_PORT", 8000u16)?,
            },
            pacing: PacingConfig {
                pid_enabled: parse_var("PID_ENABLED", false)?,
                prefill_enabled: parse_var("PREFILL_ENABLED", true)?,
                prefill_target_ratio: parse_var("PREFILL_TARGET_RATIO", BUFFER_TARGET_RATIO)?,
                prefill_timeout: Duration::from_secs(parse_var(
                    "PREFILL_TIMEOUT_SEC",
                    PREFILL_TIMEOUT_SECS,
                )?),
                poll_interval: Duration::from_secs_f64(parse_var(
                    "PREFILL_POLL_INTERVAL_SEC",
                    PID_POLL_INTERVAL_MS as f64 / 1000.0,
                )?),
            },
            http_port: parse_var("STATION_PORT", 8010u16)?,
            draining_max_wait: Duration::from_secs(parse_var(
                "STATION_DRAINING_MAX_WAIT_SEC",
                DRAINING_MAX_WAIT_SECS,
            )?),
            state_path: PathBuf::from(string_var(
                "STATION_STATE_PATH",
                "/var/lib/retrowaves/station-state.json",
            )),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StationResult<()> {
        if !(0.1..=0.9).contains(&self.pacing.prefill_target_ratio) {
            return Err(StationError::Configuration(format!(
                "PREFILL_TARGET_RATIO must be within [0.1, 0.9], got {}",
                self.pacing.prefill_target_ratio
            )));
        }
        if self.pacing.poll_interval.is_zero() {
            return Err(StationError::Configuration(
                "PREFILL_POLL_INTERVAL_SEC must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn required_var(name: &str) -> StationResult<String> {
    env::var(name).map_err(|_| StationError::Configuration(format!("{name} must be set")))
}

fn string_var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> StationResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| StationError::Configuration(format!("{name}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}
