//! The closed Station → Tower event schema.
//!
//! Events are edge-triggered and advisory: they describe transitions, never
//! state, and the absence of an event never implies the absence of a state.
//! Tower validates incoming JSON against this schema and rejects anything
//! outside the closed set with a 400.

use serde::{Deserialize, Serialize};

/// One event as emitted by Station.
///
/// `timestamp` is monotonic seconds since the Station process started, not
/// wall-clock; consumers correlate ordering, not absolute time. Tower
/// injects its own `tower_received_at` wall-clock stamp on ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationEvent {
    /// Monotonic seconds since station start.
    pub timestamp: f64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StationEvent {
    pub fn new(timestamp: f64, payload: EventPayload) -> Self {
        Self { timestamp, payload }
    }

    /// The wire name of this event's type.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// The closed set of event types and their typed metadata.
///
/// `station_startup` and `station_shutdown` carry empty metadata; the
/// playback events carry what a listener-facing UI needs and nothing more.
/// There are no "clear" events; a new edge supersedes the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "metadata", rename_all = "snake_case")]
pub enum EventPayload {
    StationStartup {},
    StationShutdown {},
    SongPlaying {
        file_path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        artist: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        album: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_sec: Option<f64>,
    },
    SegmentPlaying {
        file_path: String,
        segment_class: SegmentClass,
        segment_role: SegmentRole,
        production_type: ProductionType,
    },
    DjThinkStarted {},
    DjThinkCompleted {
        intent_id: String,
    },
    StationUnderflow {
        /// Frames the bridge failed to deliver during the incident.
        dropped_frames: u64,
    },
    StationOverflow {
        dropped_frames: u64,
    },
    DecodeClockSkew {
        /// Observed deviation of the decode clock from its schedule.
        skew_ms: f64,
    },
}

impl EventPayload {
    /// The wire name of this event type.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StationStartup {} => "station_startup",
            Self::StationShutdown {} => "station_shutdown",
            Self::SongPlaying { .. } => "song_playing",
            Self::SegmentPlaying { .. } => "segment_playing",
            Self::DjThinkStarted {} => "dj_think_started",
            Self::DjThinkCompleted { .. } => "dj_think_completed",
            Self::StationUnderflow { .. } => "station_underflow",
            Self::StationOverflow { .. } => "station_overflow",
            Self::DecodeClockSkew { .. } => "decode_clock_skew",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Segment Taxonomy
// ─────────────────────────────────────────────────────────────────────────────

/// What kind of non-song audio a segment is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentClass {
    StationId,
    DjTalk,
    Promo,
    Imaging,
    RadioDrama,
    AlbumSegment,
    Emergency,
    Special,
}

/// Where in the programme flow a segment sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentRole {
    Intro,
    Outro,
    Interstitial,
    TopOfHour,
    Legal,
    Transition,
    Standalone,
}

/// How the segment audio was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionType {
    LiveDj,
    VoiceTracked,
    Produced,
    System,
}
