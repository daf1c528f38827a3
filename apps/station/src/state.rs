//! Authoritative station state.
//!
//! A single immutable snapshot record, replaced synchronously inside the
//! segment lifecycle handlers. State is the truth; emitted events are
//! edge-triggered advisories derived from the same transitions. Readers
//! get a coherent clone without ever touching the playout thread.
//!
//! No derived fields are stored: elapsed/remaining/percent are for
//! consumers to compute from `started_at` and `duration_sec`.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use retrowaves_core::events::{ProductionType, SegmentClass, SegmentRole};
use retrowaves_core::time::{now_millis, Uptime};

use crate::intent::{AudioEvent, SegmentKind};

/// Station operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StationState {
    StartingUp,
    SongPlaying,
    DjTalking,
    Fallback,
    ShuttingDown,
    Error,
}

/// What is on air right now. Null only in ERROR.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentAudio {
    pub segment_type: &'static str,
    pub file_path: String,
    /// Wall-clock start (Unix ms); consumers derive elapsed from it.
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_class: Option<SegmentClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_role: Option<SegmentRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub production_type: Option<ProductionType>,
}

impl CurrentAudio {
    /// Builds the on-air snapshot for an event, mirroring the class/role/
    /// production triple for non-song segments.
    pub fn for_event(event: &AudioEvent) -> Self {
        let (segment_type, class, role, production) = match event.kind {
            SegmentKind::Song => ("song", None, None, None),
            SegmentKind::Segment {
                class,
                role,
                production,
            } => ("segment", Some(class), Some(role), Some(production)),
        };
        Self {
            segment_type,
            file_path: event.path.display().to_string(),
            started_at: now_millis(),
            title: event.metadata.title.clone(),
            artist: event.metadata.artist.clone(),
            duration_sec: event.metadata.duration_sec,
            segment_class: class,
            segment_role: role,
            production_type: production,
        }
    }

    /// The synthetic snapshot used while in FALLBACK: nothing is decoding,
    /// the tower's own fallback is covering air.
    pub fn fallback() -> Self {
        Self {
            segment_type: "fallback",
            file_path: String::new(),
            started_at: now_millis(),
            title: None,
            artist: None,
            duration_sec: None,
            segment_class: Some(SegmentClass::Emergency),
            segment_role: Some(SegmentRole::Standalone),
            production_type: Some(ProductionType::System),
        }
    }
}

/// One coherent snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub station_state: StationState,
    /// Monotonic seconds (process uptime) when this state was entered.
    pub since: f64,
    pub current_audio: Option<CurrentAudio>,
}

/// The store. Writes happen only on the playout thread; reads clone.
pub struct StationStateStore {
    uptime: Uptime,
    snapshot: RwLock<StateSnapshot>,
}

impl StationStateStore {
    pub fn new(uptime: Uptime) -> Arc<Self> {
        Arc::new(Self {
            uptime,
            snapshot: RwLock::new(StateSnapshot {
                station_state: StationState::StartingUp,
                since: uptime.seconds(),
                current_audio: None,
            }),
        })
    }

    /// Replaces the snapshot. `current_audio` may only be `None` for ERROR.
    pub fn set(&self, station_state: StationState, current_audio: Option<CurrentAudio>) {
        debug_assert!(
            current_audio.is_some() || station_state == StationState::Error,
            "current_audio may be null only in ERROR"
        );
        let mut snapshot = self.snapshot.write();
        if snapshot.station_state != station_state {
            log::info!(
                "[State] {:?} -> {:?}",
                snapshot.station_state,
                station_state
            );
        }
        *snapshot = StateSnapshot {
            station_state,
            since: self.uptime.seconds(),
            current_audio,
        };
    }

    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        self.snapshot.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::TrackMetadata;
    use std::path::PathBuf;

    #[test]
    fn starts_in_starting_up() {
        let store = StationStateStore::new(Uptime::start());
        let snapshot = store.snapshot();
        assert_eq!(snapshot.station_state, StationState::StartingUp);
    }

    #[test]
    fn set_replaces_whole_snapshot() {
        let store = StationStateStore::new(Uptime::start());
        let event = AudioEvent::song(
            PathBuf::from("/music/a.mp3"),
            TrackMetadata {
                title: Some("A".into()),
                artist: Some("B".into()),
                album: None,
                duration_sec: Some(200.0),
            },
        );
        store.set(StationState::SongPlaying, Some(CurrentAudio::for_event(&event)));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.station_state, StationState::SongPlaying);
        let audio = snapshot.current_audio.unwrap();
        assert_eq!(audio.segment_type, "song");
        assert_eq!(audio.title.as_deref(), Some("A"));
        assert!(audio.segment_class.is_none());
    }

    #[test]
    fn segment_snapshot_mirrors_the_taxonomy_triple() {
        let event = AudioEvent::segment(
            PathBuf::from("/dj/id.wav"),
            SegmentClass::StationId,
            SegmentRole::Legal,
            ProductionType::Produced,
        );
        let audio = CurrentAudio::for_event(&event);
        assert_eq!(audio.segment_type, "segment");
        assert_eq!(audio.segment_class, Some(SegmentClass::StationId));
        assert_eq!(audio.segment_role, Some(SegmentRole::Legal));
        assert_eq!(audio.production_type, Some(ProductionType::Produced));
    }

    #[test]
    fn state_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&StationState::SongPlaying).unwrap(),
            "\"SONG_PLAYING\""
        );
        assert_eq!(
            serde_json::to_string(&StationState::ShuttingDown).unwrap(),
            "\"SHUTTING_DOWN\""
        );
    }
}
