//! Playout data model: audio events and DJ intents.
//!
//! An [`AudioEvent`] describes one file to play; a [`DJIntent`] bundles the
//! events THINK decided on for the next segment transition. Both are
//! immutable once built. Every event in one intent shares that intent's id,
//! and an intent is consumed exactly once by DO.

use std::path::PathBuf;

use uuid::Uuid;

use retrowaves_core::events::{ProductionType, SegmentClass, SegmentRole};

/// Track metadata extracted during THINK from the cached asset index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_sec: Option<f64>,
}

/// What kind of segment an event plays as, mirrored into the emitted event
/// and the authoritative state snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegmentKind {
    Song,
    Segment {
        class: SegmentClass,
        role: SegmentRole,
        production: ProductionType,
    },
}

/// Immutable description of one file to play.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioEvent {
    pub path: PathBuf,
    /// Optional gain trim applied by the decoder (dB).
    pub gain_db: Option<f32>,
    /// Optional start offset into the file (ms).
    pub start_offset_ms: Option<u64>,
    pub metadata: TrackMetadata,
    pub kind: SegmentKind,
    /// The owning intent, when the event came through THINK/DO. The
    /// startup announcement is injected directly and carries none.
    pub intent_id: Option<Uuid>,
}

impl AudioEvent {
    /// A song event with metadata, not yet bound to an intent.
    pub fn song(path: PathBuf, metadata: TrackMetadata) -> Self {
        Self {
            path,
            gain_db: None,
            start_offset_ms: None,
            metadata,
            kind: SegmentKind::Song,
            intent_id: None,
        }
    }

    /// A non-song segment event.
    pub fn segment(
        path: PathBuf,
        class: SegmentClass,
        role: SegmentRole,
        production: ProductionType,
    ) -> Self {
        Self {
            path,
            gain_db: None,
            start_offset_ms: None,
            metadata: TrackMetadata::default(),
            kind: SegmentKind::Segment {
                class,
                role,
                production,
            },
            intent_id: None,
        }
    }

    fn bound_to(mut self, intent_id: Uuid) -> Self {
        self.intent_id = Some(intent_id);
        self
    }
}

/// Bundle of AudioEvents produced in THINK, consumed exactly once in DO.
#[derive(Debug, Clone)]
pub struct DJIntent {
    pub intent_id: Uuid,
    pub next_song: Option<AudioEvent>,
    pub outro: Option<AudioEvent>,
    pub station_ids: Vec<AudioEvent>,
    pub intro: Option<AudioEvent>,
    pub has_legal_id: bool,
    pub terminal: bool,
}

impl DJIntent {
    /// Builds an intent, stamping every event with one fresh intent id.
    pub fn new(
        next_song: Option<AudioEvent>,
        outro: Option<AudioEvent>,
        station_ids: Vec<AudioEvent>,
        intro: Option<AudioEvent>,
        has_legal_id: bool,
        terminal: bool,
    ) -> Self {
        let intent_id = Uuid::new_v4();
        Self {
            intent_id,
            next_song: next_song.map(|e| e.bound_to(intent_id)),
            outro: outro.map(|e| e.bound_to(intent_id)),
            station_ids: station_ids
                .into_iter()
                .map(|e| e.bound_to(intent_id))
                .collect(),
            intro: intro.map(|e| e.bound_to(intent_id)),
            has_legal_id,
            terminal,
        }
    }

    /// An intent with no events at all. A terminal empty intent makes the
    /// shutdown path advance immediately.
    pub fn empty(terminal: bool) -> Self {
        Self::new(None, None, Vec::new(), None, false, terminal)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.next_song.is_none()
            && self.outro.is_none()
            && self.station_ids.is_empty()
            && self.intro.is_none()
    }

    /// Consumes the intent into playout order:
    /// `[outro?, station_ids…, intro?, next_song?]`.
    #[must_use]
    pub fn into_playout_order(self) -> Vec<AudioEvent> {
        let mut events = Vec::with_capacity(3 + self.station_ids.len());
        if let Some(outro) = self.outro {
            events.push(outro);
        }
        events.extend(self.station_ids);
        if let Some(intro) = self.intro {
            events.push(intro);
        }
        if let Some(next_song) = self.next_song {
            events.push(next_song);
        }
        events
    }
}
