//! THINK/DO segment scheduler.
//!
//! Decision and execution are strictly separated. THINK runs when a
//! segment starts and prepares one immutable [`DJIntent`] for the segment
//! transition; DO runs when the segment finishes and appends the prepared
//! intent's events to the playout queue and nothing else. THINK touches only
//! the planner and the cached asset index; DO makes no decisions and never
//! blocks.
//!
//! Both are ordinary synchronous functions called on the playout thread by
//! the segment lifecycle, so there is no THINK/DO concurrency to reason
//! about. The terminal latch is the one piece of process-lifetime state:
//! once the shutdown intent exists, every later THINK and DO refuses.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use uuid::Uuid;

use retrowaves_core::events::{EventPayload, ProductionType, SegmentClass, SegmentRole};

use crate::assets::AssetIndex;
use crate::emitter::EventEmitter;
use crate::intent::{AudioEvent, DJIntent, SegmentKind};
use crate::planner::DjPlanner;

/// Songs between legal-ID placements.
const SONGS_PER_LEGAL_ID: u32 = 3;

/// Startup state machine. The playout queue must stay empty until
/// `DoEnqueue`; only the startup announcement (injected directly, no
/// intent id) plays before then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    Bootstrap,
    AnnouncementPlaying,
    ThinkComplete,
    DoEnqueue,
    Normal,
}

/// Shutdown coordination shared with the signal handler and the state
/// endpoint. `begin` is idempotent; the latch is set exactly once, by the
/// THINK that creates the terminal intent, and never clears.
#[derive(Debug, Default)]
pub struct DrainControl {
    draining: AtomicBool,
    terminal_latched: AtomicBool,
    since: Mutex<Option<Instant>>,
}

impl DrainControl {
    /// Enters DRAINING. Re-sending the signal changes nothing.
    pub fn begin(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            *self.since.lock() = Some(Instant::now());
            log::info!("[Drain] DRAINING entered");
        } else {
            log::info!("[Drain] Already draining, signal ignored");
        }
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn terminal_latched(&self) -> bool {
        self.terminal_latched.load(Ordering::SeqCst)
    }

    fn latch_terminal(&self) {
        self.terminal_latched.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn draining_since(&self) -> Option<Instant> {
        *self.since.lock()
    }
}

/// The scheduler proper. Single owner: the playout thread.
pub struct Scheduler {
    planner: Arc<dyn DjPlanner>,
    assets: Arc<AssetIndex>,
    emitter: Arc<dyn EventEmitter>,
    drain: Arc<DrainControl>,
    prepared: Option<DJIntent>,
    /// Refreshed by every successful THINK; what DO falls back to if the
    /// prepared intent is missing.
    safe_default: Option<DJIntent>,
    terminal_intent_id: Option<Uuid>,
    finished: bool,
    startup: StartupPhase,
    songs_since_legal_id: u32,
}

impl Scheduler {
    pub fn new(
        planner: Arc<dyn DjPlanner>,
        assets: Arc<AssetIndex>,
        emitter: Arc<dyn EventEmitter>,
        drain: Arc<DrainControl>,
    ) -> Self {
        Self {
            planner,
            assets,
            emitter,
            drain,
            prepared: None,
            safe_default: None,
            terminal_intent_id: None,
            finished: false,
            startup: StartupPhase::Bootstrap,
            songs_since_legal_id: 0,
        }
    }

    /// The startup announcement, injected directly as the first active
    /// segment. Carries no intent id and is never enqueued via DO.
    pub fn startup_announcement(&mut self) -> Option<AudioEvent> {
        let announcement = self.assets.dj().startup.map(|entry| {
            AudioEvent::segment(
                entry.path,
                SegmentClass::Imaging,
                SegmentRole::Standalone,
                ProductionType::Produced,
            )
        });
        if announcement.is_some() {
            self.startup = StartupPhase::AnnouncementPlaying;
        }
        announcement
    }

    /// Seeds the queue when there is no startup announcement to play: one
    /// THINK/DO cycle, skipping the announcement phase.
    pub fn prime(&mut self, queue: &mut VecDeque<AudioEvent>) {
        debug_assert!(queue.is_empty(), "queue must be empty before priming");
        self.think();
        self.startup = StartupPhase::ThinkComplete;
        self.do_execute(queue);
        self.startup = StartupPhase::Normal;
    }

    /// True for the event that anchors a THINK/DO cycle: the song of an
    /// intent, or a directly injected announcement. Intros, outros and IDs
    /// ride along on their intent and trigger nothing themselves.
    fn is_anchor(event: &AudioEvent) -> bool {
        matches!(event.kind, SegmentKind::Song) || event.intent_id.is_none()
    }

    /// Segment lifecycle: a segment began; prepare the next transition.
    pub fn on_segment_started(&mut self, event: &AudioEvent) {
        if self.finished {
            return;
        }
        if matches!(event.kind, SegmentKind::Song) {
            self.planner.mark_played(&event.path);
            self.songs_since_legal_id += 1;
        }
        if !Self::is_anchor(event) {
            return;
        }
        self.think();
        if self.startup == StartupPhase::AnnouncementPlaying {
            self.startup = StartupPhase::ThinkComplete;
        }
    }

    /// Segment lifecycle: a segment ended; execute the prepared intent.
    pub fn on_segment_finished(&mut self, event: &AudioEvent, queue: &mut VecDeque<AudioEvent>) {
        if self.finished {
            return;
        }

        // The terminal announcement just ended: the lifecycle is over.
        if self.terminal_intent_id.is_some() && event.intent_id == self.terminal_intent_id {
            log::info!("[Scheduler] Terminal intent complete");
            self.finished = true;
            return;
        }

        // DRAINING entered mid-segment: the plan THINK made before the
        // signal is void. One further THINK/DO pair prepares the terminal
        // intent; whatever else was queued will never play. This cut
        // applies whatever kind of segment just ended.
        if self.drain.is_draining() && !self.drain.terminal_latched() {
            self.prepared = None;
            if !queue.is_empty() {
                log::info!(
                    "[Scheduler] Draining: discarding {} queued events",
                    queue.len()
                );
                queue.clear();
            }
            self.think();
            self.do_execute(queue);
            return;
        }

        if !Self::is_anchor(event) {
            return;
        }

        if self.startup == StartupPhase::ThinkComplete {
            self.startup = StartupPhase::DoEnqueue;
        }
        self.do_execute(queue);
        if self.startup == StartupPhase::DoEnqueue {
            self.startup = StartupPhase::Normal;
        }
    }

    /// FALLBACK recovery: one THINK/DO cycle to refill an empty queue.
    /// Never runs while draining or finished.
    pub fn replan(&mut self, queue: &mut VecDeque<AudioEvent>) {
        if self.finished || self.drain.is_draining() {
            return;
        }
        self.think();
        self.do_execute(queue);
    }

    #[must_use]
    pub fn finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn startup_phase(&self) -> StartupPhase {
        self.startup
    }

    // ── THINK ────────────────────────────────────────────────────────────

    /// Prepares the next intent. Pure decision: no queue mutation, no
    /// decoding, no network, no file I/O beyond the cached index.
    fn think(&mut self) {
        if self.drain.terminal_latched() {
            // The single permitted terminal intent already exists.
            log::info!("[Scheduler] THINK refused: terminal intent latched");
            return;
        }
        if self.finished {
            return;
        }

        self.emitter.emit(EventPayload::DjThinkStarted {});

        let intent = if self.drain.is_draining() {
            self.think_terminal()
        } else {
            self.think_normal()
        };

        self.emitter.emit(EventPayload::DjThinkCompleted {
            intent_id: intent.intent_id.to_string(),
        });
        self.prepared = Some(intent);
    }

    /// The one terminal intent: a shutdown announcement if the library has
    /// one, empty otherwise. Latches before returning, so even a reentrant
    /// call cannot mint a second one.
    fn think_terminal(&mut self) -> DJIntent {
        self.drain.latch_terminal();

        let announcement = self.assets.dj().shutdown.map(|entry| {
            AudioEvent::segment(
                entry.path,
                SegmentClass::Imaging,
                SegmentRole::Standalone,
                ProductionType::Produced,
            )
        });
        if announcement.is_none() {
            log::warn!("[Scheduler] No shutdown announcement available, terminal intent empty");
        }

        let intent = DJIntent::new(announcement, None, Vec::new(), None, false, true);
        self.terminal_intent_id = Some(intent.intent_id);
        intent
    }

    fn think_normal(&mut self) -> DJIntent {
        let next_song = self.planner.next_song().and_then(|entry| {
            if self.assets.contains(&entry.path) {
                Some(AudioEvent::song(entry.path, entry.metadata))
            } else {
                log::error!(
                    "[Scheduler] Planner selected unindexed path {}",
                    entry.path.display()
                );
                None
            }
        });

        if next_song.is_none() {
            // Nothing resolvable: the intent is empty, the queue will run
            // dry and the playout loop holds FALLBACK until assets return.
            log::warn!("[Scheduler] No playable song, preparing empty intent");
            return DJIntent::empty(false);
        }

        // Non-essential assets: anything that does not validate is simply
        // dropped; the song carries the segment alone.
        let outro = self.validated_segment(
            self.planner.outro(),
            SegmentClass::DjTalk,
            SegmentRole::Outro,
        );
        let legal_due = self.songs_since_legal_id >= SONGS_PER_LEGAL_ID;
        let station_ids: Vec<AudioEvent> = self
            .planner
            .station_ids(legal_due)
            .into_iter()
            .filter_map(|entry| {
                self.validated_segment(Some(entry), SegmentClass::StationId, SegmentRole::Legal)
            })
            .collect();
        let has_legal_id = !station_ids.is_empty();
        if has_legal_id {
            self.songs_since_legal_id = 0;
        }
        let intro = self.validated_segment(
            self.planner.intro(),
            SegmentClass::DjTalk,
            SegmentRole::Intro,
        );

        let intent = DJIntent::new(next_song, outro, station_ids, intro, has_legal_id, false);

        // The safe default is the minimal viable version of this plan; DO
        // uses it only when the prepared intent went missing.
        self.safe_default = Some(DJIntent::new(
            intent.next_song.clone(),
            None,
            Vec::new(),
            None,
            false,
            false,
        ));

        intent
    }

    fn validated_segment(
        &self,
        entry: Option<crate::assets::AssetEntry>,
        class: SegmentClass,
        role: SegmentRole,
    ) -> Option<AudioEvent> {
        let entry = entry?;
        if self.assets.contains(&entry.path) {
            Some(AudioEvent::segment(
                entry.path,
                class,
                role,
                ProductionType::Produced,
            ))
        } else {
            log::warn!(
                "[Scheduler] Dropping stale non-essential asset {}",
                entry.path.display()
            );
            None
        }
    }

    // ── DO ───────────────────────────────────────────────────────────────

    /// Consumes the prepared intent into the queue. No decisions, no
    /// blocking, no recovery beyond the precomputed safe default.
    fn do_execute(&mut self, queue: &mut VecDeque<AudioEvent>) {
        if self.finished {
            return;
        }
        if self.drain.terminal_latched() {
            // After the latch, the only intent DO may ever enqueue is the
            // terminal one itself; anything else is refused outright.
            let prepared_is_terminal = self
                .prepared
                .as_ref()
                .map(|intent| Some(intent.intent_id) == self.terminal_intent_id)
                .unwrap_or(false);
            if !prepared_is_terminal {
                log::info!("[Scheduler] DO refused: terminal intent latched");
                return;
            }
        }

        let intent = match self.prepared.take() {
            Some(intent) => intent,
            None => match self.safe_default.take() {
                Some(default) => {
                    log::error!("[Scheduler] No prepared intent; enqueueing safe default");
                    default
                }
                None => {
                    log::error!("[Scheduler] No prepared intent and no safe default");
                    return;
                }
            },
        };

        if intent.terminal && intent.is_empty() {
            // Nothing to play: the terminal transition happens right now.
            log::info!("[Scheduler] Empty terminal intent, advancing immediately");
            self.finished = true;
            return;
        }

        let intent_id = intent.intent_id;
        let has_legal_id = intent.has_legal_id;
        let events = intent.into_playout_order();
        log::info!(
            "[Scheduler] DO: enqueueing {} events for intent {} (legal_id={})",
            events.len(),
            intent_id,
            has_legal_id
        );
        for event in events {
            debug_assert_eq!(event.intent_id, Some(intent_id));
            queue.push_back(event);
        }
    }
}
