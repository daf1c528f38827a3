//! Source graph: priority walk, admission, grace window, override stack.
//!
//! Exactly one node is active per tick. Priority order:
//!
//! 1. Override stack top (operator intent outranks everything)
//! 2. Program PCM from the ingest ring, once admitted
//! 3. Grace silence, if program was admitted and then stopped
//! 4. The configured primary fallback node
//! 5. Tone
//! 6. Silence
//!
//! All control mutations (`set_primary`, overrides, file node creation)
//! take effect on the next frame boundary only, because the pump consults
//! the graph exactly once per tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use retrowaves_core::audio::{apply_fade_in, fade_out_frame, last_sample_pair, silence_frame};
use retrowaves_core::protocol_constants::{
    GRACE_WINDOW_MS, OVERRIDE_STACK_CAP, PROGRAM_ADMISSION_FRAMES,
};

/// Fade length on program/silence edges (2 ms at 48 kHz), enough to kill
/// the pop without being audible as a fade.
const EDGE_FADE_SAMPLES: usize = 96;

use crate::config::SourceConfig;
use crate::error::{TowerError, TowerResult};
use crate::ring::FrameRingBuffer;
use crate::source::{FallbackNode, FileSource, SourceMode, ToneSource};

/// Program PCM admission state.
///
/// Program becomes the active source only after N consecutive non-empty
/// ring pops, so one stray frame cannot flip the mode audibly. Losing
/// program after admission opens the grace window instead of falling
/// straight to file/tone.
#[derive(Debug, Default)]
struct ProgramAdmission {
    consecutive: u32,
    admitted: bool,
    grace_deadline: Option<Instant>,
}

/// Snapshot of the graph for `/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub active_source: String,
    pub primary_source: String,
    /// Newest first.
    pub override_stack: Vec<String>,
    pub program_admitted: bool,
}

/// The tower's set of possible PCM producers plus selection policy.
pub struct SourceGraph {
    ring: Arc<FrameRingBuffer>,
    nodes: HashMap<String, FallbackNode>,
    primary: String,
    overrides: Vec<String>,
    program: ProgramAdmission,
    grace_window: Duration,
    admission_threshold: u32,
    /// Last sample pair of real audio, for the fade-out into silence.
    last_pair: Option<(i16, i16)>,
    /// Whether the previous tick emitted program audio (fade-in detection).
    prev_was_program: bool,
    /// Name of the node that produced the last frame.
    active: String,
}

impl SourceGraph {
    /// Builds the graph from configuration. The tone and silence nodes
    /// always exist; a file node exists only when a fallback file was
    /// configured and loads cleanly.
    pub fn new(ring: Arc<FrameRingBuffer>, config: &SourceConfig) -> TowerResult<Self> {
        let mut nodes = HashMap::new();
        nodes.insert("tone".to_string(), FallbackNode::Tone(ToneSource::new()));
        nodes.insert("silence".to_string(), FallbackNode::Silence);

        if let Some(path) = &config.fallback_file {
            let file = FileSource::load(path)?;
            nodes.insert("file".to_string(), FallbackNode::File(file));
        }

        let primary = config.default_source.as_str().to_string();
        if !nodes.contains_key(&primary) {
            return Err(TowerError::Configuration(format!(
                "primary source '{primary}' is not available"
            )));
        }

        Ok(Self {
            ring,
            nodes,
            active: primary.clone(),
            primary,
            overrides: Vec::new(),
            program: ProgramAdmission::default(),
            grace_window: Duration::from_millis(GRACE_WINDOW_MS),
            admission_threshold: PROGRAM_ADMISSION_FRAMES,
            last_pair: None,
            prev_was_program: false,
        })
    }

    /// Produces exactly one frame. Total: the silence node is the floor.
    pub fn next_frame(&mut self, now: Instant) -> Bytes {
        // 1. Override stack
        if let Some(name) = self.overrides.last().cloned() {
            let frame = self.emit_fallback(&name);
            self.prev_was_program = false;
            return frame;
        }

        // 2. Program PCM
        match self.ring.pop() {
            Some(frame) => {
                self.program.consecutive += 1;
                if self.program.admitted || self.program.consecutive >= self.admission_threshold {
                    let newly_admitted = !self.program.admitted;
                    if newly_admitted {
                        log::info!(
                            "[SourceGraph] Program PCM admitted after {} consecutive frames",
                            self.program.consecutive
                        );
                    }
                    self.program.admitted = true;
                    self.program.grace_deadline = None;
                    self.last_pair = last_sample_pair(&frame);
                    self.active = "program".to_string();

                    let frame = if !self.prev_was_program {
                        let mut faded = frame.to_vec();
                        apply_fade_in(&mut faded, EDGE_FADE_SAMPLES);
                        Bytes::from(faded)
                    } else {
                        frame
                    };
                    self.prev_was_program = true;
                    return frame;
                }
                // Not yet admitted: the frame is consumed but not emitted.
            }
            None => {
                self.program.consecutive = 0;
                if self.program.admitted {
                    self.program.admitted = false;
                    self.program.grace_deadline = Some(now + self.grace_window);
                    log::info!("[SourceGraph] Program PCM lost, grace window open");
                    self.active = "grace".to_string();
                    self.prev_was_program = false;

                    // First grace frame fades the last program audio out.
                    if let Some((left, right)) = self.last_pair.take() {
                        return fade_out_frame(left, right, EDGE_FADE_SAMPLES);
                    }
                    return silence_frame();
                }
            }
        }

        // 3. Grace window: only silence, never file/tone.
        if let Some(deadline) = self.program.grace_deadline {
            if now < deadline {
                self.active = "grace".to_string();
                self.prev_was_program = false;
                return silence_frame();
            }
            log::info!("[SourceGraph] Grace window expired, resuming fallback walk");
            self.program.grace_deadline = None;
        }

        // 4..6. Primary, then tone, then silence.
        let primary = self.primary.clone();
        let frame = self.emit_fallback(&primary);
        self.prev_was_program = false;
        frame
    }

    /// Emits from a named fallback node, degrading to tone then silence on
    /// the same frame boundary if the node is missing or empty. The
    /// override stack is never modified here.
    fn emit_fallback(&mut self, name: &str) -> Bytes {
        for candidate in [name, "tone"] {
            if let Some(node) = self.nodes.get_mut(candidate) {
                if let Some(frame) = node.next_frame() {
                    self.active = candidate.to_string();
                    return frame;
                }
            }
        }
        self.active = "silence".to_string();
        silence_frame()
    }

    // ── control surface ──────────────────────────────────────────────────

    /// Selects the primary fallback node. Validates existence and never
    /// creates nodes. Idempotent: re-selecting the current primary is a
    /// no-op.
    pub fn set_primary(&mut self, name: &str) -> TowerResult<()> {
        if !self.nodes.contains_key(name) {
            return Err(TowerError::UnknownSource(name.to_string()));
        }
        if self.primary != name {
            log::info!("[SourceGraph] Primary source: {} -> {}", self.primary, name);
            self.primary = name.to_string();
        }
        Ok(())
    }

    /// Pushes a named node onto the override stack.
    pub fn push_override(&mut self, name: &str) -> TowerResult<()> {
        if !self.nodes.contains_key(name) {
            return Err(TowerError::UnknownSource(name.to_string()));
        }
        if self.overrides.len() >= OVERRIDE_STACK_CAP {
            return Err(TowerError::SourceControl(format!(
                "override stack full ({OVERRIDE_STACK_CAP})"
            )));
        }
        self.overrides.push(name.to_string());
        log::info!("[SourceGraph] Override pushed: {name}");
        Ok(())
    }

    /// Pops the newest override, returning its name.
    pub fn pop_override(&mut self) -> TowerResult<String> {
        match self.overrides.pop() {
            Some(name) => {
                log::info!("[SourceGraph] Override popped: {name}");
                Ok(name)
            }
            None => Err(TowerError::SourceControl("override stack empty".into())),
        }
    }

    /// Installs a pre-loaded file node and selects it as primary. This is
    /// the one control path allowed to create a node. The caller loads the
    /// file before taking the graph lock: decoding a file under the lock
    /// would stall the tick loop.
    pub fn install_file(&mut self, file: FileSource) -> TowerResult<()> {
        self.nodes
            .insert("file".to_string(), FallbackNode::File(file));
        self.set_primary("file")
    }

    /// Applies a non-file mode selection (`tone` / `silence`).
    pub fn set_mode(&mut self, mode: SourceMode) -> TowerResult<()> {
        match mode {
            SourceMode::File => Err(TowerError::InvalidRequest(
                "file mode is installed via install_file".into(),
            )),
            SourceMode::Tone => self.set_primary("tone"),
            SourceMode::Silence => self.set_primary("silence"),
        }
    }

    #[must_use]
    pub fn status(&self) -> SourceStatus {
        SourceStatus {
            active_source: self.active.clone(),
            primary_source: self.primary.clone(),
            override_stack: self.overrides.iter().rev().cloned().collect(),
            program_admitted: self.program.admitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrowaves_core::protocol_constants::PCM_FRAME_BYTES;

    fn graph_with_ring(capacity: usize) -> (SourceGraph, Arc<FrameRingBuffer>) {
        let ring = Arc::new(FrameRingBuffer::new(capacity));
        let config = SourceConfig {
            default_source: SourceMode::Tone,
            fallback_file: None,
        };
        (SourceGraph::new(Arc::clone(&ring), &config).unwrap(), ring)
    }

    fn program_frame() -> Bytes {
        // Non-zero, non-sine content so it is distinguishable from fallback.
        Bytes::from(vec![0x55; PCM_FRAME_BYTES])
    }

    fn admit_program(graph: &mut SourceGraph, ring: &FrameRingBuffer, now: Instant) {
        for _ in 0..PROGRAM_ADMISSION_FRAMES + 1 {
            ring.push(program_frame());
        }
        for _ in 0..PROGRAM_ADMISSION_FRAMES {
            graph.next_frame(now);
        }
        assert!(graph.status().program_admitted);
    }

    #[test]
    fn falls_back_to_tone_when_no_program() {
        let (mut graph, _ring) = graph_with_ring(5);
        let frame = graph.next_frame(Instant::now());
        assert_eq!(frame.len(), PCM_FRAME_BYTES);
        assert_eq!(graph.status().active_source, "tone");
    }

    #[test]
    fn single_spurious_frame_does_not_flip_mode() {
        let (mut graph, ring) = graph_with_ring(5);
        let now = Instant::now();

        ring.push(program_frame());
        graph.next_frame(now);
        assert_eq!(graph.status().active_source, "tone");
        assert!(!graph.status().program_admitted);

        // The ring is empty again; still tone, no grace window.
        graph.next_frame(now);
        assert_eq!(graph.status().active_source, "tone");
    }

    #[test]
    fn program_admitted_after_threshold_consecutive_frames() {
        let (mut graph, ring) = graph_with_ring(5);
        let now = Instant::now();

        for _ in 0..PROGRAM_ADMISSION_FRAMES {
            ring.push(program_frame());
        }
        for i in 0..PROGRAM_ADMISSION_FRAMES {
            let is_last = i + 1 == PROGRAM_ADMISSION_FRAMES;
            graph.next_frame(now);
            assert_eq!(graph.status().program_admitted, is_last);
        }
        assert_eq!(graph.status().active_source, "program");
    }

    #[test]
    fn losing_program_opens_grace_silence_not_fallback() {
        let (mut graph, ring) = graph_with_ring(5);
        let now = Instant::now();
        admit_program(&mut graph, &ring, now);

        // Drain the ring, then tick with nothing available.
        while ring.pop().is_some() {}
        let frame = graph.next_frame(now);
        assert_eq!(graph.status().active_source, "grace");
        // Fade-out frame ends in silence.
        assert!(frame[frame.len() - 4..].iter().all(|&b| b == 0));

        // Still inside the window: silence only.
        let frame = graph.next_frame(now + Duration::from_millis(500));
        assert_eq!(graph.status().active_source, "grace");
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn grace_expiry_resumes_fallback_walk() {
        let (mut graph, ring) = graph_with_ring(5);
        let now = Instant::now();
        admit_program(&mut graph, &ring, now);

        while ring.pop().is_some() {}
        graph.next_frame(now); // opens grace

        // First tick at exactly the deadline comes from the fallback walk.
        let after = now + Duration::from_millis(GRACE_WINDOW_MS);
        graph.next_frame(after);
        assert_eq!(graph.status().active_source, "tone");
    }

    #[test]
    fn program_readmission_during_grace_requires_threshold() {
        let (mut graph, ring) = graph_with_ring(5);
        let now = Instant::now();
        admit_program(&mut graph, &ring, now);

        while ring.pop().is_some() {}
        graph.next_frame(now); // grace opens

        // One frame trickles in: not enough to re-admit.
        ring.push(program_frame());
        graph.next_frame(now + Duration::from_millis(100));
        assert_eq!(graph.status().active_source, "grace");

        // A steady run re-admits.
        for _ in 0..PROGRAM_ADMISSION_FRAMES {
            ring.push(program_frame());
        }
        for _ in 0..PROGRAM_ADMISSION_FRAMES {
            graph.next_frame(now + Duration::from_millis(200));
        }
        assert_eq!(graph.status().active_source, "program");
    }

    #[test]
    fn override_preempts_program() {
        let (mut graph, ring) = graph_with_ring(5);
        let now = Instant::now();
        admit_program(&mut graph, &ring, now);

        graph.push_override("silence").unwrap();
        ring.push(program_frame());
        let frame = graph.next_frame(now);
        assert_eq!(graph.status().active_source, "silence");
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn push_then_pop_restores_prior_active_source() {
        let (mut graph, _ring) = graph_with_ring(5);
        let now = Instant::now();

        graph.next_frame(now);
        let before = graph.status().active_source;

        graph.push_override("silence").unwrap();
        graph.next_frame(now);
        assert_eq!(graph.status().active_source, "silence");

        assert_eq!(graph.pop_override().unwrap(), "silence");
        graph.next_frame(now);
        assert_eq!(graph.status().active_source, before);
    }

    #[test]
    fn set_primary_is_idempotent_and_validating() {
        let (mut graph, _ring) = graph_with_ring(5);
        graph.set_primary("silence").unwrap();
        graph.set_primary("silence").unwrap(); // second call is a no-op
        assert_eq!(graph.status().primary_source, "silence");

        assert!(matches!(
            graph.set_primary("theremin"),
            Err(TowerError::UnknownSource(_))
        ));
        // File node was never configured, so it cannot be selected.
        assert!(graph.set_primary("file").is_err());
    }

    #[test]
    fn override_stack_is_bounded_and_lifo() {
        let (mut graph, _ring) = graph_with_ring(5);
        for _ in 0..OVERRIDE_STACK_CAP {
            graph.push_override("tone").unwrap();
        }
        assert!(graph.push_override("tone").is_err());

        graph.push_override("silence").unwrap_err();
        let status = graph.status();
        assert_eq!(status.override_stack.len(), OVERRIDE_STACK_CAP);

        assert!(graph.pop_override().is_ok());
    }

    #[test]
    fn pop_on_empty_stack_is_rejected() {
        let (mut graph, _ring) = graph_with_ring(5);
        assert!(graph.pop_override().is_err());
    }

    #[test]
    fn status_lists_overrides_newest_first() {
        let (mut graph, _ring) = graph_with_ring(5);
        graph.push_override("tone").unwrap();
        graph.push_override("silence").unwrap();
        assert_eq!(graph.status().override_stack, vec!["silence", "tone"]);
    }
}
