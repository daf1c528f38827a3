//! PCM sources and the selection policy that feeds the audio pump.
//!
//! Every tick the pump asks [`SourceGraph::next_frame`] for exactly one
//! frame; the graph walks its priority order (program, grace silence,
//! configured fallback, tone, silence) and never comes back empty.

pub mod file;
pub mod graph;
pub mod tone;

use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use retrowaves_core::audio::silence_frame;

pub use file::FileSource;
pub use graph::{SourceGraph, SourceStatus};
pub use tone::ToneSource;

/// Fallback selection mode as named by `TOWER_DEFAULT_SOURCE` and
/// `POST /control/source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Tone,
    Silence,
    File,
}

impl SourceMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tone => "tone",
            Self::Silence => "silence",
            Self::File => "file",
        }
    }
}

impl FromStr for SourceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tone" => Ok(Self::Tone),
            "silence" => Ok(Self::Silence),
            "file" => Ok(Self::File),
            other => Err(format!(
                "unknown source mode '{other}' (expected tone, silence or file)"
            )),
        }
    }
}

/// A fallback PCM producer in the graph's node registry.
///
/// Represented as a tagged sum rather than trait objects: the set of node
/// kinds is closed and the uniform contract is just `next_frame`.
#[derive(Debug)]
pub enum FallbackNode {
    File(FileSource),
    Tone(ToneSource),
    Silence,
}

impl FallbackNode {
    /// Produces the node's next frame. File and tone nodes are generative
    /// and total; only a degenerate (zero-length) file node returns `None`,
    /// which the graph maps to tone on the same boundary.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        match self {
            Self::File(file) => file.next_frame(),
            Self::Tone(tone) => Some(tone.next_frame()),
            Self::Silence => Some(silence_frame()),
        }
    }
}
