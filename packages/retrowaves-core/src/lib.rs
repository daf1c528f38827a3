//! Retrowaves Core - shared protocol library for the Retrowaves radio stack.
//!
//! This crate holds the small set of definitions that both processes of the
//! stack (`retrowaves-station`, the DJ brain, and `retrowaves-tower`, the
//! transmitter) must agree on:
//!
//! - [`protocol_constants`]: the fixed PCM frame unit and timing math
//! - [`audio`]: audio format description, silence frames, PCM fades
//! - [`frame`]: byte-stream alignment to exact PCM frame units
//! - [`events`]: the closed Station → Tower event schema
//! - [`time`]: wall-clock and uptime helpers
//!
//! Everything else (source selection, encoder supervision, scheduling)
//! lives in the owning binary crate. Nothing in this crate performs I/O.

#![warn(clippy::all)]

pub mod audio;
pub mod events;
pub mod frame;
pub mod logging;
pub mod protocol_constants;
pub mod time;

// Re-export commonly used types at the crate root
pub use audio::AudioFormat;
pub use events::{EventPayload, ProductionType, SegmentClass, SegmentRole, StationEvent};
pub use frame::{pad_to_frame, FrameAssembler};
pub use logging::LogSampler;
pub use protocol_constants::{FRAME_DURATION, PCM_FRAME_BYTES};
pub use time::{now_millis, Uptime};
