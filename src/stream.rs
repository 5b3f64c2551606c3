//! Stream decoding pipeline: chunk framing and event classification
//!
//! The agent subprocess emits line-delimited JSON on stdout. Chunks arrive
//! with no alignment to line or object boundaries, so decoding is split in
//! two stages: [`FrameReader`] reassembles complete JSON-line frames from
//! arbitrary chunks, and [`classify_line`] maps each frame to typed
//! [`StreamEvent`]s.

mod classify;
mod frames;

#[cfg(test)]
mod proptests;

pub use classify::{classify_line, ParseError, StreamEvent, UsageDelta};
pub use frames::{FrameError, FrameReader, MAX_FRAME_BUFFER};
