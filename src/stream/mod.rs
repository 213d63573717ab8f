//! Recognition and synthesis WebSocket streams
//!
//! Both streams decode service messages once, at the boundary, into the
//! typed events in [`events`].

pub mod events;
mod recognition;
mod synthesis;

use std::time::Duration;

pub use events::{StreamMeta, SynthesisEvent, TranscriptEvent};
pub use recognition::{
    RecognitionEvent, RecognitionSession, RecognitionStreamClient, SessionState,
};
pub use synthesis::{SynthesisHandle, SynthesisStreamClient};

/// Samples per uploaded chunk (100ms at 16kHz)
pub const CHUNK_SAMPLES: usize = 1600;

/// Upload cadence
pub const CHUNK_INTERVAL: Duration = Duration::from_millis(100);

/// Single-byte message marking end of recognition input
pub const STOP_SENTINEL: [u8; 1] = [0x00];
