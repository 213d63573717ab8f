//! Docent - conversational kiosk front-end
//!
//! This library provides the speech pipeline behind a museum-guide kiosk:
//! - Microphone capture and streaming speech recognition
//! - A reasoning call per utterance
//! - Streaming speech synthesis and gapless playback
//! - A turn state machine that keeps an avatar in sync
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │              Console  │  Avatar renderer              │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ commands / lifecycle events
//! ┌────────────────────▼─────────────────────────────────┐
//! │                 TurnController                        │
//! │ Listening → Recognizing → Thinking → Speaking → Idle  │
//! └──────┬──────────────────┬───────────────────┬────────┘
//!        │                  │                   │
//! ┌──────▼───────┐   ┌──────▼──────┐   ┌────────▼────────┐
//! │ Capture +    │   │  Reasoning  │   │  Synthesis +    │
//! │ Recognition  │   │   (HTTP)    │   │  PlaybackQueue  │
//! └──────────────┘   └─────────────┘   └─────────────────┘
//! ```

pub mod avatar;
pub mod config;
pub mod daemon;
pub mod error;
pub mod reasoning;
pub mod stream;
pub mod turn;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use turn::{LifecycleEvent, TurnController, TurnHandle, TurnState};
