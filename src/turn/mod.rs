//! Conversation turns: state machine and orchestration

mod controller;
mod state;

pub use controller::{IDLE_HINT, Pipeline, TurnController, TurnHandle, TurnSettings};
pub use state::{LifecycleEvent, Session, Turn, TurnState};
