//! Turn lifecycle types

use std::fmt;

use uuid::Uuid;

use crate::stream::TranscriptEvent;

/// Where the conversation currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnState {
    Idle,
    Listening,
    Recognizing,
    Thinking,
    Speaking,
    /// Transient; always followed by `Idle`
    Cancelled,
}

impl TurnState {
    /// Whether a turn is in progress
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Recognizing => "recognizing",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Conversation session, one per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: String,
}

impl Session {
    /// Start a session with a fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
        }
    }

    /// Opaque identifier attached to every reasoning request
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// One user utterance and the system's response to it
#[derive(Debug, Clone)]
pub struct Turn {
    id: u64,
    transcript: String,
    transcript_final: bool,
    output: Option<String>,
    state: TurnState,
}

impl Turn {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            transcript: String::new(),
            transcript_final: false,
            output: None,
            state: TurnState::Idle,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    #[must_use]
    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    pub const fn set_state(&mut self, state: TurnState) {
        self.state = state;
    }

    /// Replace the provisional transcript; ignored once finalized
    pub fn update_transcript(&mut self, text: &str) {
        if !self.transcript_final {
            text.clone_into(&mut self.transcript);
        }
    }

    /// Fix the transcript
    pub fn finalize_transcript(&mut self, text: &str) {
        text.clone_into(&mut self.transcript);
        self.transcript_final = true;
    }

    /// Set the response text; returns false if already set
    pub fn set_output(&mut self, text: &str) -> bool {
        if self.output.is_some() {
            return false;
        }
        self.output = Some(text.to_string());
        true
    }
}

/// Broadcast to the avatar renderer and any UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    StateChanged { turn_id: u64, state: TurnState },
    /// Caption text for the user's utterance
    Transcript { turn_id: u64, event: TranscriptEvent },
    /// Caption text for the system's reply
    Reply { turn_id: u64, text: String },
    /// Animation hint for the avatar
    AvatarState(String),
    /// Avatar asset set to switch to
    AvatarPersona { directory: String, prefix: String },
    TurnFailed { turn_id: u64, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 36);
    }

    #[test]
    fn test_transcript_frozen_after_final() {
        let mut turn = Turn::new(1);
        turn.update_transcript("你好");
        assert_eq!(turn.transcript(), "你好");
        turn.finalize_transcript("你好吗？");
        turn.update_transcript("late partial");
        assert_eq!(turn.transcript(), "你好吗？");
    }

    #[test]
    fn test_output_set_once() {
        let mut turn = Turn::new(1);
        assert!(turn.set_output("first"));
        assert!(!turn.set_output("second"));
        assert_eq!(turn.output(), Some("first"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TurnState::Recognizing.to_string(), "recognizing");
        assert!(!TurnState::Idle.is_active());
        assert!(TurnState::Cancelled.is_active());
    }
}
