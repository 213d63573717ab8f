//! Turn orchestration
//!
//! A single coordinating task owns the session and the active turn. It
//! selects over commands from [`TurnHandle`]s, results of the work it spawns
//! (each tagged with the turn that spawned it), and playback completions.
//! Results tagged with a superseded turn are dropped, so audio from a
//! cancelled turn never reaches the playback queue.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::state::{LifecycleEvent, Session, Turn, TurnState};
use crate::config::{Config, DEFAULT_PERSONA};
use crate::reasoning::{ReasoningClient, ReasoningReply, ReasoningRequest};
use crate::stream::{
    RecognitionEvent, RecognitionSession, RecognitionStreamClient, SynthesisEvent,
    SynthesisHandle, SynthesisStreamClient, TranscriptEvent,
};
use crate::voice::{AudioCaptureBuffer, OutputDevice, PlaybackFinished, PlaybackQueue};
use crate::{Error, Result};

/// Avatar hint shown whenever the conversation returns to idle
pub const IDLE_HINT: &str = "IDLE";

const EVENT_CAPACITY: usize = 256;

/// Components the controller drives
pub struct Pipeline {
    pub capture: Arc<AudioCaptureBuffer>,
    pub recognition: RecognitionStreamClient,
    pub synthesis: SynthesisStreamClient,
    pub reasoning: Arc<dyn ReasoningClient>,
    pub output: Arc<dyn OutputDevice>,
}

/// Per-session behavior
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub persona_id: String,
    /// Voice used unless a reply names one
    pub voice_type: Option<String>,
    pub reasoning_timeout: Duration,
    /// Longest gap allowed between synthesis events
    pub synthesis_idle_timeout: Duration,
    pub playback_sample_rate: u32,
}

impl TurnSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            persona_id: config.persona_id.clone(),
            voice_type: config.voice.voice_type.clone(),
            reasoning_timeout: config.timeouts.reasoning,
            synthesis_idle_timeout: config.timeouts.synthesis_idle,
            playback_sample_rate: config.audio.playback_sample_rate,
        }
    }
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug)]
enum Command {
    BeginTurn,
    EndTurn,
    SubmitText(String),
    Cancel,
    SetPersona(String),
    Shutdown,
}

/// Results of spawned work, tagged with the turn that started it
#[derive(Debug)]
enum Internal {
    CaptureOpened { turn_id: u64, result: Result<()> },
    Transcript { turn_id: u64, event: TranscriptEvent },
    RecognitionFailed { turn_id: u64, error: String },
    Recognized { turn_id: u64, text: String },
    Replied { turn_id: u64, result: Result<ReasoningReply> },
    Synthesis { turn_id: u64, event: SynthesisEvent },
}

/// Cloneable front-end to a running [`TurnController`]
#[derive(Clone)]
pub struct TurnHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<LifecycleEvent>,
    state: watch::Receiver<TurnState>,
    session_id: String,
}

impl TurnHandle {
    /// Start listening for a new utterance, cancelling any active turn
    ///
    /// The state becomes `Listening` once the microphone is open.
    ///
    /// # Errors
    ///
    /// Returns `ControllerStopped` if the controller has exited
    pub fn begin_turn(&self) -> Result<()> {
        self.send(Command::BeginTurn)
    }

    /// Stop listening and process what was heard; ignored unless listening
    ///
    /// # Errors
    ///
    /// Returns `ControllerStopped` if the controller has exited
    pub fn end_turn(&self) -> Result<()> {
        self.send(Command::EndTurn)
    }

    /// Start a turn from typed text, skipping recognition
    ///
    /// # Errors
    ///
    /// Returns `ControllerStopped` if the controller has exited
    pub fn submit_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::SubmitText(text.into()))
    }

    /// Abandon the active turn; no-op when idle
    ///
    /// # Errors
    ///
    /// Returns `ControllerStopped` if the controller has exited
    pub fn cancel(&self) -> Result<()> {
        self.send(Command::Cancel)
    }

    /// Switch persona for subsequent reasoning requests and the avatar
    ///
    /// # Errors
    ///
    /// Returns `ControllerStopped` if the controller has exited
    pub fn set_persona(&self, persona_id: impl Into<String>) -> Result<()> {
        self.send(Command::SetPersona(persona_id.into()))
    }

    /// Cancel any active turn and stop the controller
    ///
    /// # Errors
    ///
    /// Returns `ControllerStopped` if the controller has already exited
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    /// Receive lifecycle events from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<TurnState> {
        self.state.clone()
    }

    /// Session identifier attached to reasoning requests
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::ControllerStopped)
    }
}

struct ActiveTurn {
    turn: Turn,
    /// Stops every task spawned for this turn
    cancel: CancellationToken,
    recognition: Option<RecognitionSession>,
    /// Hands the pending transcript to the recognition forwarder
    finalize_tx: Option<oneshot::Sender<BoxFuture<'static, String>>>,
    synthesis: Option<SynthesisHandle>,
    frames_queued: usize,
    stream_ended: bool,
    /// Microphone open requested but not yet reported
    awaiting_capture: bool,
}

impl ActiveTurn {
    fn new(turn_id: u64) -> Self {
        Self {
            turn: Turn::new(turn_id),
            cancel: CancellationToken::new(),
            recognition: None,
            finalize_tx: None,
            synthesis: None,
            frames_queued: 0,
            stream_ended: false,
            awaiting_capture: false,
        }
    }

    fn stop_work(&mut self) {
        self.cancel.cancel();
        if let Some(session) = self.recognition.take() {
            session.cancel();
        }
        if let Some(handle) = self.synthesis.take() {
            handle.cancel();
        }
    }
}

/// Drives the listen, recognize, think, speak cycle for one session
pub struct TurnController {
    pipeline: Pipeline,
    settings: TurnSettings,
    session: Session,
    playback: PlaybackQueue,
    playback_rx: mpsc::UnboundedReceiver<PlaybackFinished>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: broadcast::Sender<LifecycleEvent>,
    state_tx: watch::Sender<TurnState>,
    next_turn_id: u64,
    active: Option<ActiveTurn>,
}

impl TurnController {
    /// Create a controller and the handle used to drive it
    ///
    /// Nothing happens until [`TurnController::run`] is awaited.
    #[must_use]
    pub fn new(pipeline: Pipeline, mut settings: TurnSettings) -> (Self, TurnHandle) {
        if settings.persona_id.is_empty() {
            DEFAULT_PERSONA.clone_into(&mut settings.persona_id);
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(TurnState::Idle);
        let (playback, playback_rx) = PlaybackQueue::new(Arc::clone(&pipeline.output));
        let session = Session::new();

        let handle = TurnHandle {
            commands: command_tx,
            events: events.clone(),
            state: state_rx,
            session_id: session.id().to_string(),
        };
        let controller = Self {
            pipeline,
            settings,
            session,
            playback,
            playback_rx,
            commands: command_rx,
            internal_tx,
            internal_rx,
            events,
            state_tx,
            next_turn_id: 1,
            active: None,
        };
        (controller, handle)
    }

    /// Run until shut down or every handle is dropped
    pub async fn run(mut self) {
        tracing::info!(
            session_id = %self.session.id(),
            persona = %self.settings.persona_id,
            "turn controller started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(msg) = self.internal_rx.recv() => self.handle_internal(msg),
                Some(done) = self.playback_rx.recv() => self.handle_playback_finished(done),
            }
        }

        self.cancel_active();
        tracing::info!(session_id = %self.session.id(), "turn controller stopped");
    }

    fn handle_command(&mut self, command: Command) {
        tracing::debug!(?command, "turn command");
        match command {
            Command::BeginTurn => self.begin_turn(),
            Command::EndTurn => self.end_turn(),
            Command::SubmitText(text) => self.submit_text(&text),
            Command::Cancel => self.cancel_active(),
            Command::SetPersona(persona_id) => self.set_persona(persona_id),
            Command::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::CaptureOpened { turn_id, result } => self.capture_opened(turn_id, result),
            Internal::Transcript { turn_id, event } => {
                let Some(active) = self.active_for(turn_id) else {
                    return;
                };
                if let TranscriptEvent::Partial(text) = &event {
                    active.turn.update_transcript(text);
                }
                self.emit(LifecycleEvent::Transcript { turn_id, event });
            }
            Internal::RecognitionFailed { turn_id, error } => {
                if self.in_state(turn_id, &[TurnState::Listening, TurnState::Recognizing]) {
                    self.fail_turn(turn_id, &error);
                }
            }
            Internal::Recognized { turn_id, text } => {
                if self.in_state(turn_id, &[TurnState::Recognizing]) {
                    self.recognized(turn_id, &text);
                }
            }
            Internal::Replied { turn_id, result } => {
                if !self.in_state(turn_id, &[TurnState::Thinking]) {
                    return;
                }
                match result {
                    Ok(reply) => self.replied(turn_id, &reply),
                    Err(e) => self.fail_turn(turn_id, &e.to_string()),
                }
            }
            Internal::Synthesis { turn_id, event } => {
                if self.in_state(turn_id, &[TurnState::Speaking]) {
                    self.synthesis_event(turn_id, event);
                }
            }
        }
    }

    fn begin_turn(&mut self) {
        self.cancel_active();

        let turn_id = self.allocate_turn_id();
        let mut active = ActiveTurn::new(turn_id);
        active.awaiting_capture = true;
        self.active = Some(active);

        // Opening a device can block for a while; keep it off this task
        let capture = Arc::clone(&self.pipeline.capture);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || capture.start())
                .await
                .unwrap_or_else(|e| Err(Error::DeviceUnavailable(e.to_string())));
            let _ = internal.send(Internal::CaptureOpened { turn_id, result });
        });
    }

    fn capture_opened(&mut self, turn_id: u64, result: Result<()>) {
        let pending = self
            .active
            .as_ref()
            .is_some_and(|a| a.turn.id() == turn_id && a.awaiting_capture);
        if !pending {
            // Superseded while opening; release the device unless a live
            // voice turn is relying on it
            if result.is_ok() && !self.capture_in_use() {
                self.pipeline.capture.stop();
            }
            return;
        }

        if let Err(e) = result {
            tracing::warn!(turn = turn_id, error = %e, "capture unavailable");
            self.fail_turn(turn_id, &e.to_string());
            return;
        }

        let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
        let session = self
            .pipeline
            .recognition
            .start(Arc::clone(&self.pipeline.capture), observer_tx);

        // Events and the final transcript share one task so a failure is
        // always seen before the empty result that follows it
        let (finalize_tx, finalize_rx) = oneshot::channel::<BoxFuture<'static, String>>();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = observer_rx.recv().await {
                let msg = match event {
                    RecognitionEvent::Transcript(event) => Internal::Transcript { turn_id, event },
                    RecognitionEvent::Failed(error) => Internal::RecognitionFailed { turn_id, error },
                };
                if internal.send(msg).is_err() {
                    return;
                }
            }
            if let Ok(finalize) = finalize_rx.await {
                let text = finalize.await;
                let _ = internal.send(Internal::Recognized { turn_id, text });
            }
        });

        if let Some(active) = self.active.as_mut() {
            active.awaiting_capture = false;
            active.recognition = Some(session);
            active.finalize_tx = Some(finalize_tx);
        }
        self.transition(TurnState::Listening);
    }

    /// Whether the active turn owns the microphone
    fn capture_in_use(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.awaiting_capture || a.recognition.is_some())
    }

    fn end_turn(&mut self) {
        let Some(active) = self.active.as_mut() else {
            tracing::debug!("end_turn ignored: idle");
            return;
        };
        if active.turn.state() != TurnState::Listening {
            tracing::debug!(state = %active.turn.state(), "end_turn ignored");
            return;
        }
        let Some(session) = active.recognition.as_mut() else {
            return;
        };

        let finalize = session.stop_and_finalize();
        if let Some(finalize_tx) = active.finalize_tx.take() {
            let _ = finalize_tx.send(Box::pin(finalize));
        }
        self.transition(TurnState::Recognizing);
    }

    fn submit_text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            tracing::debug!("empty text turn ignored");
            return;
        }
        self.cancel_active();

        let turn_id = self.allocate_turn_id();
        let mut active = ActiveTurn::new(turn_id);
        active.turn.finalize_transcript(text);
        self.active = Some(active);
        self.emit(LifecycleEvent::Transcript {
            turn_id,
            event: TranscriptEvent::Final(text.to_string()),
        });
        self.start_thinking(turn_id, text);
    }

    fn set_persona(&mut self, persona_id: String) {
        let persona_id = persona_id.trim().to_string();
        if persona_id.is_empty() {
            tracing::warn!("ignoring empty persona id");
            return;
        }
        tracing::info!(persona = %persona_id, "persona switched");
        self.emit(LifecycleEvent::AvatarPersona {
            directory: persona_id.clone(),
            prefix: persona_id.clone(),
        });
        self.emit(LifecycleEvent::AvatarState(IDLE_HINT.to_string()));
        self.settings.persona_id = persona_id;
    }

    fn recognized(&mut self, turn_id: u64, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            tracing::debug!(turn = turn_id, "empty recognition, nothing to answer");
            self.finish_turn();
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.turn.finalize_transcript(text);
            active.recognition = None;
        }
        tracing::info!(turn = turn_id, transcript = %text, "utterance recognized");
        self.start_thinking(turn_id, text);
    }

    fn start_thinking(&mut self, turn_id: u64, text: &str) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let request = ReasoningRequest {
            text: text.to_string(),
            persona_id: self.settings.persona_id.clone(),
            session_id: self.session.id().to_string(),
        };
        let reasoning = Arc::clone(&self.pipeline.reasoning);
        let timeout = self.settings.reasoning_timeout;
        let cancel = active.cancel.clone();
        let internal = self.internal_tx.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = tokio::time::timeout(timeout, reasoning.respond(&request)) => result,
            };
            let result = result.unwrap_or_else(|_| {
                Err(Error::Timeout(format!(
                    "reasoning reply after {}s",
                    timeout.as_secs()
                )))
            });
            let _ = internal.send(Internal::Replied { turn_id, result });
        });
        self.transition(TurnState::Thinking);
    }

    fn replied(&mut self, turn_id: u64, reply: &ReasoningReply) {
        if let Some((directory, prefix)) = reply.persona_switch() {
            self.emit(LifecycleEvent::AvatarPersona { directory, prefix });
        }
        if !reply.video_state.is_empty() {
            self.emit(LifecycleEvent::AvatarState(reply.video_state.clone()));
        }

        let text = reply.tts_text.trim();
        if text.is_empty() {
            tracing::debug!(turn = turn_id, "reply has nothing to say");
            self.finish_turn();
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.turn.set_output(text);
        }
        self.emit(LifecycleEvent::Reply {
            turn_id,
            text: text.to_string(),
        });

        let voice = reply
            .voice_or(self.settings.voice_type.as_deref())
            .map(str::to_string);
        self.start_speaking(turn_id, text, voice.as_deref());
    }

    fn start_speaking(&mut self, turn_id: u64, text: &str, voice: Option<&str>) {
        let (handle, mut events) = self.pipeline.synthesis.stream(text, voice);
        let Some(active) = self.active.as_mut() else {
            handle.cancel();
            return;
        };

        let cancel = active.cancel.clone();
        let idle_timeout = self.settings.synthesis_idle_timeout;
        let internal = self.internal_tx.clone();
        let stream = handle.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = tokio::time::timeout(idle_timeout, events.recv()) => event,
                };
                let event = match event {
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                    Err(_) => {
                        stream.cancel();
                        SynthesisEvent::Error(format!(
                            "no synthesis data for {}s",
                            idle_timeout.as_secs()
                        ))
                    }
                };
                let terminal = event.is_terminal();
                if internal.send(Internal::Synthesis { turn_id, event }).is_err() || terminal {
                    break;
                }
            }
        });

        active.synthesis = Some(handle);
        active.frames_queued = 0;
        active.stream_ended = false;
        self.transition(TurnState::Speaking);
    }

    fn synthesis_event(&mut self, turn_id: u64, event: SynthesisEvent) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match event {
            SynthesisEvent::Meta(meta) => {
                if meta.sample_rate != self.settings.playback_sample_rate {
                    tracing::warn!(
                        turn = turn_id,
                        stream_rate = meta.sample_rate,
                        playback_rate = self.settings.playback_sample_rate,
                        "synthesis sample rate differs from playback rate"
                    );
                }
            }
            SynthesisEvent::Audio(frame) => {
                active.frames_queued += 1;
                self.playback.enqueue(frame);
            }
            SynthesisEvent::End => {
                active.stream_ended = true;
                active.synthesis = None;
                tracing::debug!(
                    turn = turn_id,
                    frames = active.frames_queued,
                    "synthesis complete"
                );
                self.finish_if_drained();
            }
            SynthesisEvent::Error(error) => {
                active.stream_ended = true;
                active.synthesis = None;
                if active.frames_queued == 0 {
                    self.fail_turn(turn_id, &error);
                } else {
                    tracing::warn!(
                        turn = turn_id,
                        %error,
                        "synthesis stream failed, draining queued audio"
                    );
                    self.finish_if_drained();
                }
            }
        }
    }

    fn handle_playback_finished(&mut self, done: PlaybackFinished) {
        if done.generation != self.playback.generation() {
            return;
        }
        if self
            .active
            .as_ref()
            .is_some_and(|a| a.turn.state() == TurnState::Speaking)
        {
            self.finish_if_drained();
        }
    }

    /// Return to idle once the stream has ended and every frame has played
    fn finish_if_drained(&mut self) {
        let ended = self.active.as_ref().is_some_and(|a| a.stream_ended);
        if ended && !self.playback.is_playing() && self.playback.pending_len() == 0 {
            self.finish_turn();
        }
    }

    fn fail_turn(&mut self, turn_id: u64, error: &str) {
        tracing::warn!(turn = turn_id, %error, "turn failed");
        self.emit(LifecycleEvent::TurnFailed {
            turn_id,
            error: error.to_string(),
        });
        if let Some(active) = self.active.as_mut() {
            active.stop_work();
        }
        self.pipeline.capture.stop();
        self.playback.reset();
        self.finish_turn();
    }

    fn cancel_active(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.stop_work();
        self.pipeline.capture.stop();
        self.playback.reset();
        tracing::info!(turn = active.turn.id(), state = %active.turn.state(), "turn cancelled");
        self.transition(TurnState::Cancelled);
        self.finish_turn();
    }

    fn finish_turn(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.stop_work();
        let turn_id = active.turn.id();
        tracing::debug!(
            turn = turn_id,
            transcript = %active.turn.transcript(),
            replied = active.turn.output().is_some(),
            "turn finished"
        );
        self.state_tx.send_replace(TurnState::Idle);
        self.emit(LifecycleEvent::StateChanged {
            turn_id,
            state: TurnState::Idle,
        });
        self.emit(LifecycleEvent::AvatarState(IDLE_HINT.to_string()));
    }

    fn transition(&mut self, state: TurnState) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.turn.set_state(state);
        let turn_id = active.turn.id();
        tracing::debug!(turn = turn_id, %state, "turn state");
        self.state_tx.send_replace(state);
        self.emit(LifecycleEvent::StateChanged { turn_id, state });
    }

    fn active_for(&mut self, turn_id: u64) -> Option<&mut ActiveTurn> {
        self.active.as_mut().filter(|a| a.turn.id() == turn_id)
    }

    fn in_state(&self, turn_id: u64, states: &[TurnState]) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.turn.id() == turn_id && states.contains(&a.turn.state()))
    }

    const fn allocate_turn_id(&mut self) -> u64 {
        let id = self.next_turn_id;
        self.next_turn_id += 1;
        id
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
