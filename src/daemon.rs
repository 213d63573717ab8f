//! Daemon - the kiosk service
//!
//! Wires the audio devices, stream clients and reasoning client into a
//! [`TurnController`], then drives turns from console input until interrupted.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use crate::avatar::{LogAvatar, run_avatar_bridge};
use crate::reasoning::HttpReasoningClient;
use crate::stream::{RecognitionStreamClient, SynthesisStreamClient, TranscriptEvent};
use crate::turn::{LifecycleEvent, Pipeline, TurnController, TurnHandle, TurnSettings, TurnState};
use crate::voice::{AudioCaptureBuffer, CpalCapture, CpalOutput};
use crate::{Config, Error, Result};

/// A line typed at the kiosk console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Empty line: start listening, or stop if already listening
    Toggle,
    Cancel,
    Persona(String),
    /// Anything else is a typed utterance
    Text(String),
}

impl ConsoleCommand {
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Toggle;
        }
        if line.eq_ignore_ascii_case("cancel") {
            return Self::Cancel;
        }
        if let Some(id) = line.strip_prefix("persona ") {
            let id = id.trim();
            if !id.is_empty() {
                return Self::Persona(id.to_string());
            }
        }
        Self::Text(line.to_string())
    }
}

/// The kiosk daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the kiosk until ctrl-c
    ///
    /// # Errors
    ///
    /// Returns error if the output device cannot be opened
    pub async fn run(self) -> Result<()> {
        let (controller, handle) = self.build_controller()?;
        let controller_task = tokio::spawn(controller.run());
        let avatar_task = tokio::spawn(run_avatar_bridge(LogAvatar, handle.subscribe()));
        let caption_task = tokio::spawn(log_captions(handle.subscribe()));

        handle.set_persona(self.config.persona_id.clone())?;
        tracing::info!(
            persona = %self.config.persona_id,
            session_id = %handle.session_id(),
            "kiosk ready - press Enter to talk, type to send text"
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut console_open = true;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                line = lines.next_line(), if console_open => match line {
                    Ok(Some(line)) => dispatch(&handle, ConsoleCommand::parse(&line))?,
                    Ok(None) => {
                        tracing::debug!("console closed");
                        console_open = false;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "console read failed");
                        console_open = false;
                    }
                },
            }
        }

        let _ = handle.shutdown();
        let _ = controller_task.await;
        drop(handle);
        avatar_task.abort();
        caption_task.abort();
        Ok(())
    }

    /// Run one text turn and wait for it to finish speaking
    ///
    /// # Errors
    ///
    /// Returns error if the output device cannot be opened or the turn fails
    pub async fn say(self, text: &str) -> Result<()> {
        let (controller, handle) = self.build_controller()?;
        let controller_task = tokio::spawn(controller.run());
        let mut events = handle.subscribe();

        handle.submit_text(text)?;
        let outcome = wait_for_idle(&mut events).await;

        let _ = handle.shutdown();
        let _ = controller_task.await;
        outcome
    }

    fn build_controller(&self) -> Result<(TurnController, TurnHandle)> {
        let output = CpalOutput::open(self.config.audio.playback_sample_rate)?;
        let capture = AudioCaptureBuffer::new(
            Box::new(CpalCapture::new()),
            self.config.audio.capture_sample_rate,
        );
        let pipeline = Pipeline {
            capture: Arc::new(capture),
            recognition: RecognitionStreamClient::from_config(&self.config),
            synthesis: SynthesisStreamClient::from_config(&self.config),
            reasoning: Arc::new(HttpReasoningClient::from_config(&self.config)),
            output: Arc::new(output),
        };
        Ok(TurnController::new(
            pipeline,
            TurnSettings::from_config(&self.config),
        ))
    }
}

fn dispatch(handle: &TurnHandle, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Toggle => {
            if handle.state() == TurnState::Listening {
                handle.end_turn()
            } else {
                handle.begin_turn()
            }
        }
        ConsoleCommand::Cancel => handle.cancel(),
        ConsoleCommand::Persona(id) => handle.set_persona(id),
        ConsoleCommand::Text(text) => handle.submit_text(text),
    }
}

/// Wait until the current turn returns to idle
async fn wait_for_idle(events: &mut broadcast::Receiver<LifecycleEvent>) -> Result<()> {
    let mut failure = None;
    loop {
        match events.recv().await {
            Ok(LifecycleEvent::TurnFailed { error, .. }) => failure = Some(error),
            Ok(LifecycleEvent::StateChanged {
                state: TurnState::Idle,
                ..
            }) => break,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return Err(Error::ControllerStopped),
        }
    }
    failure.map_or(Ok(()), |e| Err(Error::TurnFailed(e)))
}

/// Log captions and state changes for an operator watching the console
async fn log_captions(mut events: broadcast::Receiver<LifecycleEvent>) {
    loop {
        match events.recv().await {
            Ok(LifecycleEvent::Transcript { turn_id, event }) => match event {
                TranscriptEvent::Partial(text) => {
                    tracing::debug!(turn = turn_id, %text, "heard (partial)");
                }
                TranscriptEvent::Final(text) => tracing::info!(turn = turn_id, %text, "heard"),
            },
            Ok(LifecycleEvent::Reply { turn_id, text }) => {
                tracing::info!(turn = turn_id, %text, "reply");
            }
            Ok(LifecycleEvent::StateChanged { turn_id, state }) => {
                tracing::info!(turn = turn_id, %state, "turn state");
            }
            Ok(LifecycleEvent::TurnFailed { turn_id, error }) => {
                tracing::warn!(turn = turn_id, %error, "turn failed");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "caption log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
