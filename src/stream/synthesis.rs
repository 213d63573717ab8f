//! Streaming speech synthesis client

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::events::{
    SynthesisEvent, SynthesisRequest, decode_synthesis_binary, decode_synthesis_text,
};
use crate::Error;
use crate::config::Config;

/// Opens synthesis streams against a streaming TTS endpoint
#[derive(Debug, Clone)]
pub struct SynthesisStreamClient {
    url: String,
}

/// Cancels an in-flight synthesis stream
#[derive(Debug, Clone)]
pub struct SynthesisHandle {
    cancel: CancellationToken,
}

impl SynthesisHandle {
    /// Stop delivery of further events and close the connection
    ///
    /// Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether `cancel` has been called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl SynthesisStreamClient {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.endpoints.synthesis_url.clone())
    }

    /// Endpoint URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Synthesize `text`, streaming events back as they arrive
    ///
    /// Opens a fresh connection. The receiver yields `Meta`, then `Audio`
    /// frames in synthesis order, then exactly one `End` or `Error`, unless
    /// the handle is cancelled first. Connect failures arrive as `Error`.
    pub fn stream(
        &self,
        text: &str,
        voice: Option<&str>,
    ) -> (SynthesisHandle, mpsc::UnboundedReceiver<SynthesisEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let request = SynthesisRequest {
            text,
            voice_type: voice,
        };
        match serde_json::to_string(&request) {
            Ok(body) => {
                tokio::spawn(run_stream(self.url.clone(), body, tx, cancel.clone()));
            }
            Err(e) => {
                let _ = tx.send(SynthesisEvent::Error(e.to_string()));
            }
        }

        (SynthesisHandle { cancel }, rx)
    }
}

async fn run_stream(
    url: String,
    request: String,
    tx: mpsc::UnboundedSender<SynthesisEvent>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        () = cancel.cancelled() => return,
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
    };
    let ws = match connected {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!(%url, error = %e, "synthesis connect failed");
            let error = Error::StreamConnect(format!("{url}: {e}"));
            let _ = tx.send(SynthesisEvent::Error(error.to_string()));
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    if let Err(e) = sink.send(Message::Text(request)).await {
        let _ = tx.send(SynthesisEvent::Error(format!("request failed: {e}")));
        return;
    }
    tracing::debug!(%url, "synthesis request sent");

    let mut frames = 0usize;
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(frames, "synthesis stream cancelled");
                break;
            }
            msg = stream.next() => msg,
        };

        let decoded = match msg {
            Some(Ok(Message::Text(text))) => decode_synthesis_text(&text),
            Some(Ok(Message::Binary(data))) => decode_synthesis_binary(&data).map(Some),
            Some(Ok(Message::Close(_))) | None => Ok(Some(SynthesisEvent::Error(
                "stream closed before end".to_string(),
            ))),
            Some(Ok(_)) => continue,
            Some(Err(e)) => Ok(Some(SynthesisEvent::Error(e.to_string()))),
        };

        let event = match decoded {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring synthesis message");
                continue;
            }
        };

        match &event {
            SynthesisEvent::Audio(_) => frames += 1,
            SynthesisEvent::End => tracing::debug!(frames, "synthesis stream ended"),
            SynthesisEvent::Error(error) => {
                tracing::warn!(frames, %error, "synthesis stream failed");
            }
            SynthesisEvent::Meta(meta) => {
                tracing::debug!(
                    sample_rate = meta.sample_rate,
                    channels = meta.channels,
                    format = %meta.format,
                    "synthesis meta"
                );
            }
        }

        let terminal = event.is_terminal();
        if cancel.is_cancelled() || tx.send(event).is_err() || terminal {
            break;
        }
    }

    let _ = sink.close().await;
}
