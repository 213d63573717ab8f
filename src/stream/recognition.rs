//! Streaming speech recognition client
//!
//! One WebSocket per utterance. Captured audio is uploaded as fixed-size
//! little-endian PCM chunks on a timer; on stop, whatever is still buffered
//! is flushed, the stop sentinel is sent, and the session resolves with the
//! final transcript.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::events::{TranscriptEvent, decode_recognition_text};
use super::{CHUNK_INTERVAL, CHUNK_SAMPLES, STOP_SENTINEL};
use crate::config::Config;
use crate::voice::{AudioCaptureBuffer, encode_le};
use crate::Error;

/// Default time to wait for the final transcript after the sentinel
const DEFAULT_FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the WebSocket handshake
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Event observed while a recognition session is live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Transcript(TranscriptEvent),
    /// The service could not be reached or the stream broke
    Failed(String),
}

/// Lifecycle of a recognition session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Streaming,
    Finalizing,
    Closed,
}

/// Opens recognition sessions against a streaming ASR endpoint
#[derive(Debug, Clone)]
pub struct RecognitionStreamClient {
    url: String,
    chunk_samples: usize,
    chunk_interval: Duration,
    finalize_timeout: Duration,
    connect_timeout: Duration,
}

impl RecognitionStreamClient {
    /// Create a client for `url` with default chunking
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            chunk_samples: CHUNK_SAMPLES,
            chunk_interval: CHUNK_INTERVAL,
            finalize_timeout: DEFAULT_FINALIZE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Create a client from configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.endpoints.recognition_url.clone())
            .with_chunking(config.audio.chunk_samples, config.audio.chunk_interval)
            .with_finalize_timeout(config.timeouts.finalize)
    }

    /// Override chunk size and upload cadence
    #[must_use]
    pub fn with_chunking(mut self, samples: usize, interval: Duration) -> Self {
        self.chunk_samples = samples.max(1);
        if !interval.is_zero() {
            self.chunk_interval = interval;
        }
        self
    }

    /// Override how long to wait for the final transcript
    #[must_use]
    pub const fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    /// Override how long the WebSocket handshake may take
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Endpoint URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open a session streaming audio out of `capture`
    ///
    /// Returns immediately; the connection is made in the background.
    /// Transcript events and failures are delivered to `observer`. Capture
    /// must already be started by the caller; when the session finishes it
    /// stops capture, unless capture has been restarted for someone else
    /// in the meantime.
    pub fn start(
        &self,
        capture: Arc<AudioCaptureBuffer>,
        observer: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> RecognitionSession {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let cancel = CancellationToken::new();

        let worker = SessionWorker {
            url: self.url.clone(),
            chunk_samples: self.chunk_samples,
            chunk_interval: self.chunk_interval,
            finalize_timeout: self.finalize_timeout,
            connect_timeout: self.connect_timeout,
            epoch: capture.epoch(),
            capture,
            observer,
            state_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(async move {
            let text = worker.run(stop_rx).await;
            let _ = result_tx.send(text);
        });

        RecognitionSession {
            stop_tx: Some(stop_tx),
            result_rx: Some(result_rx),
            state_rx,
            cancel,
        }
    }
}

/// A live recognition session for one utterance
pub struct RecognitionSession {
    stop_tx: Option<oneshot::Sender<()>>,
    result_rx: Option<oneshot::Receiver<String>>,
    state_rx: watch::Receiver<SessionState>,
    cancel: CancellationToken,
}

impl RecognitionSession {
    /// Flush buffered audio, send the stop sentinel, and wait for the final
    /// transcript
    ///
    /// Resolves with the empty string if the stream closes or times out
    /// without a final transcript, or if the session was cancelled. Calling
    /// it again resolves immediately with the empty string.
    pub fn stop_and_finalize(&mut self) -> impl Future<Output = String> + Send + 'static {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let result_rx = self.result_rx.take();
        async move {
            match result_rx {
                Some(rx) => rx.await.unwrap_or_default(),
                None => String::new(),
            }
        }
    }

    /// Abandon the session without waiting for a result
    ///
    /// Idempotent. Stops capture and closes the connection.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        if self.stop_tx.is_some() {
            self.cancel.cancel();
        }
    }
}

enum Interrupt {
    Cancelled,
    Stop,
    /// The service ended the stream before stop; carries any final text
    Ended(Option<String>),
}

struct SessionWorker {
    url: String,
    chunk_samples: usize,
    chunk_interval: Duration,
    finalize_timeout: Duration,
    connect_timeout: Duration,
    /// Capture epoch this session streams from
    epoch: u64,
    capture: Arc<AudioCaptureBuffer>,
    observer: mpsc::UnboundedSender<RecognitionEvent>,
    state_tx: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl SessionWorker {
    async fn run(self, mut stop_rx: oneshot::Receiver<()>) -> String {
        let (connected, stop_requested) = self.connect(&mut stop_rx).await;
        let ws = match connected {
            None => {
                self.close();
                return String::new();
            }
            Some(Ok(ws)) => ws,
            Some(Err(reason)) => {
                tracing::warn!(url = %self.url, error = %reason, "recognition connect failed");
                let error = Error::StreamConnect(format!("{}: {reason}", self.url));
                let _ = self.observer.send(RecognitionEvent::Failed(error.to_string()));
                self.close();
                return String::new();
            }
        };
        tracing::debug!(url = %self.url, "recognition stream connected");
        self.state_tx.send_replace(SessionState::Streaming);

        let (mut sink, stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(error = %e, "recognition upload stopped");
                    return;
                }
            }
            let _ = sink.close().await;
        });
        let mut reader = tokio::spawn(read_transcripts(stream, self.observer.clone()));

        let mut ticker = tokio::time::interval(self.chunk_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        let interrupt = loop {
            // Stop arrived during the handshake: go straight to the flush
            if stop_requested {
                break Interrupt::Stop;
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break Interrupt::Cancelled,
                stop = &mut stop_rx => {
                    break if stop.is_ok() { Interrupt::Stop } else { Interrupt::Cancelled };
                }
                ended = &mut reader => break Interrupt::Ended(ended.ok().flatten()),
                _ = ticker.tick() => {
                    let pcm = self.capture.pull(self.chunk_samples);
                    if !pcm.is_empty() {
                        let _ = out_tx.send(Message::Binary(encode_le(&pcm)));
                    }
                }
            }
        };

        let text = match interrupt {
            Interrupt::Cancelled => {
                tracing::debug!("recognition session cancelled");
                reader.abort();
                String::new()
            }
            Interrupt::Stop => self.finalize(&out_tx, reader).await,
            Interrupt::Ended(text) => {
                if text.is_none() {
                    tracing::warn!("recognition stream closed before final transcript");
                }
                // Hold the result until the caller stops or cancels
                tokio::select! {
                    () = self.cancel.cancelled() => String::new(),
                    _ = stop_rx => text.unwrap_or_default(),
                }
            }
        };

        drop(out_tx);
        if tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .is_err()
        {
            tracing::debug!("recognition writer did not close in time");
        }
        self.close();
        text
    }

    /// Open the WebSocket, watching for cancel and stop
    ///
    /// The handshake is bounded by the connect timeout, and once stop is
    /// requested also by the finalize timeout. Returns `None` if cancelled,
    /// plus whether stop was requested meanwhile.
    async fn connect(
        &self,
        stop_rx: &mut oneshot::Receiver<()>,
    ) -> (Option<Result<WsStream, String>>, bool) {
        let handshake = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        );
        tokio::pin!(handshake);

        let (result, stop_requested) = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return (None, false),
            stop = &mut *stop_rx => {
                if stop.is_err() {
                    return (None, false);
                }
                tracing::debug!("stop requested while connecting");
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return (None, true),
                    result = tokio::time::timeout(self.finalize_timeout, &mut handshake) => {
                        (result.unwrap_or_else(Err), true)
                    }
                }
            }
            result = &mut handshake => (result, false),
        };

        let ws = match result {
            Ok(Ok((ws, _))) => Ok(ws),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("handshake timed out".to_string()),
        };
        (Some(ws), stop_requested)
    }

    async fn finalize(
        &self,
        out_tx: &mpsc::UnboundedSender<Message>,
        mut reader: JoinHandle<Option<String>>,
    ) -> String {
        self.state_tx.send_replace(SessionState::Finalizing);

        let mut flushed = 0usize;
        while self.capture.epoch() == self.epoch && self.capture.available() > 0 {
            let pcm = self.capture.pull(self.chunk_samples);
            let _ = out_tx.send(Message::Binary(encode_le(&pcm)));
            flushed += 1;
        }
        self.capture.release(self.epoch);
        let _ = out_tx.send(Message::Binary(STOP_SENTINEL.to_vec()));
        tracing::debug!(flushed_chunks = flushed, "recognition stop sentinel sent");

        tokio::select! {
            () = self.cancel.cancelled() => {
                reader.abort();
                String::new()
            }
            result = tokio::time::timeout(self.finalize_timeout, &mut reader) => match result {
                Ok(Ok(Some(text))) => text,
                Ok(_) => {
                    tracing::warn!("recognition stream closed before final transcript");
                    String::new()
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.finalize_timeout.as_millis(),
                        "timed out waiting for final transcript"
                    );
                    reader.abort();
                    String::new()
                }
            },
        }
    }

    fn close(&self) {
        self.capture.release(self.epoch);
        self.state_tx.send_replace(SessionState::Closed);
    }
}

/// Forward transcript events until the final one; returns its text
async fn read_transcripts<S>(
    mut stream: S,
    observer: mpsc::UnboundedSender<RecognitionEvent>,
) -> Option<String>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match decode_recognition_text(&text) {
                Ok(TranscriptEvent::Final(text)) => {
                    let _ = observer.send(RecognitionEvent::Transcript(TranscriptEvent::Final(
                        text.clone(),
                    )));
                    return Some(text);
                }
                Ok(event) => {
                    let _ = observer.send(RecognitionEvent::Transcript(event));
                }
                Err(e) => tracing::warn!(error = %e, "ignoring recognition message"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "recognition stream error");
                let _ = observer.send(RecognitionEvent::Failed(e.to_string()));
                break;
            }
        }
    }
    None
}
