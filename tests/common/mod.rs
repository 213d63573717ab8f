//! Shared test utilities
//!
//! Fake devices and in-process services so the pipeline runs without audio
//! hardware or network dependencies.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use docent::reasoning::{ReasoningClient, ReasoningReply, ReasoningRequest};
use docent::stream::{RecognitionStreamClient, SynthesisStreamClient};
use docent::turn::{Pipeline, TurnController, TurnHandle, TurnSettings, TurnState};
use docent::voice::{AudioCaptureBuffer, AudioFrame, CaptureSource, FrameDone, OutputDevice, SampleSink};
use docent::{Error, Result};

/// Default bound on every wait in these tests
pub const WAIT: Duration = Duration::from_secs(5);

/// Capture source fed by the test
#[derive(Clone, Default)]
pub struct ManualCapture {
    sink: Arc<Mutex<Option<SampleSink>>>,
    open_delay: Duration,
}

impl ManualCapture {
    /// A source whose `open` blocks for `delay`, like a slow audio backend
    pub fn slow(delay: Duration) -> Self {
        Self {
            open_delay: delay,
            ..Self::default()
        }
    }

    pub fn push(&self, samples: Vec<i16>) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.push(samples);
        }
    }

    pub fn is_open(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }
}

impl CaptureSource for ManualCapture {
    fn open(&mut self, _sample_rate: u32, sink: SampleSink) -> Result<()> {
        if !self.open_delay.is_zero() {
            std::thread::sleep(self.open_delay);
        }
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn close(&mut self) {
        self.sink.lock().unwrap().take();
    }
}

/// Output device whose frames finish only when the test says so
#[derive(Default)]
pub struct ManualOutput {
    in_flight: Mutex<Option<(AudioFrame, FrameDone)>>,
    played: Mutex<Vec<AudioFrame>>,
}

impl ManualOutput {
    /// First sample of every frame handed to the device, in order
    pub fn played_tags(&self) -> Vec<i16> {
        self.played
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.samples()[0])
            .collect()
    }

    /// Tag of the frame currently playing
    pub fn in_flight_tag(&self) -> Option<i16> {
        self.in_flight
            .lock()
            .unwrap()
            .as_ref()
            .map(|(f, _)| f.samples()[0])
    }

    /// Wait until a frame with `tag` is playing
    pub async fn wait_playing(&self, tag: i16) {
        tokio::time::timeout(WAIT, async {
            while self.in_flight_tag() != Some(tag) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("frame {tag} never started playing"));
    }

    /// Report the in-flight frame as finished
    pub fn complete(&self) {
        let current = self.in_flight.lock().unwrap().take();
        if let Some((_, done)) = current {
            done(Ok(()));
        }
    }
}

impl OutputDevice for ManualOutput {
    fn play(&self, frame: AudioFrame, done: FrameDone) -> Result<()> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight.is_some() {
            return Err(Error::PlaybackDevice("frame already in flight".to_string()));
        }
        self.played.lock().unwrap().push(frame.clone());
        *in_flight = Some((frame, done));
        Ok(())
    }

    fn stop(&self) {
        self.in_flight.lock().unwrap().take();
    }
}

type Responder = Box<dyn Fn(&ReasoningRequest) -> Result<ReasoningReply> + Send + Sync>;

/// Reasoning client answering from a closure and recording requests
pub struct FakeReasoning {
    respond: Responder,
    delay: Duration,
    requests: Mutex<Vec<ReasoningRequest>>,
}

impl FakeReasoning {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&ReasoningRequest) -> Result<ReasoningReply> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer only after `delay`
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Always reply with `tts_text`
    pub fn saying(tts_text: &str) -> Self {
        let text = tts_text.to_string();
        Self::new(move |_| Ok(reply(&text)))
    }

    pub fn requests(&self) -> Vec<ReasoningRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningClient for FakeReasoning {
    async fn respond(&self, request: &ReasoningRequest) -> Result<ReasoningReply> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(request)
    }
}

pub fn reply(tts_text: &str) -> ReasoningReply {
    ReasoningReply {
        tts_text: tts_text.to_string(),
        video_state: "TALK".to_string(),
        ..ReasoningReply::default()
    }
}

/// `n` samples all equal to `tag`, as a binary PCM message
pub fn tagged_pcm(tag: i16, n: usize) -> Message {
    Message::Binary(vec![tag; n].iter().flat_map(|s| s.to_le_bytes()).collect())
}

pub fn meta_message() -> Message {
    Message::Text(r#"{"type":"meta","format":"pcm_s16le","sample_rate":24000,"channels":1}"#.to_string())
}

pub fn end_message() -> Message {
    Message::Text(r#"{"type":"end"}"#.to_string())
}

/// Recognition service: for every connection, collect binary message sizes
/// until the stop sentinel, then send `replies`
pub struct RecognitionServer {
    pub url: String,
    uploads: Arc<Mutex<Vec<Vec<usize>>>>,
}

impl RecognitionServer {
    pub async fn start(replies: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let uploads = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&uploads);

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let replies = replies.clone();
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    let mut sizes = Vec::new();
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Binary(data) = msg {
                            sizes.push(data.len());
                            if data.len() == 1 {
                                break;
                            }
                        }
                    }
                    recorded.lock().unwrap().push(sizes);
                    for reply in replies {
                        if ws.send(Message::Text(reply)).await.is_err() {
                            return;
                        }
                    }
                    let _ = ws.close(None).await;
                });
            }
        });

        Self { url, uploads }
    }

    /// Binary message sizes per finished connection
    pub fn uploads(&self) -> Vec<Vec<usize>> {
        self.uploads.lock().unwrap().clone()
    }
}

/// What the synthesis server does on one connection
#[derive(Clone)]
pub enum Step {
    Send(Message),
    Pause(Duration),
    /// Keep the connection open without sending anything more
    Hold,
}

/// Synthesis service: each connection plays the next script in line
pub struct SynthesisServer {
    pub url: String,
    requests: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl SynthesisServer {
    pub async fn start(scripts: Vec<Vec<Step>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);
        let scripts = Arc::new(Mutex::new(VecDeque::from(scripts)));

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let script = scripts.lock().unwrap().pop_front().unwrap_or_default();
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    if let Some(Ok(Message::Text(request))) = ws.next().await {
                        if let Ok(value) = serde_json::from_str(&request) {
                            recorded.lock().unwrap().push(value);
                        }
                    }
                    for step in script {
                        match step {
                            Step::Send(msg) => {
                                if ws.send(msg).await.is_err() {
                                    return;
                                }
                            }
                            Step::Pause(d) => tokio::time::sleep(d).await,
                            Step::Hold => {
                                while let Some(Ok(_)) = ws.next().await {}
                                return;
                            }
                        }
                    }
                    let _ = ws.close(None).await;
                });
            }
        });

        Self { url, requests }
    }

    /// Request bodies received, in connection order
    pub fn requests(&self) -> Vec<serde_json::Value> {
        self.requests.lock().unwrap().clone()
    }
}

/// A running controller wired to fakes
pub struct Harness {
    pub handle: TurnHandle,
    pub capture: ManualCapture,
    pub capture_buffer: Arc<AudioCaptureBuffer>,
    pub output: Arc<ManualOutput>,
    pub reasoning: Arc<FakeReasoning>,
    task: JoinHandle<()>,
}

impl Harness {
    pub fn start(recognition_url: &str, synthesis_url: &str, reasoning: FakeReasoning) -> Self {
        Self::start_with_capture(
            ManualCapture::default(),
            recognition_url,
            synthesis_url,
            reasoning,
        )
    }

    pub fn start_with_capture(
        capture: ManualCapture,
        recognition_url: &str,
        synthesis_url: &str,
        reasoning: FakeReasoning,
    ) -> Self {
        let capture_buffer = Arc::new(AudioCaptureBuffer::new(Box::new(capture.clone()), 16000));
        let output = Arc::new(ManualOutput::default());
        let reasoning = Arc::new(reasoning);

        let pipeline = Pipeline {
            capture: Arc::clone(&capture_buffer),
            recognition: RecognitionStreamClient::new(recognition_url)
                .with_finalize_timeout(Duration::from_secs(2))
                .with_connect_timeout(Duration::from_secs(1)),
            synthesis: SynthesisStreamClient::new(synthesis_url),
            reasoning: Arc::clone(&reasoning) as Arc<dyn ReasoningClient>,
            output: Arc::clone(&output) as Arc<dyn OutputDevice>,
        };
        let settings = TurnSettings {
            reasoning_timeout: Duration::from_secs(2),
            synthesis_idle_timeout: Duration::from_secs(2),
            ..TurnSettings::default()
        };
        let (controller, handle) = TurnController::new(pipeline, settings);
        let task = tokio::spawn(controller.run());

        Self {
            handle,
            capture,
            capture_buffer,
            output,
            reasoning,
            task,
        }
    }

    /// Wait until the controller reports `state`
    pub async fn wait_for(&self, state: TurnState) {
        let mut rx: watch::Receiver<TurnState> = self.handle.watch_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("never reached {state}, stuck in {}", self.handle.state()))
            .unwrap();
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().unwrap();
        let _ = tokio::time::timeout(WAIT, self.task).await;
    }
}

/// A URL that accepts TCP but never completes the WebSocket handshake
pub async fn stalled_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = listener.accept().await {
            held.push(tcp);
        }
    });
    url
}

/// A URL nothing listens on
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);
    url
}
