//! Audio capture from microphone
//!
//! A capture thread pushes sample blocks into a channel; consumers pull
//! fixed-size chunks out of the [`AudioCaptureBuffer`] without ever blocking
//! the capture side.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;

use cpal::SampleRate;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::device::{DeviceWorker, lock};
use super::frame::f32_to_i16;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz mono for recognition)
pub const SAMPLE_RATE: u32 = 16000;

/// Producer half handed to a [`CaptureSource`]
#[derive(Debug, Clone)]
pub struct SampleSink {
    tx: std_mpsc::Sender<Vec<i16>>,
}

impl SampleSink {
    /// Hand a block of captured samples to the buffer
    ///
    /// Never blocks. Returns false once the buffer has been stopped.
    pub fn push(&self, samples: Vec<i16>) -> bool {
        if samples.is_empty() {
            return true;
        }
        self.tx.send(samples).is_ok()
    }
}

/// A device that produces mono samples into a [`SampleSink`]
pub trait CaptureSource: Send {
    /// Acquire the device and start producing samples
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the device is missing or denied
    fn open(&mut self, sample_rate: u32, sink: SampleSink) -> Result<()>;

    /// Release the device
    fn close(&mut self);
}

/// Consumer-side state: the receiving end plus samples not yet pulled
#[derive(Default)]
struct Consumer {
    rx: Option<std_mpsc::Receiver<Vec<i16>>>,
    pending: VecDeque<i16>,
    /// Bumped every time the device is opened
    epoch: u64,
}

impl Consumer {
    fn drain(&mut self) {
        if let Some(rx) = &self.rx {
            while let Ok(block) = rx.try_recv() {
                self.pending.extend(block);
            }
        }
    }
}

/// Bridges a continuously producing capture device to pull-based consumers
pub struct AudioCaptureBuffer {
    sample_rate: u32,
    source: Mutex<Box<dyn CaptureSource>>,
    consumer: Mutex<Consumer>,
}

impl AudioCaptureBuffer {
    /// Create a buffer over `source`, capturing at `sample_rate`
    #[must_use]
    pub fn new(source: Box<dyn CaptureSource>, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            source: Mutex::new(source),
            consumer: Mutex::new(Consumer::default()),
        }
    }

    /// Create a buffer over the default input device at 16 kHz
    #[must_use]
    pub fn with_default_device() -> Self {
        Self::new(Box::new(CpalCapture::new()), SAMPLE_RATE)
    }

    /// Start capturing audio
    ///
    /// No-op if already capturing. Every fresh open starts a new
    /// [`epoch`](Self::epoch).
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the device cannot be acquired
    pub fn start(&self) -> Result<()> {
        let mut source = lock(&self.source);
        let mut consumer = lock(&self.consumer);
        if consumer.rx.is_some() {
            return Ok(());
        }

        let (tx, rx) = std_mpsc::channel();
        source.open(self.sample_rate, SampleSink { tx })?;
        consumer.rx = Some(rx);
        consumer.pending.clear();
        consumer.epoch += 1;

        tracing::debug!(
            sample_rate = self.sample_rate,
            epoch = consumer.epoch,
            "audio capture started"
        );
        Ok(())
    }

    /// Remove `n` samples in capture order, zero-padding when fewer are buffered
    ///
    /// Returns an empty vector when not capturing.
    #[must_use]
    pub fn pull(&self, n: usize) -> Vec<i16> {
        let mut consumer = lock(&self.consumer);
        if consumer.rx.is_none() {
            return Vec::new();
        }
        consumer.drain();

        let take = n.min(consumer.pending.len());
        let mut out: Vec<i16> = consumer.pending.drain(..take).collect();
        out.resize(n, 0);
        out
    }

    /// Number of buffered samples not yet pulled
    #[must_use]
    pub fn available(&self) -> usize {
        let mut consumer = lock(&self.consumer);
        consumer.drain();
        consumer.pending.len()
    }

    /// Stop capturing and release the device
    pub fn stop(&self) {
        let mut source = lock(&self.source);
        let mut consumer = lock(&self.consumer);
        Self::close_locked(&mut **source, &mut consumer);
    }

    /// Stop capturing only if the device is still open from `epoch`
    ///
    /// Lets a consumer that started under one epoch finish without
    /// releasing a device someone else has since reopened. Returns whether
    /// capture was stopped.
    pub fn release(&self, epoch: u64) -> bool {
        let mut source = lock(&self.source);
        let mut consumer = lock(&self.consumer);
        if consumer.epoch != epoch {
            tracing::debug!(epoch, current = consumer.epoch, "stale capture release ignored");
            return false;
        }
        Self::close_locked(&mut **source, &mut consumer)
    }

    fn close_locked(source: &mut dyn CaptureSource, consumer: &mut Consumer) -> bool {
        if consumer.rx.take().is_none() {
            return false;
        }
        source.close();
        consumer.pending.clear();
        tracing::debug!(epoch = consumer.epoch, "audio capture stopped");
        true
    }

    /// Current capture epoch; 0 before the first start
    #[must_use]
    pub fn epoch(&self) -> u64 {
        lock(&self.consumer).epoch
    }

    /// Check if currently capturing
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        lock(&self.consumer).rx.is_some()
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for AudioCaptureBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture from the default cpal input device
///
/// cpal streams are not `Send`, so the stream lives on a dedicated thread
/// that holds it until [`CaptureSource::close`].
#[derive(Default)]
pub struct CpalCapture {
    worker: Option<DeviceWorker>,
}

impl CpalCapture {
    /// Create a capture source for the default input device
    #[must_use]
    pub const fn new() -> Self {
        Self { worker: None }
    }
}

impl CaptureSource for CpalCapture {
    fn open(&mut self, sample_rate: u32, sink: SampleSink) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let worker = DeviceWorker::spawn("docent-capture", move || {
            build_input_stream(sample_rate, sink)
        })
        .map_err(Error::DeviceUnavailable)?;
        self.worker = Some(worker);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

fn build_input_stream(
    sample_rate: u32,
    sink: SampleSink,
) -> std::result::Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| "no input device available".to_string())?;

    let supported = device
        .supported_input_configs()
        .map_err(|e| e.to_string())?
        .filter(|c| {
            c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .ok_or_else(|| "no suitable audio config found".to_string())?;

    let config = supported.with_sample_rate(SampleRate(sample_rate)).config();
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // First channel only; recognition wants mono
                let block: Vec<i16> = data
                    .chunks(channels)
                    .map(|frame| f32_to_i16(frame[0]))
                    .collect();
                sink.push(block);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| e.to_string())?;

    stream.play().map_err(|e| e.to_string())?;
    Ok(stream)
}

/// Convert i16 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
