//! Audio playback to speakers
//!
//! [`PlaybackQueue`] serializes frames onto an [`OutputDevice`] one at a time
//! and reports a single [`PlaybackFinished`] each time it drains.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cpal::SampleRate;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;

use super::device::{DeviceWorker, lock};
use super::frame::{AudioFrame, i16_to_f32};
use crate::{Error, Result};

/// Sample rate for playback (synthesis output convention)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Completion callback for one frame; called at most once
pub type FrameDone = Box<dyn FnOnce(Result<()>) + Send>;

/// A single-consumer output device
pub trait OutputDevice: Send + Sync {
    /// Begin playing `frame`, calling `done` once the device has finished it
    ///
    /// # Errors
    ///
    /// Returns `PlaybackDevice` if the frame is rejected; `done` is then dropped
    /// without being called.
    fn play(&self, frame: AudioFrame, done: FrameDone) -> Result<()>;

    /// Stop in-flight playback immediately, dropping its `done` uncalled
    fn stop(&self);
}

/// The queue went idle after playing a run of frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackFinished {
    /// Queue generation the run belonged to
    pub generation: u64,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<AudioFrame>,
    playing: bool,
    generation: u64,
}

struct Inner {
    device: Arc<dyn OutputDevice>,
    state: Mutex<QueueState>,
    finished_tx: mpsc::UnboundedSender<PlaybackFinished>,
}

/// FIFO of frames feeding one output device
#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<Inner>,
}

impl PlaybackQueue {
    /// Create a queue over `device`
    ///
    /// The receiver yields one [`PlaybackFinished`] per idle transition.
    #[must_use]
    pub fn new(device: Arc<dyn OutputDevice>) -> (Self, mpsc::UnboundedReceiver<PlaybackFinished>) {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(Inner {
                device,
                state: Mutex::new(QueueState::default()),
                finished_tx,
            }),
        };
        (queue, finished_rx)
    }

    /// Append a frame; starts playback if nothing is playing
    pub fn enqueue(&self, frame: AudioFrame) {
        let start = {
            let mut state = lock(&self.inner.state);
            state.pending.push_back(frame);
            if state.playing {
                None
            } else {
                state.playing = true;
                Some(state.generation)
            }
        };

        if let Some(generation) = start {
            tracing::debug!(generation, "playback started");
            self.advance(generation);
        }
    }

    /// Drop pending frames and stop in-flight playback without a completion event
    pub fn reset(&self) {
        let dropped = {
            let mut state = lock(&self.inner.state);
            state.generation += 1;
            state.playing = false;
            let dropped = state.pending.len();
            state.pending.clear();
            dropped
        };
        self.inner.device.stop();
        tracing::debug!(dropped, "playback reset");
    }

    /// Whether a frame is in flight
    #[must_use]
    pub fn is_playing(&self) -> bool {
        lock(&self.inner.state).playing
    }

    /// Frames waiting behind the in-flight one
    #[must_use]
    pub fn pending_len(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    /// Current generation; bumped by every [`reset`](Self::reset)
    #[must_use]
    pub fn generation(&self) -> u64 {
        lock(&self.inner.state).generation
    }

    /// Hand the next frame of `generation` to the device, or go idle
    fn advance(&self, generation: u64) {
        loop {
            let frame = {
                let mut state = lock(&self.inner.state);
                if state.generation != generation {
                    return;
                }
                match state.pending.pop_front() {
                    Some(frame) => frame,
                    None => {
                        state.playing = false;
                        drop(state);
                        tracing::debug!(generation, "playback complete");
                        let _ = self.inner.finished_tx.send(PlaybackFinished { generation });
                        return;
                    }
                }
            };

            let queue = self.clone();
            let done: FrameDone = Box::new(move |result| {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "frame playback failed");
                }
                queue.advance(generation);
            });

            match self.inner.device.play(frame, done) {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "output device rejected frame, dropping it");
                }
            }
        }
    }
}

/// Frame currently being rendered by the cpal callback
struct Current {
    samples: Vec<f32>,
    pos: usize,
    done: Option<FrameDone>,
}

/// Plays frames on the default cpal output device
///
/// The stream runs continuously on its own thread and renders silence
/// between frames.
pub struct CpalOutput {
    slot: Arc<Mutex<Option<Current>>>,
    sample_rate: u32,
    _worker: DeviceWorker,
}

impl CpalOutput {
    /// Open the default output device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns `PlaybackDevice` if no suitable device or config exists
    pub fn open(sample_rate: u32) -> Result<Self> {
        let slot: Arc<Mutex<Option<Current>>> = Arc::new(Mutex::new(None));
        let render_slot = Arc::clone(&slot);
        let worker = DeviceWorker::spawn("docent-playback", move || {
            build_output_stream(sample_rate, render_slot)
        })
        .map_err(Error::PlaybackDevice)?;

        Ok(Self {
            slot,
            sample_rate,
            _worker: worker,
        })
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl OutputDevice for CpalOutput {
    fn play(&self, frame: AudioFrame, done: FrameDone) -> Result<()> {
        let mut slot = lock(&self.slot);
        if slot.is_some() {
            return Err(Error::PlaybackDevice("a frame is already in flight".to_string()));
        }
        *slot = Some(Current {
            samples: frame.samples().iter().copied().map(i16_to_f32).collect(),
            pos: 0,
            done: Some(done),
        });
        Ok(())
    }

    fn stop(&self) {
        lock(&self.slot).take();
    }
}

fn build_output_stream(
    sample_rate: u32,
    slot: Arc<Mutex<Option<Current>>>,
) -> std::result::Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no output device available".to_string())?;

    let supported = device
        .supported_output_configs()
        .map_err(|e| e.to_string())?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
        })
        .ok_or_else(|| "no suitable output config found".to_string())?;

    let config = supported.with_sample_rate(SampleRate(sample_rate)).config();
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                render(data, channels, &slot);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| e.to_string())?;

    stream.play().map_err(|e| e.to_string())?;
    Ok(stream)
}

/// Fill `data` from the slot, chaining into the next frame without a gap
fn render(data: &mut [f32], channels: usize, slot: &Mutex<Option<Current>>) {
    let mut frames = data.chunks_mut(channels);
    loop {
        let done = {
            let mut guard = lock(slot);
            let Some(current) = guard.as_mut() else {
                break;
            };

            for frame in frames.by_ref() {
                let sample = current.samples[current.pos];
                frame.fill(sample);
                current.pos += 1;
                if current.pos >= current.samples.len() {
                    break;
                }
            }

            if current.pos < current.samples.len() {
                // Output buffer full, frame continues next callback
                return;
            }
            guard.take().and_then(|c| c.done)
        };

        // Called without the slot lock: the queue may hand over the next frame
        if let Some(done) = done {
            done(Ok(()));
        }
    }

    for frame in frames {
        frame.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Device that records frames and leaves completion to the test
    #[derive(Default)]
    struct ManualDevice {
        played: Mutex<Vec<AudioFrame>>,
        in_flight: Mutex<Option<FrameDone>>,
        stops: Mutex<usize>,
        reject: Mutex<Vec<i16>>,
    }

    impl ManualDevice {
        fn complete(&self) {
            let done = self.in_flight.lock().unwrap().take();
            if let Some(done) = done {
                done(Ok(()));
            }
        }

        fn played_first_samples(&self) -> Vec<i16> {
            self.played.lock().unwrap().iter().map(|f| f.samples()[0]).collect()
        }
    }

    impl OutputDevice for ManualDevice {
        fn play(&self, frame: AudioFrame, done: FrameDone) -> Result<()> {
            if self.reject.lock().unwrap().contains(&frame.samples()[0]) {
                return Err(Error::PlaybackDevice("rejected".to_string()));
            }
            let mut slot = self.in_flight.lock().unwrap();
            assert!(slot.is_none(), "two frames in flight");
            self.played.lock().unwrap().push(frame);
            *slot = Some(done);
            Ok(())
        }

        fn stop(&self) {
            self.in_flight.lock().unwrap().take();
            *self.stops.lock().unwrap() += 1;
        }
    }

    fn frame(tag: i16) -> AudioFrame {
        AudioFrame::new(vec![tag; 4]).unwrap()
    }

    #[test]
    fn test_plays_in_order_and_finishes_once() {
        let device = Arc::new(ManualDevice::default());
        let (queue, mut finished) = PlaybackQueue::new(device.clone());

        queue.enqueue(frame(1));
        queue.enqueue(frame(2));
        queue.enqueue(frame(3));
        assert!(queue.is_playing());
        assert_eq!(queue.pending_len(), 2);

        device.complete();
        device.complete();
        assert!(finished.try_recv().is_err());
        device.complete();

        assert_eq!(device.played_first_samples(), vec![1, 2, 3]);
        assert!(!queue.is_playing());
        assert_eq!(finished.try_recv().unwrap().generation, 0);
        assert!(finished.try_recv().is_err());
    }

    #[test]
    fn test_one_completion_per_idle_transition() {
        let device = Arc::new(ManualDevice::default());
        let (queue, mut finished) = PlaybackQueue::new(device.clone());

        queue.enqueue(frame(1));
        device.complete();
        assert!(finished.try_recv().is_ok());

        queue.enqueue(frame(2));
        queue.enqueue(frame(3));
        device.complete();
        queue.enqueue(frame(4));
        device.complete();
        device.complete();

        assert!(finished.try_recv().is_ok());
        assert!(finished.try_recv().is_err());
        assert_eq!(device.played_first_samples(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_reset_drops_pending_without_completion() {
        let device = Arc::new(ManualDevice::default());
        let (queue, mut finished) = PlaybackQueue::new(device.clone());

        queue.enqueue(frame(1));
        queue.enqueue(frame(2));
        queue.reset();

        assert!(!queue.is_playing());
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(*device.stops.lock().unwrap(), 1);
        assert!(finished.try_recv().is_err());

        queue.enqueue(frame(5));
        device.complete();
        assert_eq!(device.played_first_samples(), vec![1, 5]);
        assert_eq!(finished.try_recv().unwrap().generation, 1);
    }

    #[test]
    fn test_stale_completion_after_reset_is_ignored() {
        let device = Arc::new(ManualDevice::default());
        let (queue, mut finished) = PlaybackQueue::new(device.clone());

        queue.enqueue(frame(1));
        let stale = device.in_flight.lock().unwrap().take().unwrap();
        queue.reset();
        queue.enqueue(frame(2));

        stale(Ok(()));
        assert!(queue.is_playing());
        assert!(finished.try_recv().is_err());

        device.complete();
        assert!(finished.try_recv().is_ok());
    }

    #[test]
    fn test_rejected_frame_is_skipped() {
        let device = Arc::new(ManualDevice::default());
        device.reject.lock().unwrap().push(2);
        let (queue, mut finished) = PlaybackQueue::new(device.clone());

        queue.enqueue(frame(1));
        queue.enqueue(frame(2));
        queue.enqueue(frame(3));
        device.complete();
        device.complete();

        assert_eq!(device.played_first_samples(), vec![1, 3]);
        assert!(finished.try_recv().is_ok());
    }

    #[test]
    fn test_failed_frame_continues_with_next() {
        let device = Arc::new(ManualDevice::default());
        let (queue, _finished) = PlaybackQueue::new(device.clone());

        queue.enqueue(frame(1));
        queue.enqueue(frame(2));
        let done = device.in_flight.lock().unwrap().take().unwrap();
        done(Err(Error::PlaybackDevice("underrun".to_string())));

        assert_eq!(device.played_first_samples(), vec![1, 2]);
    }

    #[test]
    fn test_render_chains_frames_and_pads_silence() {
        let slot: Mutex<Option<Current>> = Mutex::new(Some(Current {
            samples: vec![0.5, 0.25],
            pos: 0,
            done: None,
        }));
        let mut data = vec![1.0f32; 6];
        render(&mut data, 2, &slot);

        assert_eq!(data, vec![0.5, 0.5, 0.25, 0.25, 0.0, 0.0]);
        assert!(slot.lock().unwrap().is_none());
    }

    #[test]
    fn test_render_keeps_partial_frame() {
        let slot: Mutex<Option<Current>> = Mutex::new(Some(Current {
            samples: vec![0.1, 0.2, 0.3],
            pos: 0,
            done: None,
        }));
        let mut data = vec![0.0f32; 2];
        render(&mut data, 1, &slot);

        assert_eq!(data, vec![0.1, 0.2]);
        assert_eq!(slot.lock().unwrap().as_ref().unwrap().pos, 2);
    }
}
