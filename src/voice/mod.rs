//! Voice I/O
//!
//! Microphone capture into a pull buffer, PCM frames, and queued playback.
//! Devices sit behind [`CaptureSource`] and [`OutputDevice`] so the pipeline
//! runs without audio hardware.

mod capture;
mod device;
mod frame;
mod playback;

pub use capture::{
    AudioCaptureBuffer, CaptureSource, CpalCapture, SAMPLE_RATE as CAPTURE_SAMPLE_RATE,
    SampleSink, samples_to_wav,
};
pub use frame::{AudioFrame, encode_le, f32_to_i16, i16_to_f32};
pub use playback::{
    CpalOutput, FrameDone, OutputDevice, PLAYBACK_SAMPLE_RATE, PlaybackFinished, PlaybackQueue,
};
