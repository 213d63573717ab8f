//! PCM audio frames

use crate::{Error, Result};

/// A non-empty block of signed 16-bit mono PCM samples
///
/// The unit of transport on both the capture and the playback side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    /// Wrap samples in a frame
    ///
    /// # Errors
    ///
    /// Returns error if `samples` is empty
    pub fn new(samples: Vec<i16>) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::Audio("audio frame must not be empty".to_string()));
        }
        Ok(Self { samples })
    }

    /// Decode little-endian 16-bit PCM bytes
    ///
    /// A trailing odd byte is discarded.
    ///
    /// # Errors
    ///
    /// Returns error if fewer than two bytes are given
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 2 != 0 {
            tracing::warn!(len = bytes.len(), "odd-length PCM payload, dropping last byte");
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(samples)
    }

    /// Encode as little-endian 16-bit PCM bytes
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        encode_le(&self.samples)
    }

    /// Samples in this frame
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false; frames are never empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration at `sample_rate`
    #[must_use]
    pub fn duration(&self, sample_rate: u32) -> std::time::Duration {
        let micros = self.samples.len() as u64 * 1_000_000 / u64::from(sample_rate.max(1));
        std::time::Duration::from_micros(micros)
    }
}

/// Encode samples as little-endian 16-bit PCM bytes
#[must_use]
pub fn encode_le(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Convert a device sample in `[-1.0, 1.0]` to `i16`
#[must_use]
pub fn f32_to_i16(sample: f32) -> i16 {
    #[allow(clippy::cast_possible_truncation)]
    let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
    value
}

/// Convert an `i16` sample to a device sample in `[-1.0, 1.0)`
#[must_use]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}
