//! Configuration management for the docent kiosk

pub mod file;

use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

use self::file::DocentConfigFile;

/// Persona used when nothing else is configured
pub const DEFAULT_PERSONA: &str = "woman_demo";

/// Docent kiosk configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Active persona identifier, sent with every reasoning request
    pub persona_id: String,

    /// Remote service endpoints
    pub endpoints: EndpointsConfig,

    /// Capture and playback parameters
    pub audio: AudioConfig,

    /// Synthesis voice configuration
    pub voice: VoiceConfig,

    /// Bounded waits on remote services
    pub timeouts: TimeoutConfig,
}

/// Remote service endpoints
#[derive(Debug, Clone)]
pub struct EndpointsConfig {
    /// Recognition WebSocket URL
    pub recognition_url: String,

    /// Synthesis WebSocket URL
    pub synthesis_url: String,

    /// Reasoning HTTP URL
    pub reasoning_url: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            recognition_url: "ws://localhost:9001".to_string(),
            synthesis_url: "ws://127.0.0.1:8765".to_string(),
            reasoning_url: "http://127.0.0.1:8000/api/llm".to_string(),
        }
    }
}

/// Audio parameters shared by capture, upload and playback
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Capture sample rate (recognition expects 16 kHz mono)
    pub capture_sample_rate: u32,

    /// Samples per uploaded chunk
    pub chunk_samples: usize,

    /// Upload cadence
    pub chunk_interval: Duration,

    /// Playback sample rate (synthesis output convention)
    pub playback_sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: crate::voice::CAPTURE_SAMPLE_RATE,
            chunk_samples: crate::stream::CHUNK_SAMPLES,
            chunk_interval: crate::stream::CHUNK_INTERVAL,
            playback_sample_rate: crate::voice::PLAYBACK_SAMPLE_RATE,
        }
    }
}

/// Synthesis voice configuration
#[derive(Debug, Clone, Default)]
pub struct VoiceConfig {
    /// Default voice selector sent as `voice_type`; omitted when `None`
    pub voice_type: Option<String>,
}

/// Bounded waits; each resolves the turn to idle when exceeded
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Wait for the final transcript after the stop sentinel
    pub finalize: Duration,

    /// Wait for the reasoning reply
    pub reasoning: Duration,

    /// Longest gap between synthesis events
    pub synthesis_idle: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            finalize: Duration::from_secs(10),
            reasoning: Duration::from_secs(30),
            synthesis_idle: Duration::from_secs(15),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            persona_id: DEFAULT_PERSONA.to_string(),
            endpoints: EndpointsConfig::default(),
            audio: AudioConfig::default(),
            voice: VoiceConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// `path` overrides the standard config file location.
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path);
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn from_sources<F>(fc: DocentConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let persona_id = env("DOCENT_PERSONA")
            .or(fc.persona)
            .unwrap_or(defaults.persona_id);

        let endpoints = EndpointsConfig {
            recognition_url: env("DOCENT_RECOGNITION_URL")
                .or(fc.endpoints.recognition)
                .unwrap_or(defaults.endpoints.recognition_url),
            synthesis_url: env("DOCENT_SYNTHESIS_URL")
                .or(fc.endpoints.synthesis)
                .unwrap_or(defaults.endpoints.synthesis_url),
            reasoning_url: env("DOCENT_REASONING_URL")
                .or(fc.endpoints.reasoning)
                .unwrap_or(defaults.endpoints.reasoning_url),
        };

        let audio = AudioConfig {
            capture_sample_rate: fc
                .audio
                .capture_sample_rate
                .unwrap_or(defaults.audio.capture_sample_rate),
            chunk_samples: fc
                .audio
                .chunk_samples
                .unwrap_or(defaults.audio.chunk_samples),
            chunk_interval: fc
                .audio
                .chunk_interval_ms
                .map_or(defaults.audio.chunk_interval, Duration::from_millis),
            playback_sample_rate: fc
                .audio
                .playback_sample_rate
                .unwrap_or(defaults.audio.playback_sample_rate),
        };

        let voice = VoiceConfig {
            voice_type: env("DOCENT_VOICE_TYPE")
                .or(fc.voice.voice_type)
                .filter(|v| !v.is_empty()),
        };

        let timeouts = TimeoutConfig {
            finalize: fc
                .timeouts
                .finalize_secs
                .map_or(defaults.timeouts.finalize, Duration::from_secs),
            reasoning: fc
                .timeouts
                .reasoning_secs
                .map_or(defaults.timeouts.reasoning, Duration::from_secs),
            synthesis_idle: fc
                .timeouts
                .synthesis_idle_secs
                .map_or(defaults.timeouts.synthesis_idle, Duration::from_secs),
        };

        let config = Self {
            persona_id,
            endpoints,
            audio,
            voice,
            timeouts,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        if self.persona_id.trim().is_empty() {
            return Err(Error::Config("persona id must not be empty".to_string()));
        }
        if self.audio.chunk_samples == 0 {
            return Err(Error::Config("audio.chunk_samples must be positive".to_string()));
        }
        if self.audio.chunk_interval.is_zero() {
            return Err(Error::Config(
                "audio.chunk_interval_ms must be positive".to_string(),
            ));
        }
        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(Error::Config("sample rates must be positive".to_string()));
        }
        for (name, url) in [
            ("recognition", &self.endpoints.recognition_url),
            ("synthesis", &self.endpoints.synthesis_url),
        ] {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(Error::Config(format!(
                    "{name} endpoint must be a ws:// or wss:// URL: {url}"
                )));
            }
        }
        if !(self.endpoints.reasoning_url.starts_with("http://")
            || self.endpoints.reasoning_url.starts_with("https://"))
        {
            return Err(Error::Config(format!(
                "reasoning endpoint must be an http(s) URL: {}",
                self.endpoints.reasoning_url
            )));
        }
        Ok(())
    }
}
