//! TOML configuration file loading
//!
//! Supports `~/.config/docent/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct DocentConfigFile {
    /// Persona identifier (e.g. "woman_demo")
    #[serde(default)]
    pub persona: Option<String>,

    /// Service endpoints
    #[serde(default)]
    pub endpoints: EndpointsFileConfig,

    /// Capture and playback parameters
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Synthesis voice selection
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Bounded waits on remote services
    #[serde(default)]
    pub timeouts: TimeoutsFileConfig,
}

/// Remote service endpoints
#[derive(Debug, Default, Deserialize)]
pub struct EndpointsFileConfig {
    /// Recognition WebSocket URL
    pub recognition: Option<String>,

    /// Synthesis WebSocket URL
    pub synthesis: Option<String>,

    /// Reasoning HTTP URL
    pub reasoning: Option<String>,
}

/// Audio parameters
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub capture_sample_rate: Option<u32>,
    pub chunk_samples: Option<usize>,
    pub chunk_interval_ms: Option<u64>,
    pub playback_sample_rate: Option<u32>,
}

/// Voice configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Default synthesis voice selector
    pub voice_type: Option<String>,
}

/// Timeout configuration, in seconds
#[derive(Debug, Default, Deserialize)]
pub struct TimeoutsFileConfig {
    pub finalize_secs: Option<u64>,
    pub reasoning_secs: Option<u64>,
    pub synthesis_idle_secs: Option<u64>,
}

/// Load the TOML config file from `path`, or from the standard path when `None`
///
/// Returns `DocentConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> DocentConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return DocentConfigFile::default();
    };

    if !path.exists() {
        return DocentConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                DocentConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            DocentConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is invalid
pub fn parse_config(content: &str) -> crate::Result<DocentConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/docent/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("docent").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_file() {
        let fc = parse_config(
            r#"
            persona = "man_demo"

            [endpoints]
            synthesis = "ws://10.0.0.2:8765"

            [timeouts]
            reasoning_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(fc.persona.as_deref(), Some("man_demo"));
        assert_eq!(fc.endpoints.synthesis.as_deref(), Some("ws://10.0.0.2:8765"));
        assert!(fc.endpoints.recognition.is_none());
        assert_eq!(fc.timeouts.reasoning_secs, Some(5));
        assert!(fc.audio.chunk_samples.is_none());
    }

    #[test]
    fn test_parse_empty_file() {
        let fc = parse_config("").unwrap();
        assert!(fc.persona.is_none());
        assert!(fc.voice.voice_type.is_none());
    }

    #[test]
    fn test_parse_invalid_file() {
        assert!(parse_config("persona = [").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let fc = load_config_file(Some(Path::new("/nonexistent/docent/config.toml")));
        assert!(fc.persona.is_none());
    }
}
