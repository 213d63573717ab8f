//! Error types for the docent kiosk

use thiserror::Error;

/// Result type alias for docent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the speech pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Capture device missing, denied or unusable
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Output device rejected a frame or could not be opened
    #[error("playback device error: {0}")]
    PlaybackDevice(String),

    /// Recognition or synthesis stream could not be connected
    #[error("stream connect error: {0}")]
    StreamConnect(String),

    /// Unparseable service message
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Audio payload error (empty frame, bad encoding)
    #[error("audio error: {0}")]
    Audio(String),

    /// Reasoning service error
    #[error("reasoning error: {0}")]
    Reasoning(String),

    /// A bounded wait elapsed
    #[error("timed out: {0}")]
    Timeout(String),

    /// A turn ended in failure; carries the reported reason
    #[error("turn failed: {0}")]
    TurnFailed(String),

    /// Turn controller is no longer running
    #[error("controller stopped")]
    ControllerStopped,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket protocol error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
