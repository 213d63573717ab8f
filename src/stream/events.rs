//! Typed stream events and their wire decoding

use serde::{Deserialize, Serialize};

use crate::voice::AudioFrame;
use crate::{Error, Result};

/// Recognition result for the current utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Provisional text, superseded by later events
    Partial(String),
    /// Terminal text; ends the recognition stream
    Final(String),
}

impl TranscriptEvent {
    /// Transcript text
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Partial(text) | Self::Final(text) => text,
        }
    }

    /// Whether this is the terminal event
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }
}

/// Audio format announced at the start of a synthesis stream
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamMeta {
    /// Sample encoding, `pcm_s16le` by convention
    pub format: String,
    /// Samples per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
}

/// Event on a synthesis stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    /// Format of the audio that follows; precedes the first `Audio`
    Meta(StreamMeta),
    /// Synthesized audio, in synthesis order
    Audio(AudioFrame),
    /// Stream completed
    End,
    /// Stream failed
    Error(String),
}

impl SynthesisEvent {
    /// Whether no further events follow this one
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Error(_))
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TranscriptWire {
    Partial { text: String },
    Final { text: String },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum SynthesisControlWire {
    Meta {
        format: String,
        sample_rate: u32,
        channels: u16,
    },
    Start {},
    End {},
    Error {
        #[serde(default)]
        error: String,
    },
}

/// Request sent on a new synthesis stream
#[derive(Debug, Serialize)]
pub struct SynthesisRequest<'a> {
    pub text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_type: Option<&'a str>,
}

/// Decode a recognition text message
///
/// JSON objects must carry `type` `partial` or `final`; any other text is a
/// legacy bare final transcript.
///
/// # Errors
///
/// Returns `MalformedEvent` for JSON that does not match either shape
pub fn decode_recognition_text(text: &str) -> Result<TranscriptEvent> {
    if !text.trim_start().starts_with('{') {
        return Ok(TranscriptEvent::Final(text.to_string()));
    }
    match serde_json::from_str::<TranscriptWire>(text) {
        Ok(TranscriptWire::Partial { text }) => Ok(TranscriptEvent::Partial(text)),
        Ok(TranscriptWire::Final { text }) => Ok(TranscriptEvent::Final(text)),
        Err(e) => Err(Error::MalformedEvent(e.to_string())),
    }
}

/// Decode a synthesis control message
///
/// Returns `None` for `start`, which carries nothing the pipeline needs.
///
/// # Errors
///
/// Returns `MalformedEvent` for unknown or incomplete messages
pub fn decode_synthesis_text(text: &str) -> Result<Option<SynthesisEvent>> {
    let wire = serde_json::from_str::<SynthesisControlWire>(text)
        .map_err(|e| Error::MalformedEvent(e.to_string()))?;
    Ok(match wire {
        SynthesisControlWire::Meta {
            format,
            sample_rate,
            channels,
        } => Some(SynthesisEvent::Meta(StreamMeta {
            format,
            sample_rate,
            channels,
        })),
        SynthesisControlWire::Start {} => None,
        SynthesisControlWire::End {} => Some(SynthesisEvent::End),
        SynthesisControlWire::Error { error } => Some(SynthesisEvent::Error(error)),
    })
}

/// Decode a binary message of little-endian PCM
///
/// # Errors
///
/// Returns `MalformedEvent` if the payload holds no whole sample
pub fn decode_synthesis_binary(bytes: &[u8]) -> Result<SynthesisEvent> {
    AudioFrame::from_le_bytes(bytes)
        .map(SynthesisEvent::Audio)
        .map_err(|e| Error::MalformedEvent(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognition_json_messages() {
        assert_eq!(
            decode_recognition_text(r#"{"type":"partial","text":"你好"}"#).unwrap(),
            TranscriptEvent::Partial("你好".to_string())
        );
        assert_eq!(
            decode_recognition_text(r#"{"type":"final","text":"你好吗？"}"#).unwrap(),
            TranscriptEvent::Final("你好吗？".to_string())
        );
    }

    #[test]
    fn test_recognition_bare_string_is_final() {
        assert_eq!(
            decode_recognition_text("hello there").unwrap(),
            TranscriptEvent::Final("hello there".to_string())
        );
    }

    #[test]
    fn test_recognition_malformed() {
        for text in [r#"{"type":"bogus","text":"x"}"#, r#"{"type":"final"}"#, "{not json"] {
            assert!(
                matches!(decode_recognition_text(text), Err(Error::MalformedEvent(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn test_synthesis_control_messages() {
        let meta = decode_synthesis_text(
            r#"{"type":"meta","format":"pcm_s16le","sample_rate":24000,"channels":1}"#,
        )
        .unwrap();
        assert_eq!(
            meta,
            Some(SynthesisEvent::Meta(StreamMeta {
                format: "pcm_s16le".to_string(),
                sample_rate: 24000,
                channels: 1,
            }))
        );
        assert_eq!(decode_synthesis_text(r#"{"type":"start"}"#).unwrap(), None);
        assert_eq!(
            decode_synthesis_text(r#"{"type":"end","latency_ms":412}"#).unwrap(),
            Some(SynthesisEvent::End)
        );
        assert_eq!(
            decode_synthesis_text(r#"{"type":"error","error":"quota"}"#).unwrap(),
            Some(SynthesisEvent::Error("quota".to_string()))
        );
    }

    #[test]
    fn test_synthesis_malformed() {
        assert!(matches!(
            decode_synthesis_text("not json"),
            Err(Error::MalformedEvent(_))
        ));
        assert!(matches!(
            decode_synthesis_text(r#"{"type":"meta","format":"pcm_s16le"}"#),
            Err(Error::MalformedEvent(_))
        ));
        assert!(matches!(
            decode_synthesis_binary(&[]),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_synthesis_binary_audio() {
        let Ok(SynthesisEvent::Audio(frame)) = decode_synthesis_binary(&[0x10, 0x00, 0x20, 0x00])
        else {
            panic!("expected audio");
        };
        assert_eq!(frame.samples(), &[16, 32]);
    }
    #[test]
    fn test_synthesis_request_omits_missing_voice() {
        let body = serde_json::to_string(&SynthesisRequest {
            text: "hi",
            voice_type: None,
        })
        .unwrap();
        assert_eq!(body, r#"{"text":"hi"}"#);

        let body = serde_json::to_string(&SynthesisRequest {
            text: "hi",
            voice_type: Some("zh_female"),
        })
        .unwrap();
        assert_eq!(body, r#"{"text":"hi","voice_type":"zh_female"}"#);
    }

    #[test]
    fn test_terminal_events() {
        assert!(SynthesisEvent::End.is_terminal());
        assert!(SynthesisEvent::Error("x".to_string()).is_terminal());
        assert!(!SynthesisEvent::Audio(AudioFrame::new(vec![1]).unwrap()).is_terminal());
        assert!(TranscriptEvent::Final(String::new()).is_final());
        assert_eq!(TranscriptEvent::Partial("a".to_string()).text(), "a");
    }
}
