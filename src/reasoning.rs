//! Reasoning service client
//!
//! One request per recognized utterance: the transcript goes out with the
//! persona and session identifiers, a reply comes back with the text to
//! speak and a hint for the avatar.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::{Error, Result};

/// Request body sent for a user utterance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReasoningRequest {
    pub text: String,
    pub persona_id: String,
    pub session_id: String,
}

/// Reply from the reasoning service
///
/// Fields the pipeline does not interpret are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReasoningReply {
    /// Text to speak; empty means say nothing
    #[serde(default)]
    pub tts_text: String,
    /// Avatar animation hint
    #[serde(default)]
    pub video_state: String,
    /// Voice override for this reply
    #[serde(default)]
    pub tts_voice_type: Option<String>,
    /// Avatar asset directory to switch to
    #[serde(default)]
    pub video_dir: Option<String>,
    /// Avatar clip prefix; defaults to `video_dir`
    #[serde(default)]
    pub video_prefix: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ReasoningReply {
    /// Avatar persona switch requested by this reply, as `(dir, prefix)`
    #[must_use]
    pub fn persona_switch(&self) -> Option<(String, String)> {
        let dir = self.video_dir.as_deref().filter(|d| !d.is_empty())?;
        let prefix = self
            .video_prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(dir);
        Some((dir.to_string(), prefix.to_string()))
    }

    /// Voice to synthesize with, preferring the reply's override
    #[must_use]
    pub fn voice_or<'a>(&'a self, default: Option<&'a str>) -> Option<&'a str> {
        self.tts_voice_type
            .as_deref()
            .filter(|v| !v.is_empty())
            .or(default)
    }
}

/// Turns an utterance into a reply
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// Ask for a reply to `request`
    ///
    /// # Errors
    ///
    /// Returns error if the service is unreachable or the reply is invalid
    async fn respond(&self, request: &ReasoningRequest) -> Result<ReasoningReply>;
}

/// Reasoning over HTTP: `POST` JSON, JSON reply
#[derive(Debug, Clone)]
pub struct HttpReasoningClient {
    url: String,
    client: reqwest::Client,
}

impl HttpReasoningClient {
    /// Create a client posting to `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.endpoints.reasoning_url.clone())
    }
}

#[async_trait]
impl ReasoningClient for HttpReasoningClient {
    async fn respond(&self, request: &ReasoningRequest) -> Result<ReasoningReply> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Reasoning(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Reasoning(format!(
                "service returned {}",
                response.status()
            )));
        }

        let reply: ReasoningReply = response
            .json()
            .await
            .map_err(|e| Error::Reasoning(format!("invalid reply: {e}")))?;

        tracing::debug!(
            session_id = %request.session_id,
            video_state = %reply.video_state,
            reply_len = reply.tts_text.len(),
            "reasoning reply"
        );
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use tokio::net::TcpListener;

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/api/llm")
    }

    fn request(text: &str) -> ReasoningRequest {
        ReasoningRequest {
            text: text.to_string(),
            persona_id: "woman_demo".to_string(),
            session_id: "s-1".to_string(),
        }
    }

    #[test]
    fn test_reply_defaults_and_extras() {
        let reply: ReasoningReply =
            serde_json::from_str(r#"{"tts_text":"hi","mood":"warm"}"#).unwrap();
        assert_eq!(reply.tts_text, "hi");
        assert_eq!(reply.video_state, "");
        assert_eq!(reply.extra.get("mood").and_then(|v| v.as_str()), Some("warm"));
        assert_eq!(reply.persona_switch(), None);
    }

    #[test]
    fn test_persona_switch_prefix_defaults_to_dir() {
        let reply = ReasoningReply {
            video_dir: Some("man_guide".to_string()),
            ..ReasoningReply::default()
        };
        assert_eq!(
            reply.persona_switch(),
            Some(("man_guide".to_string(), "man_guide".to_string()))
        );

        let reply = ReasoningReply {
            video_dir: Some("man_guide".to_string()),
            video_prefix: Some("mg".to_string()),
            ..ReasoningReply::default()
        };
        assert_eq!(
            reply.persona_switch(),
            Some(("man_guide".to_string(), "mg".to_string()))
        );
    }

    #[test]
    fn test_voice_override() {
        let reply = ReasoningReply {
            tts_voice_type: Some("zh_male".to_string()),
            ..ReasoningReply::default()
        };
        assert_eq!(reply.voice_or(Some("zh_female")), Some("zh_male"));
        assert_eq!(
            ReasoningReply::default().voice_or(Some("zh_female")),
            Some("zh_female")
        );
        assert_eq!(ReasoningReply::default().voice_or(None), None);
    }

    #[tokio::test]
    async fn test_http_round_trip() {
        let router = Router::new().route(
            "/api/llm",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["persona_id"], "woman_demo");
                assert_eq!(body["session_id"], "s-1");
                Json(serde_json::json!({
                    "tts_text": format!("echo {}", body["text"].as_str().unwrap_or_default()),
                    "video_state": "TALK",
                }))
            }),
        );
        let url = serve(router).await;

        let reply = HttpReasoningClient::new(url)
            .respond(&request("hello"))
            .await
            .unwrap();
        assert_eq!(reply.tts_text, "echo hello");
        assert_eq!(reply.video_state, "TALK");
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let router = Router::new().route(
            "/api/llm",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let url = serve(router).await;

        let err = HttpReasoningClient::new(url)
            .respond(&request("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Reasoning(msg) if msg.contains("500")));
    }
}
