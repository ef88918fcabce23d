use super::{CompletionRequest, PromptMessage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// OpenAI-compatible chat completion payloads

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [PromptMessage],
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
}

impl<'a> From<&'a CompletionRequest> for ChatCompletionRequest<'a> {
    fn from(request: &'a CompletionRequest) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
pub struct ChunkDelta {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorEnvelope {
    pub error: ApiError,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub message: String,
}

/// What one SSE `data:` payload means for the text stream.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Text(String),
    Skip,
    Done,
}

pub fn parse_event_data(data: &str) -> Result<StreamEvent> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamEvent::Done);
    }
    if data.is_empty() {
        return Ok(StreamEvent::Skip);
    }

    if let Ok(envelope) = serde_json::from_str::<ApiErrorEnvelope>(data) {
        anyhow::bail!("Inference provider error: {}", envelope.error.message);
    }

    let value: serde_json::Value =
        serde_json::from_str(data).with_context(|| format!("Failed to parse stream chunk: {}", data))?;
    if value.get("type").and_then(|t| t.as_str()) == Some("ping") {
        return Ok(StreamEvent::Skip);
    }

    let chunk: ChatCompletionChunk = serde_json::from_value(value)
        .with_context(|| format!("Unexpected stream chunk shape: {}", data))?;

    match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
        Some(text) if !text.is_empty() => Ok(StreamEvent::Text(text)),
        _ => Ok(StreamEvent::Skip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessageRole;

    #[test]
    fn content_deltas_become_text() {
        let data = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        assert_eq!(parse_event_data(data).unwrap(), StreamEvent::Text("Hel".into()));
    }

    #[test]
    fn role_only_and_ping_chunks_are_skipped() {
        let role_only = r#"{"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#;
        assert_eq!(parse_event_data(role_only).unwrap(), StreamEvent::Skip);
        assert_eq!(parse_event_data(r#"{"type":"ping"}"#).unwrap(), StreamEvent::Skip);
    }

    #[test]
    fn done_marker_ends_stream() {
        assert_eq!(parse_event_data(" [DONE] ").unwrap(), StreamEvent::Done);
    }

    #[test]
    fn error_payloads_and_garbage_fail() {
        let err = parse_event_data(r#"{"error":{"message":"rate limited"}}"#).unwrap_err();
        assert!(err.to_string().contains("rate limited"));
        assert!(parse_event_data("not json").is_err());
    }

    #[test]
    fn request_serializes_with_streaming_enabled() {
        let request = CompletionRequest {
            messages: vec![PromptMessage {
                role: MessageRole::User,
                content: "hello".into(),
            }],
            model: "gpt-4o-mini".into(),
            max_tokens: 4000,
            temperature: 0.5,
        };
        let body = serde_json::to_value(ChatCompletionRequest::from(&request)).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], 4000);
    }
}
