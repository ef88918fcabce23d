use super::wire::{parse_event_data, ChatCompletionRequest, StreamEvent};
use super::{CompletionRequest, DeltaStream, InferenceProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, StreamExt};
use std::time::Duration;
use tracing::{debug, error, info};

/// Talks to any endpoint implementing the OpenAI `/chat/completions` SSE protocol.
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        // No overall request timeout here: the engine bounds the whole stream.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl InferenceProvider for OpenAiCompatibleClient {
    async fn stream_completion(&self, request: &CompletionRequest) -> Result<DeltaStream> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        info!(
            "Opening completion stream: model={} messages={}",
            request.model,
            request.messages.len()
        );

        let mut builder = self
            .client
            .post(&url)
            .json(&ChatCompletionRequest::from(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to send completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            error!("Completion request failed with status {}: {}", status, body);
            anyhow::bail!("Completion request failed with status {}: {}", status, body);
        }

        let deltas = response
            .bytes_stream()
            .eventsource()
            .map(|event| -> Result<StreamEvent> {
                let event = event.context("Error reading stream event")?;
                parse_event_data(&event.data)
            })
            .take_while(|event| future::ready(!matches!(event, Ok(StreamEvent::Done))))
            .filter_map(|event| async move {
                match event {
                    Ok(StreamEvent::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(e) => {
                        debug!("Completion stream error: {:?}", e);
                        Some(Err(e))
                    }
                }
            });

        Ok(Box::pin(deltas))
    }
}
