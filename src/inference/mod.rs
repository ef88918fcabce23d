//! Streaming inference capability.
//!
//! The engine only sees [`InferenceProvider`]: ordered messages plus model
//! settings go in, text fragments come out.

pub mod client;
pub mod wire;

use crate::chat::MessageRole;
use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;

pub use client::OpenAiCompatibleClient;

/// Incremental text fragments of one completion.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    /// Provider-side model identifier.
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn stream_completion(&self, request: &CompletionRequest) -> Result<DeltaStream>;
}
