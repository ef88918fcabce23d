use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_SESSION_TITLE: &str = "New chat";

/// Current time at the precision the store keeps (microseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Characters per token used by `estimate_tokens`. Not an accounting figure.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => anyhow::bail!("Unknown message role: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub role: MessageRole,
    pub content: String,
    pub model_id: Option<String>,
    pub tokens_used: u32,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        session: &ChatSession,
        role: MessageRole,
        content: impl Into<String>,
        model_id: Option<String>,
        tokens_used: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            role,
            content: content.into(),
            model_id,
            tokens_used,
            created_at: now(),
        }
    }

    /// Push `created_at` past `previous` so per-session order stays strictly increasing.
    pub fn after(mut self, previous: Option<&ChatMessage>) -> Self {
        if let Some(prev) = previous {
            if self.created_at <= prev.created_at {
                self.created_at = prev.created_at + Duration::microseconds(1);
            }
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub channel_id: String,
    pub model_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        let created = now();
        Self {
            id: format!("session_{}", Uuid::new_v4().simple()),
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            model_id: model_id.into(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            created_at: created,
            updated_at: created,
        }
    }
}

/// Rough token count: content length over a fixed divisor, rounded up.
pub fn estimate_tokens(content: &str) -> u32 {
    let chars = content.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN) as u32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub model: Option<String>,
}

/// A transcript serialized for download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptExport {
    pub session: String,
    pub channel: Option<String>,
    pub model: Option<String>,
    pub export_time: DateTime<Utc>,
    pub messages: Vec<ExportedMessage>,
}

impl TranscriptExport {
    /// `display_name` maps a model id to the name shown to users.
    pub fn build<F>(
        session: &ChatSession,
        channel_name: Option<String>,
        messages: &[ChatMessage],
        display_name: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            session: session.title.clone(),
            channel: channel_name,
            model: display_name(&session.model_id),
            export_time: Utc::now(),
            messages: messages
                .iter()
                .map(|m| ExportedMessage {
                    role: m.role,
                    content: m.content.clone(),
                    timestamp: m.created_at,
                    model: m.model_id.as_deref().and_then(&display_name),
                })
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize transcript export")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Failed to parse transcript export")
    }

    pub fn file_name(&self) -> String {
        format!("chat-export-{}.json", self.export_time.format("%Y-%m-%d"))
    }
}
