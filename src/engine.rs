use crate::bus::{Event, EventBus};
use crate::catalog::AIModel;
use crate::chat::{estimate_tokens, ChatMessage, ChatSession, MessageRole};
use crate::inference::{CompletionRequest, InferenceProvider, PromptMessage};
use crate::manager::ClientContext;
use crate::store::TranscriptStore;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Stored in place of the assistant turn when no reply could be produced.
pub const FAILED_REPLY: &str = "Sorry, something went wrong. Please try again later.";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("A reply is already streaming for session {0}")]
    Busy(String),
    #[error("Failed to record the user message: {0:#}")]
    Persistence(anyhow::Error),
    #[error("Failed to record the reply: {0:#}")]
    Commit(anyhow::Error),
    #[error("Turn task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// How a turn ended. Every variant carries the assistant message that was persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed(ChatMessage),
    /// The stream failed or timed out.
    Failed(ChatMessage),
    /// The client moved to another session before the reply finished.
    Abandoned(ChatMessage),
}

impl TurnOutcome {
    pub fn message(&self) -> &ChatMessage {
        match self {
            TurnOutcome::Completed(msg) | TurnOutcome::Failed(msg) | TurnOutcome::Abandoned(msg) => msg,
        }
    }
}

/// Marks a session as streaming until dropped.
struct InFlightGuard {
    sessions: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.remove(&self.session_id);
    }
}

#[derive(Clone)]
pub struct CompletionEngine {
    store: Arc<dyn TranscriptStore>,
    provider: Arc<dyn InferenceProvider>,
    event_bus: Arc<EventBus>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    history_window: usize,
    stream_timeout: Duration,
}

impl CompletionEngine {
    pub fn new(
        store: Arc<dyn TranscriptStore>,
        provider: Arc<dyn InferenceProvider>,
        event_bus: Arc<EventBus>,
        history_window: usize,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            event_bus,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            history_window,
            stream_timeout,
        }
    }

    pub fn is_in_flight(&self, session_id: &str) -> bool {
        let sessions = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        sessions.contains(session_id)
    }

    fn acquire(&self, session_id: &str) -> Result<InFlightGuard, EngineError> {
        let mut sessions = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !sessions.insert(session_id.to_string()) {
            warn!("Rejected concurrent send for session {}", session_id);
            return Err(EngineError::Busy(session_id.to_string()));
        }
        Ok(InFlightGuard {
            sessions: self.in_flight.clone(),
            session_id: session_id.to_string(),
        })
    }

    /// Run one user turn: record the user message, stream the reply, commit it.
    ///
    /// Once the user message is recorded an assistant message is always recorded
    /// after it, either the reply or [`FAILED_REPLY`]. The turn runs on its own
    /// task, so dropping the returned future does not stop it.
    pub async fn send_turn(
        &self,
        client: &Arc<ClientContext>,
        session: &ChatSession,
        user_text: &str,
        model: &AIModel,
    ) -> Result<TurnOutcome, EngineError> {
        let guard = self.acquire(&session.id)?;

        let engine = self.clone();
        let client = client.clone();
        let session = session.clone();
        let user_text = user_text.to_string();
        let model = model.clone();

        let turn = tokio::spawn(async move {
            let _guard = guard;
            engine.run_turn(&client, &session, &user_text, &model).await
        });

        turn.await?
    }

    async fn run_turn(
        &self,
        client: &ClientContext,
        session: &ChatSession,
        user_text: &str,
        model: &AIModel,
    ) -> Result<TurnOutcome, EngineError> {
        let history = match client.recent_messages(&session.id, self.history_window) {
            Some(history) => history,
            None => self
                .store
                .recent(&session.id, self.history_window)
                .await
                .map_err(EngineError::Persistence)?,
        };

        let user_msg = ChatMessage::new(
            session,
            MessageRole::User,
            user_text,
            Some(model.id.clone()),
            0,
        )
        .after(history.last());

        let mut prompt: Vec<PromptMessage> = history
            .iter()
            .map(|m| PromptMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        prompt.push(PromptMessage {
            role: MessageRole::User,
            content: user_text.to_string(),
        });

        // The user's input is durable before any network call.
        if let Err(e) = self.store.append(&user_msg).await {
            warn!("Failed to persist user message for session {}: {:#}", session.id, e);
            return Err(EngineError::Persistence(e));
        }
        client.push_if_target(&user_msg);
        self.event_bus.publish(Event::MessageCommitted(user_msg.clone()));

        let request = CompletionRequest {
            messages: prompt,
            model: model.model_id.clone(),
            max_tokens: model.max_tokens,
            temperature: model.temperature,
        };

        let reply = match tokio::time::timeout(
            self.stream_timeout,
            self.stream_reply(client, session, &request),
        )
        .await
        {
            Ok(reply) => reply,
            Err(_) => Err(anyhow::anyhow!(
                "Completion stream timed out after {:?}",
                self.stream_timeout
            )),
        };

        let (wrap, reply): (fn(ChatMessage) -> TurnOutcome, ChatMessage) = match reply {
            Ok(text) if !client.is_target(&session.id) => {
                info!(
                    "Session {} is no longer open, discarding {} chars of reply",
                    session.id,
                    text.len()
                );
                (TurnOutcome::Abandoned, self.failed_reply(session, model))
            }
            Ok(text) if text.is_empty() => {
                warn!("Completion for session {} produced no text", session.id);
                (TurnOutcome::Failed, self.failed_reply(session, model))
            }
            Ok(text) => {
                let tokens = estimate_tokens(&text);
                let msg = ChatMessage::new(
                    session,
                    MessageRole::Assistant,
                    text,
                    Some(model.id.clone()),
                    tokens,
                );
                (TurnOutcome::Completed, msg)
            }
            Err(e) => {
                warn!("Completion for session {} failed: {:#}", session.id, e);
                (TurnOutcome::Failed, self.failed_reply(session, model))
            }
        };
        let reply = reply.after(Some(&user_msg));

        client.clear_draft(&session.id);

        if let Err(e) = self.store.append(&reply).await {
            error!("Failed to persist reply for session {}: {:#}", session.id, e);
            return Err(EngineError::Commit(e));
        }
        client.push_if_target(&reply);
        self.event_bus.publish(Event::MessageCommitted(reply.clone()));

        debug!("Turn finished for session {}", session.id);
        Ok(wrap(reply))
    }

    fn failed_reply(&self, session: &ChatSession, model: &AIModel) -> ChatMessage {
        ChatMessage::new(
            session,
            MessageRole::Assistant,
            FAILED_REPLY,
            Some(model.id.clone()),
            0,
        )
    }

    /// Accumulate fragments, exposing the growing text as the client's draft.
    async fn stream_reply(
        &self,
        client: &ClientContext,
        session: &ChatSession,
        request: &CompletionRequest,
    ) -> anyhow::Result<String> {
        let mut fragments = self.provider.stream_completion(request).await?;
        let mut buffer = String::new();

        while let Some(fragment) = fragments.next().await {
            buffer.push_str(&fragment?);

            if client.set_draft_if_target(&session.id, &buffer) {
                self.event_bus.publish(Event::DraftUpdated {
                    user_id: session.user_id.clone(),
                    session_id: session.id.clone(),
                    text: buffer.clone(),
                });
            }
        }

        Ok(buffer)
    }
}
