use crate::catalog::{AIModel, Catalog, Channel};
use crate::chat::{ChatSession, TranscriptExport};
use crate::engine::{CompletionEngine, EngineError, TurnOutcome};
use crate::entity::User;
use crate::manager::{ClientContext, SessionError, SessionManager, TranscriptView};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("No session is open")]
    NoSession,
    #[error("Message is empty")]
    EmptyMessage,
    #[error("No model is available in channel {0}")]
    NoAvailableModel(String),
    #[error("Model {model} is not available in channel {channel}")]
    ModelNotAllowed { channel: String, model: String },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// What a client can do: pick channels and models, manage sessions, send turns.
///
/// Every model choice goes through the resolver before a session is created or
/// a turn is sent.
pub struct ChatService {
    catalog: Catalog,
    sessions: SessionManager,
    engine: CompletionEngine,
}

impl ChatService {
    pub fn new(catalog: Catalog, sessions: SessionManager, engine: CompletionEngine) -> Self {
        Self {
            catalog,
            sessions,
            engine,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn channels(&self, user: &User) -> Result<Vec<Channel>, ChatError> {
        Ok(self.catalog.available_channels(user).await?)
    }

    pub async fn models(&self, user: &User, channel_id: &str) -> Result<Vec<AIModel>, ChatError> {
        Ok(self.catalog.resolve_allowed_models(user, channel_id).await?)
    }

    async fn allowed_model(
        &self,
        user: &User,
        channel_id: &str,
        model_id: &str,
    ) -> Result<AIModel, ChatError> {
        let allowed = self.catalog.resolve_allowed_models(user, channel_id).await?;
        if allowed.is_empty() {
            return Err(ChatError::NoAvailableModel(channel_id.to_string()));
        }
        allowed
            .into_iter()
            .find(|m| m.id == model_id)
            .ok_or_else(|| ChatError::ModelNotAllowed {
                channel: channel_id.to_string(),
                model: model_id.to_string(),
            })
    }

    /// Open the user's most recent session, creating one in `channel_id`/`model_id` if none exists.
    ///
    /// Only a session about to be created has its model checked; an existing one always reopens.
    pub async fn open_current(
        &self,
        client: &ClientContext,
        user: &User,
        channel_id: &str,
        model_id: &str,
    ) -> Result<ChatSession, ChatError> {
        if self.sessions.history(user).await?.is_empty() {
            self.allowed_model(user, channel_id, model_id).await?;
        }
        Ok(self
            .sessions
            .open_current(client, user, channel_id, model_id)
            .await?)
    }

    pub async fn start_new(
        &self,
        client: &ClientContext,
        user: &User,
        channel_id: &str,
        model_id: &str,
    ) -> Result<ChatSession, ChatError> {
        self.allowed_model(user, channel_id, model_id).await?;
        Ok(self
            .sessions
            .start_new(client, user, channel_id, model_id)
            .await?)
    }

    pub async fn switch_to(
        &self,
        client: &ClientContext,
        session_id: &str,
    ) -> Result<ChatSession, ChatError> {
        Ok(self.sessions.switch_to(client, session_id).await?)
    }

    pub async fn history(&self, user: &User) -> Result<Vec<ChatSession>, ChatError> {
        Ok(self.sessions.history(user).await?)
    }

    pub fn transcript(&self, client: &ClientContext) -> TranscriptView {
        client.view()
    }

    /// Refused while a reply is streaming, since the turn would lose its user message.
    pub async fn clear_current(&self, client: &ClientContext, confirmed: bool) -> Result<u64, ChatError> {
        if let Some(session) = client.current_session() {
            if self.engine.is_in_flight(&session.id) {
                return Err(EngineError::Busy(session.id).into());
            }
        }
        Ok(self.sessions.clear_current(client, confirmed).await?)
    }

    /// Send `text` in the client's current session.
    ///
    /// `model_id` overrides the session's model for this turn only.
    pub async fn send_message(
        &self,
        client: &Arc<ClientContext>,
        user: &User,
        text: &str,
        model_id: Option<&str>,
    ) -> Result<TurnOutcome, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let session = client.current_session().ok_or(ChatError::NoSession)?;
        let model_id = model_id.unwrap_or(&session.model_id);
        let model = self.allowed_model(user, &session.channel_id, model_id).await?;

        debug!("Sending turn in {} with model {}", session.id, model.id);
        Ok(self.engine.send_turn(client, &session, text, &model).await?)
    }

    /// The client's current transcript, with channel and model display names.
    pub async fn export(&self, client: &ClientContext) -> Result<TranscriptExport, ChatError> {
        let view = client.view();
        let session = view.session.ok_or(ChatError::NoSession)?;

        let channel_name = self
            .catalog
            .find_channel(&session.channel_id)
            .await?
            .map(|c| c.name);
        let names: HashMap<String, String> = self
            .catalog
            .list_models()
            .await?
            .into_iter()
            .map(|m| (m.id, m.display_name))
            .collect();

        let export = TranscriptExport::build(&session, channel_name, &view.messages, |id| {
            names.get(id).cloned()
        });
        info!(
            "Exported {} messages from session {}",
            export.messages.len(),
            session.id
        );
        Ok(export)
    }
}
