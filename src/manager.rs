use crate::bus::{Event, EventBus};
use crate::chat::{ChatMessage, ChatSession};
use crate::entity::User;
use crate::store::TranscriptStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session {0} belongs to another user")]
    NotOwned(String),
    #[error("No session is open")]
    NoCurrentSession,
    #[error("Clearing a session requires confirmation")]
    NotConfirmed,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Assistant text being assembled from a stream. Lives only in memory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Draft {
    pub session_id: String,
    pub text: String,
}

/// Snapshot of what a client currently shows.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptView {
    pub session: Option<ChatSession>,
    pub messages: Vec<ChatMessage>,
    pub draft: Option<Draft>,
}

#[derive(Debug, Default)]
struct ClientState {
    session: Option<ChatSession>,
    messages: Vec<ChatMessage>,
    draft: Option<Draft>,
}

/// Per-client view: the current session pointer, its transcript and the draft.
///
/// Only this client's own actions mutate it. The lock is never held across an await.
#[derive(Debug)]
pub struct ClientContext {
    user_id: String,
    state: Mutex<ClientState>,
}

impl ClientContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            state: Mutex::new(ClientState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn current_session(&self) -> Option<ChatSession> {
        self.state().session.clone()
    }

    /// Whether `session_id` is still the session this client is looking at.
    pub fn is_target(&self, session_id: &str) -> bool {
        self.state()
            .session
            .as_ref()
            .is_some_and(|s| s.id == session_id)
    }

    pub fn view(&self) -> TranscriptView {
        let state = self.state();
        TranscriptView {
            session: state.session.clone(),
            messages: state.messages.clone(),
            draft: state.draft.clone(),
        }
    }

    /// Last `n` messages of `session_id`, if it is the open session.
    pub fn recent_messages(&self, session_id: &str, n: usize) -> Option<Vec<ChatMessage>> {
        let state = self.state();
        match &state.session {
            Some(s) if s.id == session_id => {
                let start = state.messages.len().saturating_sub(n);
                Some(state.messages[start..].to_vec())
            }
            _ => None,
        }
    }

    /// Replace the open session and transcript. Any draft is abandoned.
    pub(crate) fn load(&self, session: ChatSession, messages: Vec<ChatMessage>) {
        let mut state = self.state();
        if let Some(draft) = state.draft.take() {
            debug!("Abandoning draft for session {}", draft.session_id);
        }
        state.session = Some(session);
        state.messages = messages;
    }

    pub(crate) fn push_if_target(&self, msg: &ChatMessage) -> bool {
        let mut state = self.state();
        let is_target = state.session.as_ref().is_some_and(|s| s.id == msg.session_id);
        if is_target {
            state.messages.push(msg.clone());
        }
        is_target
    }

    pub(crate) fn set_draft_if_target(&self, session_id: &str, text: &str) -> bool {
        let mut state = self.state();
        let is_target = state.session.as_ref().is_some_and(|s| s.id == session_id);
        if is_target {
            state.draft = Some(Draft {
                session_id: session_id.to_string(),
                text: text.to_string(),
            });
        }
        is_target
    }

    pub(crate) fn clear_draft(&self, session_id: &str) {
        let mut state = self.state();
        if state.draft.as_ref().is_some_and(|d| d.session_id == session_id) {
            state.draft = None;
        }
    }

    fn clear_transcript(&self, session_id: &str) {
        let mut state = self.state();
        if state.session.as_ref().is_some_and(|s| s.id == session_id) {
            state.messages.clear();
            state.draft = None;
        }
    }

    pub(crate) fn reset(&self) {
        *self.state() = ClientState::default();
    }
}

/// Creates, finds and switches chat sessions.
pub struct SessionManager {
    store: Arc<dyn TranscriptStore>,
    event_bus: Arc<EventBus>,
    // One gate per user so concurrent cold starts create at most one session.
    cold_starts: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn TranscriptStore>, event_bus: Arc<EventBus>) -> Self {
        Self {
            store,
            event_bus,
            cold_starts: Mutex::new(HashMap::new()),
        }
    }

    fn cold_start_gate(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self
            .cold_starts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        gates
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// The user's most recently updated session, created on first use.
    pub async fn get_or_create_current(
        &self,
        user: &User,
        channel_id: &str,
        model_id: &str,
    ) -> Result<ChatSession, SessionError> {
        let gate = self.cold_start_gate(&user.id);
        let _guard = gate.lock().await;

        if let Some(latest) = self.store.list_sessions(&user.id).await?.into_iter().next() {
            self.forget_gate(&user.id);
            return Ok(latest);
        }

        let session = ChatSession::new(&user.id, channel_id, model_id);
        self.store.create_session(&session).await?;
        info!(
            "Created first session {} for {} (channel={}, model={})",
            session.id, user, channel_id, model_id
        );
        self.forget_gate(&user.id);
        Ok(session)
    }

    // Sessions are never deleted, so once one exists the gate has nothing left to guard.
    fn forget_gate(&self, user_id: &str) {
        let mut gates = self
            .cold_starts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        gates.remove(user_id);
    }

    /// `get_or_create_current`, then load it into the client.
    pub async fn open_current(
        &self,
        client: &ClientContext,
        user: &User,
        channel_id: &str,
        model_id: &str,
    ) -> Result<ChatSession, SessionError> {
        let session = self.get_or_create_current(user, channel_id, model_id).await?;
        let messages = self.store.list_by_session(&session.id).await?;
        client.load(session.clone(), messages);
        self.event_bus.publish(Event::SessionChanged(session.clone()));
        Ok(session)
    }

    /// Load another of the user's sessions into the client. Persisted state is untouched.
    pub async fn switch_to(
        &self,
        client: &ClientContext,
        session_id: &str,
    ) -> Result<ChatSession, SessionError> {
        let session = self
            .store
            .find_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if session.user_id != client.user_id() {
            return Err(SessionError::NotOwned(session_id.to_string()));
        }

        let messages = self.store.list_by_session(&session.id).await?;
        debug!("Switching to session {} ({} messages)", session.id, messages.len());
        client.load(session.clone(), messages);
        self.event_bus.publish(Event::SessionChanged(session.clone()));
        Ok(session)
    }

    /// Always creates a fresh session and makes it the client's current one.
    pub async fn start_new(
        &self,
        client: &ClientContext,
        user: &User,
        channel_id: &str,
        model_id: &str,
    ) -> Result<ChatSession, SessionError> {
        let session = ChatSession::new(&user.id, channel_id, model_id);
        self.store.create_session(&session).await?;
        info!("Started new session {} for {}", session.id, user);

        client.load(session.clone(), Vec::new());
        self.event_bus.publish(Event::SessionChanged(session.clone()));
        Ok(session)
    }

    pub async fn history(&self, user: &User) -> Result<Vec<ChatSession>, SessionError> {
        Ok(self.store.list_sessions(&user.id).await?)
    }

    /// Delete every message of the client's current session.
    pub async fn clear_current(
        &self,
        client: &ClientContext,
        confirmed: bool,
    ) -> Result<u64, SessionError> {
        if !confirmed {
            return Err(SessionError::NotConfirmed);
        }
        let session = client.current_session().ok_or(SessionError::NoCurrentSession)?;

        let removed = self.store.clear_session(&session.id).await?;
        client.clear_transcript(&session.id);
        info!("Cleared {} messages from session {}", removed, session.id);
        self.event_bus.publish(Event::SessionChanged(session));
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::user;
    use crate::chat::MessageRole;
    use crate::store::Store;
    use chrono::Duration;

    async fn setup() -> (Arc<Store>, SessionManager) {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let manager = SessionManager::new(store.clone(), Arc::new(EventBus::new()));
        (store, manager)
    }

    #[tokio::test]
    async fn get_or_create_is_stable_without_start_new() {
        let (store, manager) = setup().await;
        let u = user("alice");

        let first = manager.get_or_create_current(&u, "general", "gpt-4o-mini").await.unwrap();
        let second = manager.get_or_create_current(&u, "coding", "gpt-4o").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.channel_id, "general");
        assert_eq!(store.list_sessions("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_cold_starts_create_one_session() {
        let (store, manager) = setup().await;
        let manager = Arc::new(manager);
        let u = user("bob");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let u = u.clone();
                tokio::spawn(async move {
                    manager.get_or_create_current(&u, "general", "gpt-4o-mini").await.unwrap().id
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.list_sessions("bob").await.unwrap().len(), 1);
        assert!(manager.cold_starts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn most_recently_updated_session_is_current() {
        let (store, manager) = setup().await;
        let u = user("carol");

        let mut older = ChatSession::new("carol", "general", "gpt-4o-mini");
        older.updated_at = older.updated_at - Duration::hours(1);
        let newer = ChatSession::new("carol", "coding", "gpt-4o");
        store.create_session(&older).await.unwrap();
        store.create_session(&newer).await.unwrap();

        let current = manager.get_or_create_current(&u, "general", "gpt-4o-mini").await.unwrap();
        assert_eq!(current.id, newer.id);

        // An append to the older session makes it the most recent one.
        let mut msg = ChatMessage::new(&older, MessageRole::User, "bump", None, 0);
        msg.created_at = newer.updated_at + Duration::seconds(1);
        store.append(&msg).await.unwrap();
        let current = manager.get_or_create_current(&u, "general", "gpt-4o-mini").await.unwrap();
        assert_eq!(current.id, older.id);
    }

    #[tokio::test]
    async fn start_new_always_creates_and_becomes_current() {
        let (_store, manager) = setup().await;
        let u = user("dave");
        let client = ClientContext::new("dave");

        let opened = manager.open_current(&client, &u, "general", "gpt-4o-mini").await.unwrap();
        let fresh = manager.start_new(&client, &u, "coding", "gpt-4o").await.unwrap();

        assert_ne!(opened.id, fresh.id);
        assert!(client.is_target(&fresh.id));
        assert!(client.view().messages.is_empty());

        let current = manager.get_or_create_current(&u, "general", "gpt-4o-mini").await.unwrap();
        assert_eq!(current.id, fresh.id);
    }

    #[tokio::test]
    async fn switch_loads_history_and_drops_draft() {
        let (store, manager) = setup().await;
        let u = user("erin");
        let client = ClientContext::new("erin");

        let first = manager.start_new(&client, &u, "general", "gpt-4o-mini").await.unwrap();
        let msg = ChatMessage::new(&first, MessageRole::User, "hello", None, 0);
        store.append(&msg).await.unwrap();

        let second = manager.start_new(&client, &u, "general", "gpt-4o-mini").await.unwrap();
        assert!(client.set_draft_if_target(&second.id, "partial"));

        manager.switch_to(&client, &first.id).await.unwrap();
        let view = client.view();
        assert_eq!(view.session.unwrap().id, first.id);
        assert_eq!(view.messages, vec![msg]);
        assert!(view.draft.is_none());
    }

    #[tokio::test]
    async fn switch_rejects_foreign_and_missing_sessions() {
        let (store, manager) = setup().await;
        let client = ClientContext::new("frank");
        let foreign = ChatSession::new("someone-else", "general", "gpt-4o-mini");
        store.create_session(&foreign).await.unwrap();

        assert!(matches!(
            manager.switch_to(&client, &foreign.id).await,
            Err(SessionError::NotOwned(_))
        ));
        assert!(matches!(
            manager.switch_to(&client, "session_missing").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn clear_requires_confirmation() {
        let (store, manager) = setup().await;
        let u = user("gina");
        let client = ClientContext::new("gina");

        assert!(matches!(
            manager.clear_current(&client, true).await,
            Err(SessionError::NoCurrentSession)
        ));

        let session = manager.start_new(&client, &u, "general", "gpt-4o-mini").await.unwrap();
        let msg = ChatMessage::new(&session, MessageRole::User, "hi", None, 0);
        store.append(&msg).await.unwrap();
        client.push_if_target(&msg);

        assert!(matches!(
            manager.clear_current(&client, false).await,
            Err(SessionError::NotConfirmed)
        ));
        assert_eq!(store.list_by_session(&session.id).await.unwrap().len(), 1);

        assert_eq!(manager.clear_current(&client, true).await.unwrap(), 1);
        assert!(client.view().messages.is_empty());
        assert!(store.list_by_session(&session.id).await.unwrap().is_empty());
    }

    #[test]
    fn recent_messages_only_for_open_session() {
        let client = ClientContext::new("hank");
        let session = ChatSession::new("hank", "general", "gpt-4o-mini");
        let messages: Vec<_> = (0..5)
            .map(|i| ChatMessage::new(&session, MessageRole::User, format!("m{}", i), None, 0))
            .collect();
        client.load(session.clone(), messages);

        let recent = client.recent_messages(&session.id, 2).unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
        assert!(client.recent_messages("other", 2).is_none());
    }
}
