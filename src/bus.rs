use crate::chat::{ChatMessage, ChatSession};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// The in-progress assistant text grew. Never persisted.
    DraftUpdated {
        user_id: String,
        session_id: String,
        text: String,
    },

    /// A message was durably recorded
    MessageCommitted(ChatMessage),

    /// A client's current session changed (opened, switched, started or cleared)
    SessionChanged(ChatSession),
}

impl Event {
    /// The user whose client this event concerns.
    pub fn user_id(&self) -> &str {
        match self {
            Event::DraftUpdated { user_id, .. } => user_id,
            Event::MessageCommitted(msg) => &msg.user_id,
            Event::SessionChanged(session) => &session.user_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::DraftUpdated { .. } => "draft_updated",
            Event::MessageCommitted(_) => "message_committed",
            Event::SessionChanged(_) => "session_changed",
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
