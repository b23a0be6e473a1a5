use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::message::{Message, Role};
use crate::store::session::SessionStatus;

/// Events fanned out to external subscribers. The persisted log remains the
/// source of truth; a subscriber that lags and drops events reconciles by
/// re-reading the log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    /// A fully-formed message was appended (emitted for `forDisplay != false`).
    PersistentMessage { session_id: String, message: Message },
    /// Partial model output, tagged `model` or `grounding_model`.
    StreamMessage {
        session_id: String,
        role: Role,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
    },
    SessionStatus {
        session_id: String,
        status: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Process-wide broadcast channel. Sending never blocks the agent loop;
/// with no subscribers the event is simply dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    pub fn stream_text(&self, session_id: &str, role: Role, text: &str) {
        self.emit(AgentEvent::StreamMessage {
            session_id: session_id.to_string(),
            role,
            text: Some(text.to_string()),
            thought: None,
        });
    }

    pub fn stream_thought(&self, session_id: &str, role: Role, thought: &str) {
        self.emit(AgentEvent::StreamMessage {
            session_id: session_id.to_string(),
            role,
            text: None,
            thought: Some(thought.to_string()),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
