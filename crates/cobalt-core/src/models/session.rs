//! Conversational session data structures.
//!
//! Sessions hold an append-only message log. A turn in a session may spawn
//! a task, which carries a [`crate::models::task::TaskOrigin::Chat`]
//! back-reference to the session and message that created it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// The human user.
    User,
    /// An agent responding in the session.
    Agent,
    /// The orchestration core itself (status notices, task outcomes).
    System,
}

/// A single message within a conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique identifier for the message.
    pub id: String,
    /// Message author.
    pub role: MessageRole,
    /// Message body.
    pub content: String,
    /// Task spawned by this message, if any.
    pub task_id: Option<String>,
    /// Timestamp when the message was appended.
    pub created_at: DateTime<Utc>,
}

/// A conversation session: metadata plus an append-only message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    /// Unique identifier for the session.
    pub id: String,
    /// The agent conversing in this session, once one responded.
    pub agent_id: Option<String>,
    /// Optional human-readable title.
    pub title: Option<String>,
    /// Messages in append order. Timestamps are monotonically non-decreasing.
    pub messages: Vec<ChatMessage>,
    /// Timestamp when the session was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent append.
    pub last_activity: DateTime<Utc>,
}

impl ConversationSession {
    /// Creates a new empty session.
    #[must_use]
    pub fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            agent_id: None,
            title: None,
            messages: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Appends a message to the log.
    ///
    /// The log is append-only; existing messages are never mutated. The
    /// message timestamp is clamped to the previous entry's so the log
    /// stays monotonic under clock skew.
    pub fn append(&mut self, mut message: ChatMessage) {
        if let Some(last) = self.messages.last() {
            if message.created_at < last.created_at {
                message.created_at = last.created_at;
            }
        }
        self.last_activity = message.created_at;
        self.messages.push(message);
    }

    /// Looks up a message by id.
    #[must_use]
    pub fn message(&self, message_id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(id: &str, at: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            role: MessageRole::User,
            content: "hello".to_string(),
            task_id: None,
            created_at: at,
        }
    }

    #[test]
    fn test_append_only_log() {
        let mut session = ConversationSession::new("session-1".to_string());
        let now = Utc::now();

        session.append(message("m1", now));
        session.append(message("m2", now + Duration::seconds(1)));

        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.message("m1").unwrap().id, "m1");
        assert_eq!(session.last_activity, now + Duration::seconds(1));
    }

    #[test]
    fn test_timestamps_stay_monotonic() {
        let mut session = ConversationSession::new("session-1".to_string());
        let now = Utc::now();

        session.append(message("m1", now));
        // Skewed clock: earlier than the previous entry
        session.append(message("m2", now - Duration::seconds(5)));

        assert_eq!(session.messages[1].created_at, now);
    }
}
