//! Conversation types and transcript state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Ordered messages of one session, oldest first.
///
/// At most one assistant message is open (still receiving text) at a time.
/// Only the open message's content can change.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    open: Option<Uuid>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a closed assistant greeting
    pub fn with_greeting(greeting: &str) -> Self {
        Self {
            messages: vec![Message::new(Role::Assistant, greeting)],
            open: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn open_id(&self) -> Option<Uuid> {
        self.open
    }

    pub fn open_message(&self) -> Option<&Message> {
        let id = self.open?;
        self.messages.iter().rev().find(|m| m.id == id)
    }

    /// Append the user's prompt and an empty open assistant message.
    ///
    /// Returns `(user_id, assistant_id)`, or `None` without touching the
    /// transcript when a message is already open.
    pub fn begin_exchange(&mut self, prompt: &str) -> Option<(Uuid, Uuid)> {
        if self.open.is_some() {
            return None;
        }

        let user = Message::new(Role::User, prompt);
        let assistant = Message::new(Role::Assistant, String::new());
        let ids = (user.id, assistant.id);

        self.messages.push(user);
        self.messages.push(assistant);
        self.open = Some(ids.1);
        Some(ids)
    }

    /// Append streamed text to the open message. Returns false if none is open.
    pub fn append_to_open(&mut self, text: &str) -> bool {
        match self.open_message_mut() {
            Some(message) => {
                message.content.push_str(text);
                true
            }
            None => false,
        }
    }

    /// Replace the open message's content and close it.
    pub fn close_open(&mut self, content: String) -> Option<Uuid> {
        let message = self.open_message_mut()?;
        message.content = content;
        let id = message.id;
        self.open = None;
        Some(id)
    }

    fn open_message_mut(&mut self) -> Option<&mut Message> {
        let id = self.open?;
        self.messages.iter_mut().rev().find(|m| m.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_exchange() {
        let mut transcript = Transcript::new();

        let (user_id, assistant_id) = transcript.begin_exchange("hi").unwrap();

        assert_eq!(transcript.messages().len(), 2);
        assert_eq!(transcript.messages()[0].id, user_id);
        assert_eq!(transcript.messages()[0].role, Role::User);
        assert_eq!(transcript.messages()[0].content, "hi");
        assert_eq!(transcript.messages()[1].id, assistant_id);
        assert_eq!(transcript.messages()[1].role, Role::Assistant);
        assert!(transcript.messages()[1].content.is_empty());
        assert_eq!(transcript.open_id(), Some(assistant_id));
    }

    #[test]
    fn test_only_one_open_message() {
        let mut transcript = Transcript::new();
        transcript.begin_exchange("first").unwrap();

        assert!(transcript.begin_exchange("second").is_none());
        assert_eq!(transcript.messages().len(), 2);
    }

    #[test]
    fn test_append_then_close_overwrites() {
        let mut transcript = Transcript::with_greeting("Hello there");
        let (_, assistant_id) = transcript.begin_exchange("q").unwrap();

        assert!(transcript.append_to_open("He"));
        assert!(transcript.append_to_open("llo"));
        assert_eq!(transcript.open_message().unwrap().content, "Hello");

        assert_eq!(transcript.close_open("Final".to_string()), Some(assistant_id));
        assert_eq!(transcript.messages()[2].content, "Final");
        assert!(transcript.open_id().is_none());

        // Closed messages no longer change
        assert!(!transcript.append_to_open("late"));
        assert!(transcript.close_open("again".to_string()).is_none());
        assert_eq!(transcript.messages()[2].content, "Final");
    }

    #[test]
    fn test_greeting_is_closed() {
        let transcript = Transcript::with_greeting("Hi!");

        assert_eq!(transcript.messages().len(), 1);
        assert_eq!(transcript.messages()[0].role, Role::Assistant);
        assert!(transcript.open_message().is_none());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }
}
