use std::fmt;

use chrono::{DateTime, Utc};
use runsync_transport::{MessageId, Role, ServerMessage, SessionRef};
use uuid::Uuid;

/// Client-minted identifier for a message the server has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalMessageId(pub Uuid);

impl LocalMessageId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for LocalMessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "local-{}", self.0)
    }
}

/// Message identity.
///
/// Provisional keys live in a separate variant so they can never collide with a
/// server identifier already present in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Provisional(LocalMessageId),
    Confirmed(MessageId),
}

impl MessageKey {
    pub fn server_id(&self) -> Option<MessageId> {
        match self {
            Self::Confirmed(id) => Some(*id),
            Self::Provisional(_) => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(id) => write!(formatter, "{id}"),
            Self::Confirmed(id) => write!(formatter, "{id}"),
        }
    }
}

/// One entry of a conversation surface's message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageKey,
    pub role: Role,
    pub content: String,
    /// Reasoning channel of assistant replies; always `None` for user messages.
    pub thinking: Option<String>,
    pub created_at: DateTime<Utc>,
    pub pending: bool,
    pub streaming: bool,
    pub sessions_affected: Option<Vec<SessionRef>>,
}

impl Message {
    /// Creates the optimistic copy of an outbound user message.
    pub fn user_pending(id: LocalMessageId, content: impl Into<String>) -> Self {
        Self {
            id: MessageKey::Provisional(id),
            role: Role::User,
            content: content.into(),
            thinking: None,
            created_at: Utc::now(),
            pending: true,
            streaming: false,
            sessions_affected: None,
        }
    }

    /// Creates an empty assistant entry that a reply is folded into.
    pub fn assistant_placeholder(id: LocalMessageId, streaming: bool) -> Self {
        Self {
            id: MessageKey::Provisional(id),
            role: Role::Assistant,
            content: String::new(),
            thinking: None,
            created_at: Utc::now(),
            pending: true,
            streaming,
            sessions_affected: None,
        }
    }

    pub fn from_server(message: ServerMessage) -> Self {
        let thinking = match message.role {
            Role::User => None,
            Role::Assistant | Role::System => message.thinking,
        };

        Self {
            id: MessageKey::Confirmed(message.id),
            role: message.role,
            content: message.content,
            thinking,
            created_at: message.created_at,
            pending: false,
            streaming: false,
            sessions_affected: message.sessions_affected,
        }
    }

    pub fn touches_plan(&self) -> bool {
        self.sessions_affected
            .as_ref()
            .is_some_and(|sessions| !sessions.is_empty())
    }

    pub(crate) fn append_thought(&mut self, chunk: &str) {
        if matches!(self.role, Role::User) {
            return;
        }
        self.thinking.get_or_insert_with(String::new).push_str(chunk);
    }

    pub(crate) fn append_text(&mut self, chunk: &str) {
        self.content.push_str(chunk);
    }

    pub(crate) fn confirm(&mut self, id: MessageId) {
        self.id = MessageKey::Confirmed(id);
        self.pending = false;
        self.streaming = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_message(role: Role, thinking: Option<&str>) -> ServerMessage {
        ServerMessage {
            id: MessageId::new(4),
            role,
            content: "Tempo on Thursday".to_string(),
            thinking: thinking.map(str::to_string),
            created_at: Utc::now(),
            sessions_affected: None,
        }
    }

    #[test]
    fn server_user_messages_never_carry_thinking() {
        let message = Message::from_server(server_message(Role::User, Some("leaked")));
        assert_eq!(message.thinking, None);
        assert!(!message.pending);
        assert_eq!(message.id.server_id(), Some(MessageId::new(4)));
    }

    #[test]
    fn assistant_messages_keep_thinking() {
        let message = Message::from_server(server_message(Role::Assistant, Some("load is high")));
        assert_eq!(message.thinking.as_deref(), Some("load is high"));
    }

    #[test]
    fn thoughts_are_ignored_on_user_messages() {
        let mut message = Message::user_pending(LocalMessageId::new_v7(), "hi");
        message.append_thought("should not stick");
        assert_eq!(message.thinking, None);
    }

    #[test]
    fn confirm_clears_provisional_flags() {
        let mut message = Message::assistant_placeholder(LocalMessageId::new_v7(), true);
        assert!(message.id.is_provisional());

        message.confirm(MessageId::new(9));
        assert_eq!(message.id, MessageKey::Confirmed(MessageId::new(9)));
        assert!(!message.pending);
        assert!(!message.streaming);
    }
}
