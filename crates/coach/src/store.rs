use std::collections::HashMap;

use runsync_transport::{MessageId, ServerMessage, SessionRef};

use super::message::{LocalMessageId, Message, MessageKey};

/// Identifier of one send/response cycle inside a session instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnToken(pub u64);

/// The at most two provisional entries a turn owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProvisionalTurn {
    user: LocalMessageId,
    assistant: Option<LocalMessageId>,
}

/// Ordered message list of one conversation surface.
///
/// Provisional entries are tracked per turn so reconciliation and rollback touch only
/// the entries the turn created.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    turns: HashMap<TurnToken, ProvisionalTurn>,
    next_turn: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, key: MessageKey) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == key)
    }

    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().find(|message| message.streaming)
    }

    pub fn has_turn(&self, token: TurnToken) -> bool {
        self.turns.contains_key(&token)
    }

    /// Replaces the whole list with the authoritative server history.
    pub fn replace_with_server(&mut self, messages: Vec<ServerMessage>) {
        self.messages = messages.into_iter().map(Message::from_server).collect();
        self.turns.clear();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.turns.clear();
    }

    /// Appends the provisional user message of a new turn.
    pub fn begin_turn(&mut self, content: impl Into<String>) -> TurnToken {
        self.next_turn = self.next_turn.saturating_add(1);
        let token = TurnToken(self.next_turn);
        let user = LocalMessageId::new_v7();

        self.messages.push(Message::user_pending(user, content));
        self.turns.insert(
            token,
            ProvisionalTurn {
                user,
                assistant: None,
            },
        );
        token
    }

    /// Appends the turn's empty assistant entry.
    ///
    /// A streaming placeholder is refused while another message is still streaming.
    pub fn attach_placeholder(&mut self, token: TurnToken, streaming: bool) -> bool {
        if streaming && self.streaming_message().is_some() {
            return false;
        }

        let Some(turn) = self.turns.get_mut(&token) else {
            return false;
        };
        if turn.assistant.is_some() {
            return false;
        }

        let assistant = LocalMessageId::new_v7();
        turn.assistant = Some(assistant);
        self.messages
            .push(Message::assistant_placeholder(assistant, streaming));
        true
    }

    pub fn append_thought(&mut self, token: TurnToken, chunk: &str) -> bool {
        self.with_assistant(token, |message| message.append_thought(chunk))
    }

    pub fn append_text(&mut self, token: TurnToken, chunk: &str) -> bool {
        self.with_assistant(token, |message| message.append_text(chunk))
    }

    /// Swaps the turn's provisional identifiers for the server-issued ones.
    pub fn reconcile(
        &mut self,
        token: TurnToken,
        user_message_id: MessageId,
        coach_message_id: MessageId,
        sessions_affected: Option<Vec<SessionRef>>,
    ) -> bool {
        let Some(turn) = self.turns.remove(&token) else {
            return false;
        };

        if let Some(message) = self.find_mut(MessageKey::Provisional(turn.user)) {
            message.confirm(user_message_id);
        }
        if let Some(assistant) = turn.assistant
            && let Some(message) = self.find_mut(MessageKey::Provisional(assistant))
        {
            message.confirm(coach_message_id);
            message.sessions_affected = sessions_affected;
        }
        true
    }

    /// Drops the turn's provisional entries and appends the confirmed pair in order.
    pub fn replace_turn(
        &mut self,
        token: TurnToken,
        user_message: ServerMessage,
        coach_message: ServerMessage,
    ) -> bool {
        if !self.rollback(token) {
            return false;
        }

        self.messages.push(Message::from_server(user_message));
        self.messages.push(Message::from_server(coach_message));
        true
    }

    /// Removes every provisional entry the turn inserted.
    pub fn rollback(&mut self, token: TurnToken) -> bool {
        let Some(turn) = self.turns.remove(&token) else {
            return false;
        };

        let user = MessageKey::Provisional(turn.user);
        let assistant = turn.assistant.map(MessageKey::Provisional);
        self.messages
            .retain(|message| message.id != user && Some(message.id) != assistant);
        true
    }

    fn with_assistant(&mut self, token: TurnToken, apply: impl FnOnce(&mut Message)) -> bool {
        let Some(assistant) = self.turns.get(&token).and_then(|turn| turn.assistant) else {
            return false;
        };

        match self.find_mut(MessageKey::Provisional(assistant)) {
            Some(message) => {
                apply(message);
                true
            }
            None => false,
        }
    }

    fn find_mut(&mut self, key: MessageKey) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| message.id == key)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use runsync_transport::Role;

    use super::*;

    fn server_message(id: i64, role: Role, content: &str) -> ServerMessage {
        ServerMessage {
            id: MessageId::new(id),
            role,
            content: content.to_string(),
            thinking: None,
            created_at: Utc::now(),
            sessions_affected: None,
        }
    }

    fn store_with_history() -> MessageStore {
        let mut store = MessageStore::new();
        store.replace_with_server(vec![
            server_message(1, Role::User, "How far this week?"),
            server_message(2, Role::Assistant, "About 42km."),
        ]);
        store
    }

    #[test]
    fn fold_appends_in_arrival_order() {
        let mut store = store_with_history();
        let turn = store.begin_turn("And next week?");
        assert!(store.attach_placeholder(turn, true));

        assert!(store.append_thought(turn, "a"));
        assert!(store.append_thought(turn, "b"));
        assert!(store.append_text(turn, "X"));
        assert!(store.append_text(turn, "Y"));

        let assistant = store.streaming_message().expect("streaming entry");
        assert_eq!(assistant.thinking.as_deref(), Some("ab"));
        assert_eq!(assistant.content, "XY");
    }

    #[test]
    fn reconcile_assigns_server_ids_to_both_entries() {
        let mut store = store_with_history();
        let turn = store.begin_turn("Rest day?");
        store.attach_placeholder(turn, true);
        store.append_text(turn, "Yes.");

        assert!(store.reconcile(turn, MessageId::new(3), MessageId::new(4), None));
        assert!(!store.has_turn(turn));

        let ids = store
            .messages()
            .iter()
            .map(|message| message.id)
            .collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec![
                MessageKey::Confirmed(MessageId::new(1)),
                MessageKey::Confirmed(MessageId::new(2)),
                MessageKey::Confirmed(MessageId::new(3)),
                MessageKey::Confirmed(MessageId::new(4)),
            ]
        );
        assert!(store.messages().iter().all(|m| !m.pending && !m.streaming));
    }

    #[test]
    fn rollback_restores_previous_list() {
        let mut store = store_with_history();
        let before = store.messages().to_vec();

        let turn = store.begin_turn("Can I skip?");
        store.attach_placeholder(turn, true);
        store.append_text(turn, "partial");
        assert!(store.rollback(turn));

        assert_eq!(store.messages(), before.as_slice());
        assert!(!store.rollback(turn));
    }

    #[test]
    fn only_one_streaming_placeholder_at_a_time() {
        let mut store = MessageStore::new();
        let first = store.begin_turn("one");
        assert!(store.attach_placeholder(first, true));

        let second = store.begin_turn("two");
        assert!(!store.attach_placeholder(second, true));
        assert!(store.attach_placeholder(second, false));
    }

    #[test]
    fn replace_turn_keeps_user_before_assistant() {
        let mut store = store_with_history();
        let turn = store.begin_turn("Long run?");

        assert!(store.replace_turn(
            turn,
            server_message(7, Role::User, "Long run?"),
            server_message(8, Role::Assistant, "Sunday, 25km."),
        ));

        let tail = &store.messages()[2..];
        assert_eq!(tail[0].role, Role::User);
        assert_eq!(tail[1].role, Role::Assistant);
        assert_eq!(tail[1].id, MessageKey::Confirmed(MessageId::new(8)));
    }

    #[test]
    fn fold_without_placeholder_is_rejected() {
        let mut store = MessageStore::new();
        let turn = store.begin_turn("hello");
        assert!(!store.append_text(turn, "X"));
        assert!(!store.append_text(TurnToken(99), "X"));
    }
}
