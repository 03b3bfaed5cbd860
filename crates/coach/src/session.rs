use runsync_transport::{BoxFuture, GoalId, MessageId, ThreadId};

use super::error::SessionResult;
use super::message::Message;
use super::state::SessionState;

/// Presentation variant hosting a session engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Surface {
    /// Full chat panel; renders streamed thinking and answer deltas.
    #[default]
    Panel,
    /// Compact floating widget; shows complete replies only.
    FloatingWidget,
}

impl Surface {
    pub fn streams_responses(&self) -> bool {
        matches!(self, Self::Panel)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Panel => "panel",
            Self::FloatingWidget => "floating-widget",
        }
    }
}

/// How a send resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The turn was reconciled with server identifiers.
    Completed {
        user_message_id: MessageId,
        coach_message_id: MessageId,
    },
    /// The message founded a new thread and the store now holds its history.
    ThreadCreated { thread_id: ThreadId },
    /// The surface was rebound or closed while the turn was in flight.
    Discarded,
}

/// Capability shared by every conversation surface.
pub trait CoachSession: Send + Sync {
    fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, SessionResult<TurnOutcome>>;

    fn state(&self) -> SessionState;

    fn messages(&self) -> Vec<Message>;

    fn goal(&self) -> Option<GoalId>;
}
