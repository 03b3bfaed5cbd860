use runsync_transport::{GoalId, Thread};

use super::trigger::TriggerToken;

/// Which branch of a send failed, for the host's transient error banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendFailureKind {
    ThreadCreation,
    StreamTransport,
    StreamAborted,
    NonStreaming,
}

impl SendFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThreadCreation => "thread-creation",
            Self::StreamTransport => "stream-transport",
            Self::StreamAborted => "stream-aborted",
            Self::NonStreaming => "non-streaming",
        }
    }
}

/// Notifications a session engine emits to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A turn modified planned sessions; plan and calendar views should reload.
    PlanChanged,
    /// A thread was founded for a goal that had none.
    ThreadCreated(Thread),
    /// An auto message was fed into the engine; the owner should clear its trigger.
    AutoMessageConsumed {
        token: TriggerToken,
        goal_id: GoalId,
        value: String,
    },
    /// A send failed and its provisional messages were rolled back.
    SendFailed {
        kind: SendFailureKind,
        reason: String,
    },
}
