use std::fmt;

use runsync_transport::{GoalId, ThreadId, TransportError};
use snafu::Snafu;

use super::events::SendFailureKind;

/// Guard that refused a send before any state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    EmptyText,
    NoGoalBound,
    ThreadNotReady,
    TurnInFlight,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::EmptyText => "message is empty",
            Self::NoGoalBound => "no goal is bound to the session",
            Self::ThreadNotReady => "the goal's thread is not loaded",
            Self::TurnInFlight => "another turn is still in flight",
        };
        formatter.write_str(reason)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("send rejected on `{stage}`: {reason}"))]
    SendRejected {
        stage: &'static str,
        reason: RejectReason,
    },
    #[snafu(display("failed to create a thread for goal {goal_id} on `{stage}`: {source}"))]
    ThreadCreationFailed {
        stage: &'static str,
        goal_id: GoalId,
        source: TransportError,
    },
    #[snafu(display("failed to stream a reply in thread {thread_id} on `{stage}`: {source}"))]
    StreamTransportFailed {
        stage: &'static str,
        thread_id: ThreadId,
        source: TransportError,
    },
    #[snafu(display("coach aborted the reply in thread {thread_id}: {reason}"))]
    StreamAborted {
        stage: &'static str,
        thread_id: ThreadId,
        reason: String,
    },
    #[snafu(display("failed to send a message in thread {thread_id} on `{stage}`: {source}"))]
    NonStreamingSendFailed {
        stage: &'static str,
        thread_id: ThreadId,
        source: TransportError,
    },
    #[snafu(display("failed to resolve the thread of goal {goal_id} on `{stage}`: {source}"))]
    ThreadResolutionFailed {
        stage: &'static str,
        goal_id: GoalId,
        source: TransportError,
    },
    #[snafu(display("failed to archive thread {thread_id} on `{stage}`: {source}"))]
    ThreadArchiveFailed {
        stage: &'static str,
        thread_id: ThreadId,
        source: TransportError,
    },
    #[snafu(display("failed to restore thread {thread_id} on `{stage}`: {source}"))]
    ThreadRestoreFailed {
        stage: &'static str,
        thread_id: ThreadId,
        source: TransportError,
    },
    #[snafu(display("{failed} of {total} activities could not be reclassified: {source}"))]
    BatchClassificationFailed {
        stage: &'static str,
        failed: usize,
        total: usize,
        source: TransportError,
    },
    #[snafu(display("session is busy on `{stage}`"))]
    Busy { stage: &'static str },
}

impl SessionError {
    /// Banner category of a failed send; `None` for errors that are not send failures.
    pub fn failure_kind(&self) -> Option<SendFailureKind> {
        match self {
            Self::ThreadCreationFailed { .. } => Some(SendFailureKind::ThreadCreation),
            Self::StreamTransportFailed { .. } => Some(SendFailureKind::StreamTransport),
            Self::StreamAborted { .. } => Some(SendFailureKind::StreamAborted),
            Self::NonStreamingSendFailed { .. } => Some(SendFailureKind::NonStreaming),
            Self::SendRejected { .. }
            | Self::ThreadResolutionFailed { .. }
            | Self::ThreadArchiveFailed { .. }
            | Self::ThreadRestoreFailed { .. }
            | Self::BatchClassificationFailed { .. }
            | Self::Busy { .. } => None,
        }
    }

    /// Human-readable reason shown to the user; the coach's own text for aborted streams.
    pub fn reason(&self) -> String {
        match self {
            Self::StreamAborted { reason, .. } => reason.clone(),
            Self::ThreadCreationFailed { source, .. }
            | Self::StreamTransportFailed { source, .. }
            | Self::NonStreamingSendFailed { source, .. }
            | Self::ThreadResolutionFailed { source, .. }
            | Self::ThreadArchiveFailed { source, .. }
            | Self::ThreadRestoreFailed { source, .. }
            | Self::BatchClassificationFailed { source, .. } => source.to_string(),
            Self::SendRejected { reason, .. } => reason.to_string(),
            Self::Busy { .. } => self.to_string(),
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::SendRejected { .. })
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
