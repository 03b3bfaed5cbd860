use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::sync::mpsc;

use super::error::{MalformedStreamLineSnafu, TransportResult};
use super::ids::{MessageId, ThreadId};
use super::types::SessionRef;

pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One unit of an incrementally delivered coach reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Reasoning fragment, appended to the in-flight message's `thinking`.
    Thought { content: String },
    /// Answer fragment, appended to the in-flight message's `content`.
    Text { content: String },
    /// Final server identifiers for both messages of the turn.
    Meta {
        #[serde(alias = "userMessageId")]
        user_message_id: MessageId,
        #[serde(alias = "coachMessageId")]
        coach_message_id: MessageId,
        #[serde(
            default,
            alias = "sessions_modified",
            alias = "sessionsAffected",
            alias = "sessionsModified"
        )]
        sessions_affected: Option<Vec<SessionRef>>,
    },
    /// Terminal failure; no further events follow.
    Error { content: String },
}

impl StreamEvent {
    pub fn thought(content: impl Into<String>) -> Self {
        Self::Thought {
            content: content.into(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn meta(user_message_id: MessageId, coach_message_id: MessageId) -> Self {
        Self::Meta {
            user_message_id,
            coach_message_id,
            sessions_affected: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Meta { .. } | Self::Error { .. })
    }
}

/// Receiving half of a token stream for one outbound message.
///
/// Yields nothing after the first terminal event, even if the producer keeps sending.
pub struct CoachEventStream {
    thread_id: ThreadId,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    terminated: bool,
}

pub struct TransportStreamHandle {
    pub stream: CoachEventStream,
    pub worker: TransportWorker,
}

impl CoachEventStream {
    pub(crate) fn new(thread_id: ThreadId, events: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self {
            thread_id,
            events,
            terminated: false,
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.terminated {
            return None;
        }

        let event = self.events.recv().await?;
        self.terminated = event.is_terminal();
        Some(event)
    }
}

/// Builds a connected sender/stream pair for a transport worker to feed.
pub fn make_event_stream(
    thread_id: ThreadId,
) -> (mpsc::UnboundedSender<StreamEvent>, CoachEventStream) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (event_tx, CoachEventStream::new(thread_id, event_rx))
}

/// Incremental decoder for newline-delimited JSON stream bodies.
///
/// Body chunks may split lines (and multi-byte characters) anywhere, so bytes are
/// buffered until a newline completes a line.
#[derive(Debug, Default)]
pub struct StreamLineDecoder {
    buffer: Vec<u8>,
}

impl StreamLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<TransportResult<StreamEvent>> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline).collect::<Vec<_>>();
            if let Some(event) = decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Decodes whatever remains once the body has ended without a trailing newline.
    pub fn finish(&mut self) -> Option<TransportResult<StreamEvent>> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<TransportResult<StreamEvent>> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    // Server-sent-event framing is tolerated; the payload is the same JSON object.
    let line = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if line.is_empty() {
        return None;
    }

    Some(
        serde_json::from_str::<StreamEvent>(line).context(MalformedStreamLineSnafu {
            stage: "decode-stream-line",
            line: line.to_string(),
        }),
    )
}
