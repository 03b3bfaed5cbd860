use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use super::error::TransportResult;
use super::ids::{ActivityId, GoalId, ThreadId};
use super::stream::TransportStreamHandle;
use super::types::{ActivityClassification, SendMessageResponse, Thread, ThreadInit};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000/api/v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout: Option<Duration>,
    pub streaming: bool,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().to_string(),
            token: None,
            request_timeout: None,
            streaming: true,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into().trim().to_string();
        self.token = if token.is_empty() { None } else { Some(token) };
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

/// Request/response and token-stream calls the coaching session engine relies on.
///
/// Timeouts and connection failures surface as rejected futures; a stream that fails
/// after it started reports a terminal `error` event instead.
pub trait CoachTransport: Send + Sync {
    fn supports_streaming(&self) -> bool {
        true
    }

    fn create_thread<'a>(
        &'a self,
        goal_id: GoalId,
        init: ThreadInit,
    ) -> BoxFuture<'a, TransportResult<Thread>>;

    fn get_thread<'a>(&'a self, thread_id: ThreadId) -> BoxFuture<'a, TransportResult<Thread>>;

    /// Lists the goal's threads that are not archived.
    fn list_threads<'a>(&'a self, goal_id: GoalId) -> BoxFuture<'a, TransportResult<Vec<Thread>>>;

    /// Lists every thread of the goal, archived ones included.
    fn list_all_threads<'a>(
        &'a self,
        goal_id: GoalId,
    ) -> BoxFuture<'a, TransportResult<Vec<Thread>>>;

    /// Soft-deletes a thread; its history stays readable and restorable.
    fn archive_thread<'a>(&'a self, thread_id: ThreadId) -> BoxFuture<'a, TransportResult<()>>;

    fn restore_thread<'a>(&'a self, thread_id: ThreadId) -> BoxFuture<'a, TransportResult<()>>;

    fn send_message<'a>(
        &'a self,
        thread_id: ThreadId,
        content: &'a str,
    ) -> BoxFuture<'a, TransportResult<SendMessageResponse>>;

    fn stream_message<'a>(
        &'a self,
        thread_id: ThreadId,
        content: &'a str,
    ) -> BoxFuture<'a, TransportResult<TransportStreamHandle>>;
}

/// Manual activity reclassification, used by batch selection flows.
pub trait ActivityClassifier: Send + Sync {
    fn classify_activity<'a>(
        &'a self,
        activity_id: ActivityId,
        classification: ActivityClassification,
    ) -> BoxFuture<'a, TransportResult<()>>;
}
