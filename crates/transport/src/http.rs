use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use tokio::sync::mpsc;

use super::error::{
    BuildClientSnafu, DecodeSnafu, ReadBodySnafu, RemoteSnafu, RequestSnafu, StatusSnafu,
    TransportError, TransportResult,
};
use super::ids::{ActivityId, GoalId, MessageId, ThreadId};
use super::stream::{
    CoachEventStream, StreamEvent, StreamLineDecoder, TransportStreamHandle, TransportWorker,
    make_event_stream,
};
use super::transport::{
    ActivityClassifier, BoxFuture, CoachTransport, DEFAULT_BACKEND_URL, TransportConfig,
};
use super::types::{ActivityClassification, SendMessageResponse, SessionRef, Thread, ThreadInit};

/// Coaching backend adapter speaking JSON over HTTP and NDJSON for streamed replies.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Option<std::time::Duration>,
    streaming: bool,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    content: &'a str,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout {
            // Streamed bodies outlive any fixed request timeout; the client-wide limit
            // covers connecting only.
            builder = builder.connect_timeout(timeout);
        }
        let http = builder.build().context(BuildClientSnafu {
            stage: "build-http-client",
        })?;

        Ok(Self {
            http,
            base_url: normalize_base_url(&config.base_url),
            token: config.token,
            request_timeout: config.request_timeout,
            streaming: config.streaming,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn timed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.request_timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        stage: &'static str,
        url: String,
        builder: reqwest::RequestBuilder,
    ) -> TransportResult<T> {
        let response = self.timed(builder).send().await.context(RequestSnafu {
            stage,
            url: url.clone(),
        })?;
        let response = ensure_success(stage, &url, response).await?;
        let body = response.text().await.context(ReadBodySnafu {
            stage,
            url: url.clone(),
        })?;

        serde_json::from_str::<T>(&body).context(DecodeSnafu { stage })
    }

    async fn open_stream(&self, thread_id: ThreadId, content: &str) -> TransportResult<reqwest::Response> {
        let url = self.url(&format!("/threads/{thread_id}/messages"));
        let response = self
            .request(reqwest::Method::POST, &url)
            .header(reqwest::header::ACCEPT, "application/x-ndjson")
            .json(&SendMessageRequest { content })
            .send()
            .await
            .context(RequestSnafu {
                stage: "open-message-stream",
                url: url.clone(),
            })?;

        ensure_success("open-message-stream", &url, response).await
    }

    async fn run_stream_worker(
        thread_id: ThreadId,
        response: reqwest::Response,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
    ) {
        let mut body = response.bytes_stream();
        let mut decoder = StreamLineDecoder::new();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for decoded in decoder.push(&bytes) {
                        if !forward_stream_event(thread_id, &event_tx, decoded) {
                            return;
                        }
                    }
                }
                Err(source) => {
                    tracing::warn!(
                        thread_id = %thread_id,
                        error = %source,
                        "message stream body failed mid-flight"
                    );
                    let _ = event_tx.send(StreamEvent::error(source.to_string()));
                    return;
                }
            }
        }

        if let Some(decoded) = decoder.finish() {
            forward_stream_event(thread_id, &event_tx, decoded);
        }
    }

    async fn collect_turn(
        mut stream: CoachEventStream,
    ) -> TransportResult<(MessageId, MessageId, Option<Vec<SessionRef>>)> {
        while let Some(event) = stream.recv().await {
            match event {
                StreamEvent::Thought { .. } | StreamEvent::Text { .. } => {}
                StreamEvent::Meta {
                    user_message_id,
                    coach_message_id,
                    sessions_affected,
                } => return Ok((user_message_id, coach_message_id, sessions_affected)),
                StreamEvent::Error { content } => {
                    return RemoteSnafu {
                        stage: "collect-turn",
                        message: content,
                    }
                    .fail();
                }
            }
        }

        RemoteSnafu {
            stage: "collect-turn",
            message: "stream ended before a terminal event",
        }
        .fail()
    }
}

impl CoachTransport for HttpTransport {
    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn create_thread<'a>(
        &'a self,
        goal_id: GoalId,
        init: ThreadInit,
    ) -> BoxFuture<'a, TransportResult<Thread>> {
        Box::pin(async move {
            let url = self.url(&format!("/threads/goal/{goal_id}"));
            let builder = self.request(reqwest::Method::POST, &url).json(&init);
            self.fetch_json("create-thread", url, builder).await
        })
    }

    fn get_thread<'a>(&'a self, thread_id: ThreadId) -> BoxFuture<'a, TransportResult<Thread>> {
        Box::pin(async move {
            let url = self.url(&format!("/threads/{thread_id}"));
            let builder = self.request(reqwest::Method::GET, &url);
            self.fetch_json("get-thread", url, builder).await
        })
    }

    fn list_threads<'a>(&'a self, goal_id: GoalId) -> BoxFuture<'a, TransportResult<Vec<Thread>>> {
        Box::pin(async move {
            let url = self.url(&format!("/threads/goal/{goal_id}"));
            let builder = self.request(reqwest::Method::GET, &url);
            self.fetch_json("list-threads", url, builder).await
        })
    }

    fn list_all_threads<'a>(
        &'a self,
        goal_id: GoalId,
    ) -> BoxFuture<'a, TransportResult<Vec<Thread>>> {
        Box::pin(async move {
            let url = self.url(&format!("/threads/goal/{goal_id}"));
            let builder = self
                .request(reqwest::Method::GET, &url)
                .query(&[("include_archived", "true")]);
            self.fetch_json("list-all-threads", url, builder).await
        })
    }

    fn archive_thread<'a>(&'a self, thread_id: ThreadId) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            let url = self.url(&format!("/threads/{thread_id}"));
            let builder = self.request(reqwest::Method::DELETE, &url);
            let _: serde_json::Value = self.fetch_json("archive-thread", url, builder).await?;
            Ok(())
        })
    }

    fn restore_thread<'a>(&'a self, thread_id: ThreadId) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            let url = self.url(&format!("/threads/{thread_id}/restore"));
            let builder = self.request(reqwest::Method::POST, &url);
            let _: serde_json::Value = self.fetch_json("restore-thread", url, builder).await?;
            Ok(())
        })
    }

    fn send_message<'a>(
        &'a self,
        thread_id: ThreadId,
        content: &'a str,
    ) -> BoxFuture<'a, TransportResult<SendMessageResponse>> {
        Box::pin(async move {
            // The backend only answers with a stream, so the whole turn is drained here
            // and the confirmed pair is read back from the thread.
            let handle = self.stream_message(thread_id, content).await?;
            let (_, outcome) = tokio::join!(handle.worker, Self::collect_turn(handle.stream));
            let (user_message_id, coach_message_id, sessions_modified) = outcome?;

            let thread = self.get_thread(thread_id).await?;
            let find = |message_id: MessageId| {
                thread
                    .messages
                    .iter()
                    .find(|message| message.id == message_id)
                    .cloned()
                    .ok_or_else(|| TransportError::MissingMessage {
                        stage: "send-message-readback",
                        thread_id: thread_id.get(),
                        message_id: message_id.get(),
                    })
            };

            Ok(SendMessageResponse {
                user_message: find(user_message_id)?,
                coach_response: find(coach_message_id)?,
                sessions_modified,
            })
        })
    }

    fn stream_message<'a>(
        &'a self,
        thread_id: ThreadId,
        content: &'a str,
    ) -> BoxFuture<'a, TransportResult<TransportStreamHandle>> {
        Box::pin(async move {
            let response = self.open_stream(thread_id, content).await?;
            let (event_tx, stream) = make_event_stream(thread_id);
            let worker: TransportWorker =
                Box::pin(Self::run_stream_worker(thread_id, response, event_tx));

            Ok(TransportStreamHandle { stream, worker })
        })
    }
}

impl ActivityClassifier for HttpTransport {
    fn classify_activity<'a>(
        &'a self,
        activity_id: ActivityId,
        classification: ActivityClassification,
    ) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            let url = self.url(&format!("/activities/{activity_id}/classification"));
            let builder = self
                .request(reqwest::Method::PATCH, &url)
                .json(&classification);
            let _: serde_json::Value = self.fetch_json("classify-activity", url, builder).await?;
            Ok(())
        })
    }
}

/// Forwards one decoded line; returns false once the stream must stop.
fn forward_stream_event(
    thread_id: ThreadId,
    event_tx: &mpsc::UnboundedSender<StreamEvent>,
    decoded: TransportResult<StreamEvent>,
) -> bool {
    match decoded {
        Ok(event) => {
            let terminal = event.is_terminal();
            event_tx.send(event).is_ok() && !terminal
        }
        Err(error) => {
            tracing::warn!(
                thread_id = %thread_id,
                error = %error,
                "dropping message stream after undecodable line"
            );
            let _ = event_tx.send(StreamEvent::error(error.to_string()));
            false
        }
    }
}

async fn ensure_success(
    stage: &'static str,
    url: &str,
    response: reqwest::Response,
) -> TransportResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    StatusSnafu {
        stage,
        url,
        status: status.as_u16(),
        body,
    }
    .fail()
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BACKEND_URL.to_string()
    } else {
        trimmed.to_string()
    }
}
