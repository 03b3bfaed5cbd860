use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status} for {url}: {body}"))]
    Status {
        stage: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to read response body from {url} on `{stage}`: {source}"))]
    ReadBody {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("failed to decode payload on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("malformed stream line `{line}`: {source}"))]
    MalformedStreamLine {
        stage: &'static str,
        line: String,
        source: serde_json::Error,
    },
    #[snafu(display("remote id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: std::num::ParseIntError,
    },
    #[snafu(display("coach reported an error: {message}"))]
    Remote {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("message {message_id} is missing from thread {thread_id}"))]
    MissingMessage {
        stage: &'static str,
        thread_id: i64,
        message_id: i64,
    },
}

pub type TransportResult<T> = Result<T, TransportError>;
