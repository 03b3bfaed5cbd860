//! Transport seam between the coaching session engine and the coaching backend.
pub mod error;
pub mod http;
pub mod ids;
pub mod stream;
pub mod transport;
pub mod types;

use std::sync::Arc;

pub use error::{TransportError, TransportResult};
pub use http::HttpTransport;
pub use ids::{ActivityId, GoalId, MessageId, ThreadId};
pub use stream::{
    CoachEventStream, StreamEvent, StreamLineDecoder, TransportStreamHandle, TransportWorker,
    make_event_stream,
};
pub use transport::{
    ActivityClassifier, BoxFuture, CoachTransport, DEFAULT_BACKEND_URL, TransportConfig,
};
pub use types::{
    ActivityClass, ActivityClassification, Role, SendMessageResponse, ServerMessage, SessionRef,
    Thread, ThreadInit,
};

/// Builds the HTTP adapter behind both transport seams.
pub fn create_transport(config: TransportConfig) -> TransportResult<Arc<HttpTransport>> {
    Ok(Arc::new(HttpTransport::new(config)?))
}
