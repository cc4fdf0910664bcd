use std::fmt;
use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

/// Routing key for one generation request.
///
/// Callers allocate a fresh id per request so events from an abandoned stream can never be
/// mistaken for events of a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "req-{}", self.0)
    }
}

/// Transport-level speaker role, decoupled from the chat domain enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub request_id: RequestId,
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl StreamRequest {
    pub fn new(
        request_id: RequestId,
        model_id: impl Into<String>,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            request_id,
            model_id: model_id.into(),
            messages,
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Content of the last user turn, if any.
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }
}

/// Provider stream payload. A well-behaved provider emits any number of deltas followed by
/// exactly one of `Done` / `Error`, unless it was cancelled first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    ReasoningDelta(String),
    Done,
    Error(String),
}

impl StreamEventPayload {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub request_id: RequestId,
    pub payload: StreamEventPayload,
}

impl StreamEvent {
    pub fn new(request_id: RequestId, payload: StreamEventPayload) -> Self {
        Self {
            request_id,
            payload,
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request {request_id} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        request_id: RequestId,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

/// One-shot cancellation signal for a single in-flight request.
///
/// Dropping the handle without calling [`CancelHandle::cancel`] also stops the worker, since
/// workers treat a closed channel the same as an explicit signal.
#[derive(Debug)]
pub struct CancelHandle {
    request_id: RequestId,
    cancel_tx: oneshot::Sender<()>,
}

impl CancelHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Signals the worker. Returns false when the worker already finished.
    pub fn cancel(self) -> bool {
        self.cancel_tx.send(()).is_ok()
    }
}

pub struct ProviderEventStream {
    request_id: RequestId,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: Option<CancelHandle>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        request_id: RequestId,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            request_id,
            events,
            cancel: Some(CancelHandle {
                request_id,
                cancel_tx,
            }),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    /// Detaches the cancel handle so it can be owned elsewhere (e.g. a request registry).
    ///
    /// Once detached, dropping the stream no longer cancels the worker.
    pub fn take_cancel_handle(&mut self) -> Option<CancelHandle> {
        self.cancel.take()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel
            .take()
            .map(CancelHandle::cancel)
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.cancel();
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

pub fn make_event_stream(
    request_id: RequestId,
) -> (
    mpsc::UnboundedSender<StreamEvent>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(request_id, event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_stream_signals_cancellation() {
        let (_event_tx, stream, mut cancel_rx) = make_event_stream(RequestId::new(1));
        drop(stream);
        assert!(cancel_rx.try_recv().is_ok());
    }

    #[test]
    fn detached_cancel_handle_outlives_stream() {
        let (_event_tx, mut stream, mut cancel_rx) = make_event_stream(RequestId::new(2));
        let handle = stream
            .take_cancel_handle()
            .expect("fresh stream owns its cancel handle");
        drop(stream);

        assert!(cancel_rx.try_recv().is_err());
        assert_eq!(handle.request_id(), RequestId::new(2));
        assert!(handle.cancel());
        assert!(cancel_rx.try_recv().is_ok());
    }

    #[test]
    fn cancel_after_worker_exit_reports_false() {
        let (_event_tx, mut stream, cancel_rx) = make_event_stream(RequestId::new(3));
        drop(cancel_rx);
        assert!(!stream.cancel());
        // Second call finds no handle left.
        assert!(!stream.cancel());
    }

    #[test]
    fn last_user_content_skips_trailing_assistant_turns() {
        let request = StreamRequest::new(
            RequestId::new(4),
            "model",
            vec![
                ProviderMessage::new(Role::System, "be brief"),
                ProviderMessage::new(Role::User, "first"),
                ProviderMessage::new(Role::Assistant, "reply"),
                ProviderMessage::new(Role::User, "second"),
                ProviderMessage::new(Role::Assistant, "partial"),
            ],
        );

        assert_eq!(request.last_user_content(), Some("second"));
    }

    #[test]
    fn terminal_payloads_are_done_and_error() {
        assert!(StreamEventPayload::Done.is_terminal());
        assert!(StreamEventPayload::Error("boom".to_string()).is_terminal());
        assert!(!StreamEventPayload::Delta("x".to_string()).is_terminal());
        assert!(!StreamEventPayload::ReasoningDelta("x".to_string()).is_terminal());
    }
}
