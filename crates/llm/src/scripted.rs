use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use snafu::ensure;
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    EmptyMessageSetSnafu, LlmProvider, ProviderResult, ProviderStreamHandle, ProviderWorker,
    RequestId, StreamEvent, StreamEventPayload, StreamRequest, make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";
pub const SCRIPTED_MODEL: &str = "scripted-echo";

/// One step of a scripted response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Delta(String),
    Pause(Duration),
    Done,
    Fail(String),
    /// Wait until the request is cancelled; never emits a terminal event.
    Hang,
    /// Drop the event channel without a terminal event.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Script {
    steps: Vec<ScriptStep>,
}

impl Script {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps }
    }

    /// Deltas followed by a normal completion.
    pub fn reply<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut steps = chunks
            .into_iter()
            .map(|chunk| ScriptStep::Delta(chunk.into()))
            .collect::<Vec<_>>();
        steps.push(ScriptStep::Done);
        Self { steps }
    }

    /// Deltas followed by a transport error.
    pub fn fail_after<I, S>(chunks: I, reason: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut steps = chunks
            .into_iter()
            .map(|chunk| ScriptStep::Delta(chunk.into()))
            .collect::<Vec<_>>();
        steps.push(ScriptStep::Fail(reason.into()));
        Self { steps }
    }

    /// Deltas followed by an open-ended wait for cancellation.
    pub fn hang_after<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut steps = chunks
            .into_iter()
            .map(|chunk| ScriptStep::Delta(chunk.into()))
            .collect::<Vec<_>>();
        steps.push(ScriptStep::Hang);
        Self { steps }
    }

    /// Inserts a pause before every delta.
    pub fn paced(self, delay: Duration) -> Self {
        let steps = self
            .steps
            .into_iter()
            .flat_map(|step| match step {
                ScriptStep::Delta(_) => vec![ScriptStep::Pause(delay), step],
                other => vec![other],
            })
            .collect();
        Self { steps }
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }
}

/// Deterministic in-process provider.
///
/// Queued scripts are consumed one per request in FIFO order. With an empty queue the
/// provider echoes the last user turn word by word, which keeps offline sessions usable.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
    echo_delay: Duration,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            echo_delay: Duration::ZERO,
        }
    }

    /// Echo provider with a per-word delay, for interactive offline use.
    pub fn echo(echo_delay: Duration) -> Self {
        Self {
            echo_delay,
            ..Self::new()
        }
    }

    pub fn with_scripts(scripts: impl IntoIterator<Item = Script>) -> Self {
        let provider = Self::new();
        for script in scripts {
            provider.push_script(script);
        }
        provider
    }

    pub fn push_script(&self, script: Script) {
        lock_unpoisoned(&self.scripts).push_back(script);
    }

    /// Requests received so far, in dispatch order.
    pub fn requests(&self) -> Vec<StreamRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    fn next_script(&self, request: &StreamRequest) -> Script {
        if let Some(script) = lock_unpoisoned(&self.scripts).pop_front() {
            return script;
        }

        let prompt = request.last_user_content().unwrap_or_default();
        let words = prompt
            .split_inclusive(' ')
            .map(str::to_string)
            .collect::<Vec<_>>();
        let script = Script::reply(words);
        if self.echo_delay.is_zero() {
            script
        } else {
            script.paced(self.echo_delay)
        }
    }

    async fn run_script(
        script: Script,
        request_id: RequestId,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for step in script.steps {
            // Closed and signalled both count as cancelled.
            if !matches!(cancel_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                tracing::debug!(%request_id, "scripted stream cancelled");
                return;
            }

            let payload = match step {
                ScriptStep::Delta(text) => StreamEventPayload::Delta(text),
                ScriptStep::Done => StreamEventPayload::Done,
                ScriptStep::Fail(reason) => StreamEventPayload::Error(reason),
                ScriptStep::Pause(delay) => {
                    let cancelled = tokio::select! {
                        _ = &mut cancel_rx => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        return;
                    }
                    continue;
                }
                ScriptStep::Hang => {
                    let _ = (&mut cancel_rx).await;
                    return;
                }
                ScriptStep::Close => return,
            };

            let terminal = payload.is_terminal();
            if event_tx.send(StreamEvent::new(request_id, payload)).is_err() || terminal {
                return;
            }
        }
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        SCRIPTED_MODEL
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "scripted-stream-chat",
                request_id: request.request_id,
            }
        );

        let script = self.next_script(&request);
        let request_id = request.request_id;
        lock_unpoisoned(&self.requests).push(request);

        let (event_tx, stream, cancel_rx) = make_event_stream(request_id);
        let worker: ProviderWorker =
            Box::pin(Self::run_script(script, request_id, event_tx, cancel_rx));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, ProviderMessage, Role};

    fn request(id: u64, prompt: &str) -> StreamRequest {
        StreamRequest::new(
            RequestId::new(id),
            SCRIPTED_MODEL,
            vec![ProviderMessage::new(Role::User, prompt)],
        )
    }

    async fn collect(handle: ProviderStreamHandle) -> Vec<StreamEventPayload> {
        let ProviderStreamHandle { mut stream, worker } = handle;
        tokio::spawn(worker);
        let mut payloads = Vec::new();
        while let Some(event) = stream.recv().await {
            payloads.push(event.payload);
        }
        payloads
    }

    #[tokio::test]
    async fn queued_script_is_replayed_in_order() {
        let provider = ScriptedProvider::with_scripts([Script::reply(["He", "llo"])]);
        let handle = provider
            .stream_chat(request(1, "hi"))
            .expect("request has messages");

        assert_eq!(
            collect(handle).await,
            vec![
                StreamEventPayload::Delta("He".to_string()),
                StreamEventPayload::Delta("llo".to_string()),
                StreamEventPayload::Done,
            ]
        );
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn empty_queue_echoes_last_user_turn() {
        let provider = ScriptedProvider::new();
        let handle = provider
            .stream_chat(request(2, "ping pong"))
            .expect("request has messages");

        assert_eq!(
            collect(handle).await,
            vec![
                StreamEventPayload::Delta("ping ".to_string()),
                StreamEventPayload::Delta("pong".to_string()),
                StreamEventPayload::Done,
            ]
        );
    }

    #[tokio::test]
    async fn hanging_script_stops_on_cancel_without_terminal_event() {
        let provider = ScriptedProvider::with_scripts([Script::hang_after(["partial"])]);
        let ProviderStreamHandle { mut stream, worker } = provider
            .stream_chat(request(3, "hi"))
            .expect("request has messages");
        let worker = tokio::spawn(worker);

        let first = stream.recv().await.expect("first delta arrives");
        assert_eq!(first.payload, StreamEventPayload::Delta("partial".to_string()));

        let cancel = stream
            .take_cancel_handle()
            .expect("stream still owns the cancel handle");
        assert!(cancel.cancel());
        worker.await.expect("worker exits after cancel");

        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn failing_script_ends_with_error() {
        let provider = ScriptedProvider::with_scripts([Script::fail_after(["a"], "network down")]);
        let handle = provider
            .stream_chat(request(4, "hi"))
            .expect("request has messages");

        assert_eq!(
            collect(handle).await,
            vec![
                StreamEventPayload::Delta("a".to_string()),
                StreamEventPayload::Error("network down".to_string()),
            ]
        );
    }

    #[test]
    fn empty_message_set_is_rejected() {
        let provider = ScriptedProvider::new();
        let result = provider.stream_chat(StreamRequest::new(
            RequestId::new(5),
            SCRIPTED_MODEL,
            Vec::new(),
        ));
        assert!(matches!(result, Err(ProviderError::EmptyMessageSet { .. })));
    }

    #[test]
    fn paced_scripts_interleave_pauses_before_deltas() {
        let script = Script::reply(["a", "b"]).paced(Duration::from_millis(5));
        assert_eq!(
            script.steps(),
            &[
                ScriptStep::Pause(Duration::from_millis(5)),
                ScriptStep::Delta("a".to_string()),
                ScriptStep::Pause(Duration::from_millis(5)),
                ScriptStep::Delta("b".to_string()),
                ScriptStep::Done,
            ]
        );
    }
}
