use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, LlmProvider,
    MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamEvent, StreamEventPayload,
    StreamRequest, make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// OpenAI-compatible streaming transport backed by rig.
pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    /// Rig has a single preamble slot, so pinned system turns and the memory summary are
    /// folded into it ahead of the explicit request preamble.
    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        let parts = request
            .preamble
            .iter()
            .chain(
                request
                    .messages
                    .iter()
                    .filter(|message| message.role == Role::System)
                    .map(|message| &message.content),
            )
            .filter(|part| !part.trim().is_empty())
            .cloned()
            .collect::<Vec<_>>();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let mut history = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = history.pop() else {
            tracing::warn!(
                request_id = %request.request_id,
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant turns remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                request_id: request.request_id,
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(history);
        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEventPayload>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => Some(StreamEventPayload::Delta(text.text)),
            StreamedAssistantContent::Reasoning(reasoning) => {
                let text = reasoning.reasoning.join("");
                (!text.is_empty()).then_some(StreamEventPayload::ReasoningDelta(text))
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
                (!reasoning.is_empty()).then_some(StreamEventPayload::ReasoningDelta(reasoning))
            }
            StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let request_id = request.request_id;
        let send = |payload: StreamEventPayload| {
            event_tx.send(StreamEvent::new(request_id, payload)).is_ok()
        };

        let mut stream = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(%request_id, "request cancelled before the stream opened");
                return;
            }
            opened = Self::open_stream(&config, &request) => match opened {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::error!(
                        %request_id,
                        provider_id = %config.provider_id,
                        model_id = %request.model_id,
                        error = %error,
                        "failed to open provider stream"
                    );
                    send(StreamEventPayload::Error(error.to_string()));
                    return;
                }
            },
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Stop upstream IO promptly; no terminal event follows a cancel.
                    tracing::debug!(%request_id, "provider stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => match next_item {
                    Some(Ok(item)) => {
                        if let Some(payload) = Self::map_stream_item(item)
                            && !send(payload)
                        {
                            return;
                        }
                    }
                    Some(Err(source)) => {
                        tracing::warn!(
                            %request_id,
                            error = %source,
                            "provider stream emitted an error chunk"
                        );
                        let error = ProviderError::CompletionsFailed {
                            stage: "stream-chunk",
                            source,
                        };
                        send(StreamEventPayload::Error(error.to_string()));
                        return;
                    }
                    None => break,
                },
            }
        }

        send(StreamEventPayload::Done);
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn default_model(&self) -> &str {
        DEFAULT_OPENAI_MODEL
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                request_id: request.request_id,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.request_id);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RequestId;

    fn request(messages: Vec<ProviderMessage>) -> StreamRequest {
        StreamRequest::new(RequestId::new(9), DEFAULT_OPENAI_MODEL, messages)
    }

    #[test]
    fn adapter_requires_api_key() {
        let result = RigProviderAdapter::new(ProviderConfig::new("openai", "  ", ""));
        assert!(matches!(result, Err(ProviderError::MissingApiKey { .. })));
    }

    #[test]
    fn system_turns_fold_into_preamble() {
        let request = request(vec![
            ProviderMessage::new(Role::System, "pinned persona"),
            ProviderMessage::new(Role::System, "   "),
            ProviderMessage::new(Role::System, "summary of earlier turns"),
            ProviderMessage::new(Role::User, "hi"),
        ])
        .with_preamble("base rules");

        assert_eq!(
            RigProviderAdapter::merged_preamble(&request).as_deref(),
            Some("base rules\n\npinned persona\n\nsummary of earlier turns")
        );
    }

    #[test]
    fn preamble_is_absent_without_system_content() {
        let request = request(vec![ProviderMessage::new(Role::User, "hi")]);
        assert_eq!(RigProviderAdapter::merged_preamble(&request), None);
    }

    #[test]
    fn empty_requests_are_rejected_before_spawning() {
        let adapter = RigProviderAdapter::new(ProviderConfig::new("openai", "sk-test", ""))
            .expect("api key is present");
        let result = adapter.stream_chat(request(Vec::new()));
        assert!(matches!(result, Err(ProviderError::EmptyMessageSet { .. })));
    }
}
