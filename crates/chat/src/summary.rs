use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use murmur_llm::{
    BoxFuture, LlmProvider, ProviderError, ProviderMessage, ProviderStreamHandle, RequestId,
    StreamEventPayload, StreamRequest,
};
use snafu::{ResultExt, Snafu};

use crate::events::ChatEvent;
use crate::ids::SessionId;
use crate::manager::{ChatManager, ChatState};
use crate::message::Message;

pub const TOPIC_PROMPT: &str = "Please generate a four to five word title summarizing our \
conversation without any lead-in, punctuation, quotation marks, periods, symbols, bold text, \
or additional text. Remove enclosing quotation marks.";
pub const MEMORY_PROMPT: &str = "Summarize the discussion briefly in 200 words or less to use \
as a prompt for future context.";

/// Summarizer requests use their own id range so they never collide with chat requests.
const SUMMARY_REQUEST_ID_BASE: u64 = 1 << 48;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SummaryError {
    #[snafu(display("summary request failed on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("summary stream failed on `{stage}`: {reason}"))]
    Stream {
        stage: &'static str,
        reason: String,
    },
    #[snafu(display("summary came back empty on `{stage}`"))]
    EmptySummary { stage: &'static str },
}

pub type SummaryResult<T> = Result<T, SummaryError>;

/// Session state a memory request was issued against.
#[derive(Debug, Clone, Copy)]
struct MemoryRequest {
    /// `messages.len()` when the request went out.
    summarized_to: usize,
    fold_epoch: u64,
}

/// Produces session titles and memory summaries. Failures are logged and ignored by the
/// manager.
pub trait Summarizer: Send + Sync {
    fn topic(&self, messages: Vec<Message>) -> BoxFuture<'_, SummaryResult<String>>;
    fn memory(
        &self,
        previous: String,
        messages: Vec<Message>,
    ) -> BoxFuture<'_, SummaryResult<String>>;
}

/// Summarizer that asks the chat provider itself.
pub struct ProviderSummarizer {
    provider: Arc<dyn LlmProvider>,
    model: String,
    next_request_id: AtomicU64,
}

impl ProviderSummarizer {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            next_request_id: AtomicU64::new(SUMMARY_REQUEST_ID_BASE),
        }
    }

    fn request(&self, messages: Vec<ProviderMessage>) -> StreamRequest {
        let request_id = RequestId::new(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        StreamRequest::new(request_id, self.model.clone(), messages)
    }

    async fn collect(
        &self,
        request: StreamRequest,
        stage: &'static str,
    ) -> SummaryResult<String> {
        let ProviderStreamHandle { mut stream, worker } = self
            .provider
            .stream_chat(request)
            .context(ProviderSnafu { stage })?;
        tokio::spawn(worker);

        let mut text = String::new();
        while let Some(event) = stream.recv().await {
            match event.payload {
                StreamEventPayload::Delta(delta) => text.push_str(&delta),
                StreamEventPayload::ReasoningDelta(_) => {}
                StreamEventPayload::Done => return Ok(text),
                StreamEventPayload::Error(reason) => return StreamSnafu { stage, reason }.fail(),
            }
        }
        StreamSnafu {
            stage,
            reason: crate::streaming::STREAM_ENDED_EARLY,
        }
        .fail()
    }
}

fn to_provider_messages(messages: &[Message]) -> Vec<ProviderMessage> {
    messages
        .iter()
        .map(|message| ProviderMessage::new(message.role.to_provider(), message.content.clone()))
        .collect()
}

impl Summarizer for ProviderSummarizer {
    fn topic(&self, messages: Vec<Message>) -> BoxFuture<'_, SummaryResult<String>> {
        Box::pin(async move {
            let mut turns = to_provider_messages(&messages);
            turns.push(ProviderMessage::new(murmur_llm::Role::User, TOPIC_PROMPT));
            let raw = self.collect(self.request(turns), "summarize-topic").await?;
            let topic = trim_topic(&raw);
            if topic.is_empty() {
                return EmptySummarySnafu {
                    stage: "summarize-topic",
                }
                .fail();
            }
            Ok(topic)
        })
    }

    fn memory(
        &self,
        previous: String,
        messages: Vec<Message>,
    ) -> BoxFuture<'_, SummaryResult<String>> {
        Box::pin(async move {
            let mut turns = Vec::with_capacity(messages.len() + 2);
            if !previous.trim().is_empty() {
                turns.push(ProviderMessage::new(
                    murmur_llm::Role::System,
                    format!("{}{previous}", crate::session::MEMORY_PROMPT_PREFIX),
                ));
            }
            turns.extend(to_provider_messages(&messages));
            turns.push(ProviderMessage::new(murmur_llm::Role::User, MEMORY_PROMPT));

            let summary = self.collect(self.request(turns), "summarize-memory").await?;
            let summary = summary.trim().to_string();
            if summary.is_empty() {
                return EmptySummarySnafu {
                    stage: "summarize-memory",
                }
                .fail();
            }
            Ok(summary)
        })
    }
}

/// Strips wrapping quotes and trailing punctuation from a generated title.
pub fn trim_topic(raw: &str) -> String {
    raw.trim()
        .trim_matches(|ch: char| matches!(ch, '"' | '\'' | '“' | '”' | '*'))
        .trim_end_matches(|ch: char| {
            matches!(ch, '.' | ',' | '!' | '?' | ';' | ':' | '。' | '，' | '！' | '？')
        })
        .trim()
        .to_string()
}

impl ChatManager {
    /// Called after a completed reply: refreshes the topic and the memory summary when due.
    pub(crate) fn schedule_summaries(&self, state: &mut ChatState, session_id: SessionId) {
        let Some(summarizer) = self.inner.summarizer.clone() else {
            return;
        };
        let Some(session) = state.session_mut(session_id) else {
            return;
        };

        let settled = |message: &&Message| message.is_final() && !message.content.is_empty();

        if session.has_default_topic() && session.has_full_exchange() {
            let messages = session
                .messages
                .iter()
                .filter(settled)
                .cloned()
                .collect::<Vec<_>>();
            let manager = self.clone();
            let summarizer = summarizer.clone();
            tokio::spawn(async move {
                match summarizer.topic(messages).await {
                    Ok(topic) => manager.apply_generated_topic(session_id, topic),
                    Err(error) => {
                        tracing::warn!(%session_id, %error, "topic generation failed");
                    }
                }
            });
        }

        let config = &session.mask.model_config;
        if !config.send_memory {
            return;
        }
        let pending = session
            .unsummarized_messages()
            .iter()
            .filter(settled)
            .cloned()
            .collect::<Vec<_>>();
        let counter = self.inner.token_counter.clone();
        let tokens = pending
            .iter()
            .map(|message| counter.count_tokens(&message.content))
            .sum::<usize>();
        if tokens < config.compress_message_length_threshold {
            return;
        }

        let request = MemoryRequest {
            summarized_to: session.messages.len(),
            fold_epoch: session.fold_epoch(),
        };
        let previous = session.memory_prompt.clone();
        tracing::debug!(%session_id, tokens, "summarizing session memory");
        let manager = self.clone();
        tokio::spawn(async move {
            match summarizer.memory(previous, pending).await {
                Ok(memory) => manager.apply_memory(session_id, request, memory),
                Err(error) => {
                    tracing::warn!(%session_id, %error, "memory summarization failed");
                }
            }
        });
    }

    fn apply_generated_topic(&self, session_id: SessionId, topic: String) {
        let mut state = self.lock_state();
        let Some(session) = state.session_mut(session_id) else {
            return;
        };
        // A manual rename while the summary was running wins.
        if !session.has_default_topic() {
            return;
        }
        session.topic = topic.clone();
        session.touch();
        self.emit(ChatEvent::TopicChanged { session_id, topic });
    }

    fn apply_memory(&self, session_id: SessionId, request: MemoryRequest, memory: String) {
        let mut state = self.lock_state();
        let Some(session) = state.session_mut(session_id) else {
            return;
        };
        if session.fold_epoch() != request.fold_epoch {
            tracing::debug!(%session_id, "fold moved during summarization, dropping summary");
            return;
        }
        if request.summarized_to <= session.last_summarize_index {
            tracing::debug!(%session_id, "a newer summary already landed");
            return;
        }
        session.memory_prompt = memory;
        session.last_summarize_index = request.summarized_to.min(session.messages.len());
        session.touch();
        self.emit(ChatEvent::MemoryUpdated { session_id });
    }
}
