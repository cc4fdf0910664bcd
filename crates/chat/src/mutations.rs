use std::time::Duration;

use murmur_llm::{
    ProviderEventStream, ProviderMessage, RequestId, StreamEventPayload, StreamRequest,
};
use tokio::task::JoinHandle;

use crate::commands::{ChatCommand, match_command};
use crate::events::ChatEvent;
use crate::ids::{MessageId, SessionId};
use crate::manager::{ChatManager, ChatState};
use crate::message::{Message, Role};
use crate::session::{Mask, MessageSlot};
use crate::streaming::{EMPTY_RESPONSE, STREAM_ENDED_EARLY, StreamOutcome};

/// A dispatched request. Await [`SendHandle::settled`] to observe its terminal state.
#[derive(Debug)]
pub struct SendHandle {
    pub session_id: SessionId,
    pub user_message_id: MessageId,
    pub assistant_message_id: MessageId,
    task: JoinHandle<StreamOutcome>,
}

impl SendHandle {
    pub async fn settled(self) -> StreamOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    message_id = %self.assistant_message_id,
                    %error,
                    "stream pump did not finish"
                );
                StreamOutcome::Dropped
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Result of routing one input line.
#[derive(Debug)]
pub enum Submission {
    /// Blank input; nothing happened.
    Ignored,
    Command(ChatCommand),
    Sent(SendHandle),
}

/// Work prepared under the lock and started after it is released.
enum Dispatch {
    Stream {
        request_id: RequestId,
        stream: ProviderEventStream,
        worker: murmur_llm::ProviderWorker,
    },
    Rejected(StreamOutcome),
}

struct Prepared {
    session_id: SessionId,
    user_message_id: MessageId,
    assistant_message_id: MessageId,
    dispatch: Dispatch,
}

impl ChatManager {
    /// Appends a user turn and a pending assistant reply, then streams into the reply.
    /// Blank text is ignored.
    pub fn send(&self, session_id: SessionId, text: &str) -> Option<SendHandle> {
        if text.trim().is_empty() {
            tracing::debug!(%session_id, "ignoring blank submission");
            return None;
        }

        let prepared = {
            let mut state = self.lock_state();
            self.prepare_send(&mut state, session_id, text.to_string())?
        };
        Some(self.launch(prepared))
    }

    fn prepare_send(
        &self,
        state: &mut ChatState,
        session_id: SessionId,
        text: String,
    ) -> Option<Prepared> {
        let Some(session) = state.session_mut(session_id) else {
            tracing::warn!(%session_id, "send targeted an unknown session");
            return None;
        };

        let config = session.mask.model_config.clone();
        let user = Message::user(text);
        let assistant = Message::assistant("")
            .with_streaming(true)
            .with_model(config.model.clone());
        let user_message_id = user.id;
        let assistant_message_id = assistant.id;

        // The history window never trims the turn being sent.
        let messages = session
            .effective_context()
            .into_iter()
            .chain(std::iter::once(user.clone()))
            .map(|message| ProviderMessage::new(message.role.to_provider(), message.content))
            .collect::<Vec<_>>();
        session.push_message(user);
        session.push_message(assistant);

        self.emit(ChatEvent::MessageAppended {
            session_id,
            message_id: user_message_id,
        });
        self.emit(ChatEvent::MessageAppended {
            session_id,
            message_id: assistant_message_id,
        });

        let request_id = self.next_request_id();
        let mut request = StreamRequest::new(request_id, config.model, messages)
            .with_temperature(config.temperature);
        if let Some(max_tokens) = config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let dispatch = match self.inner.provider.stream_chat(request) {
            Ok(handle) => {
                let mut stream = handle.stream;
                if let Some(cancel) = stream.take_cancel_handle() {
                    state
                        .registry
                        .add(session_id, assistant_message_id, cancel);
                }
                tracing::debug!(
                    %session_id,
                    message_id = %assistant_message_id,
                    %request_id,
                    "dispatched request"
                );
                Dispatch::Stream {
                    request_id,
                    stream,
                    worker: handle.worker,
                }
            }
            Err(error) => {
                tracing::warn!(%session_id, %request_id, %error, "provider rejected request");
                let reason = error.to_string();
                if let Some(session) = state.session_mut(session_id)
                    && let Some(message) = session.live_message_mut(assistant_message_id)
                    && message.fail(&reason).is_ok()
                {
                    session.touch();
                }
                let outcome = StreamOutcome::Failed(reason);
                self.emit(ChatEvent::Settled {
                    session_id,
                    message_id: assistant_message_id,
                    outcome: outcome.clone(),
                });
                Dispatch::Rejected(outcome)
            }
        };

        Some(Prepared {
            session_id,
            user_message_id,
            assistant_message_id,
            dispatch,
        })
    }

    fn launch(&self, prepared: Prepared) -> SendHandle {
        let Prepared {
            session_id,
            user_message_id,
            assistant_message_id,
            dispatch,
        } = prepared;

        let task = match dispatch {
            Dispatch::Stream {
                request_id,
                stream,
                worker,
            } => {
                tokio::spawn(worker);
                let timeout = Duration::from_millis(self.settings().request_timeout_ms);
                let manager = self.clone();
                tokio::spawn(async move {
                    manager
                        .pump(session_id, assistant_message_id, request_id, stream, timeout)
                        .await
                })
            }
            Dispatch::Rejected(outcome) => tokio::spawn(async move { outcome }),
        };

        SendHandle {
            session_id,
            user_message_id,
            assistant_message_id,
            task,
        }
    }

    async fn pump(
        self,
        session_id: SessionId,
        message_id: MessageId,
        request_id: RequestId,
        mut stream: ProviderEventStream,
        timeout: Duration,
    ) -> StreamOutcome {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut timer_armed = true;

        loop {
            tokio::select! {
                event = stream.recv() => {
                    let payload = event.map(|event| event.payload);
                    let settled =
                        self.apply_stream_payload(session_id, message_id, request_id, payload);
                    if let Some(outcome) = settled {
                        return outcome;
                    }
                }
                _ = &mut deadline, if timer_armed => {
                    timer_armed = false;
                    let expired = self.expire_if_empty(session_id, message_id, request_id);
                    if let Some(outcome) = expired {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Applies one transport event. `None` payload means the channel closed.
    /// Returns the outcome once the request is settled.
    fn apply_stream_payload(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        request_id: RequestId,
        payload: Option<StreamEventPayload>,
    ) -> Option<StreamOutcome> {
        let mut state = self.lock_state();
        if !state.registry.owns(session_id, message_id, request_id) {
            return Some(detached_outcome(&mut state, session_id, message_id));
        }

        let outcome = match payload {
            Some(StreamEventPayload::Delta(delta)) => {
                let session = state.session_mut(session_id)?;
                let applied = session
                    .live_message_mut(message_id)
                    .map(|message| message.apply_delta(&delta));
                match applied {
                    Some(Ok(())) => {
                        session.touch();
                        self.emit(ChatEvent::Delta {
                            session_id,
                            message_id,
                            delta,
                        });
                        return None;
                    }
                    Some(Err(rejection)) => {
                        tracing::warn!(%session_id, %rejection, "dropping delta");
                        StreamOutcome::Dropped
                    }
                    None => StreamOutcome::Dropped,
                }
            }
            Some(StreamEventPayload::ReasoningDelta(_)) => return None,
            Some(StreamEventPayload::Done) => {
                self.settle(&mut state, session_id, message_id, |message| {
                    message.complete()
                });
                StreamOutcome::Completed
            }
            Some(StreamEventPayload::Error(reason)) => {
                self.settle(&mut state, session_id, message_id, |message| {
                    message.fail(&reason)
                });
                StreamOutcome::Failed(reason)
            }
            None => {
                self.settle(&mut state, session_id, message_id, |message| {
                    message.fail(STREAM_ENDED_EARLY)
                });
                StreamOutcome::Failed(STREAM_ENDED_EARLY.to_string())
            }
        };

        state.registry.remove(session_id, message_id);
        self.emit(ChatEvent::Settled {
            session_id,
            message_id,
            outcome: outcome.clone(),
        });
        tracing::debug!(%session_id, %message_id, %request_id, ?outcome, "request settled");
        if outcome == StreamOutcome::Completed {
            self.schedule_summaries(&mut state, session_id);
        }
        Some(outcome)
    }

    fn settle(
        &self,
        state: &mut ChatState,
        session_id: SessionId,
        message_id: MessageId,
        transition: impl FnOnce(&mut Message) -> crate::streaming::TransitionResult,
    ) {
        let Some(session) = state.session_mut(session_id) else {
            return;
        };
        match session.live_message_mut(message_id).map(transition) {
            Some(Ok(())) => session.touch(),
            Some(Err(rejection)) => {
                tracing::warn!(%session_id, %rejection, "terminal event for a settled message");
            }
            None => {}
        }
    }

    /// Active timeout: a reply that is still empty fails and its transport is cancelled.
    fn expire_if_empty(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        request_id: RequestId,
    ) -> Option<StreamOutcome> {
        let mut state = self.lock_state();
        if !state.registry.owns(session_id, message_id, request_id) {
            return Some(detached_outcome(&mut state, session_id, message_id));
        }

        let still_empty = state
            .session(session_id)
            .and_then(|session| session.message(message_id))
            .is_some_and(|message| message.streaming && message.content.is_empty());
        if !still_empty {
            return None;
        }

        state.registry.stop(session_id, message_id);
        self.settle(&mut state, session_id, message_id, |message| {
            message.fail(EMPTY_RESPONSE)
        });
        let outcome = StreamOutcome::Failed(EMPTY_RESPONSE.to_string());
        tracing::warn!(%session_id, %message_id, %request_id, "request timed out without content");
        self.emit(ChatEvent::Settled {
            session_id,
            message_id,
            outcome: outcome.clone(),
        });
        Some(outcome)
    }

    /// Deletes the prompt/reply pair around `message_id` and sends the prompt again.
    pub fn resend(&self, session_id: SessionId, message_id: MessageId) -> Option<SendHandle> {
        let prepared = {
            let mut state = self.lock_state();
            let session = state.session_mut(session_id)?;
            let Some(index) = session.live_position(message_id) else {
                tracing::warn!(%session_id, %message_id, "resend target not found");
                return None;
            };

            let (user_index, bot_index) = match session.messages[index].role {
                Role::Assistant => {
                    let user = session.messages[..index]
                        .iter()
                        .rposition(|message| message.role == Role::User);
                    (user, Some(index))
                }
                Role::User => {
                    let bot = session.messages[index..]
                        .iter()
                        .position(|message| message.role == Role::Assistant)
                        .map(|offset| index + offset);
                    (Some(index), bot)
                }
                Role::System => (None, None),
            };
            let Some(user_index) = user_index else {
                tracing::warn!(%session_id, %message_id, "no user prompt to resend");
                return None;
            };

            let content = session.messages[user_index].content.clone();
            let user_id = session.messages[user_index].id;
            let bot_id = bot_index.map(|index| session.messages[index].id);

            for removed in [bot_id, Some(user_id)].into_iter().flatten() {
                self.remove_live(&mut state, session_id, removed);
            }
            self.prepare_send(&mut state, session_id, content)?
        };
        Some(self.launch(prepared))
    }

    fn remove_live(
        &self,
        state: &mut ChatState,
        session_id: SessionId,
        message_id: MessageId,
    ) -> bool {
        // Drop the controller first so in-flight deltas cannot land on a removed message.
        state.registry.stop(session_id, message_id);
        let removed = state
            .session_mut(session_id)
            .and_then(|session| session.remove_message(message_id))
            .is_some();
        if removed {
            self.emit(ChatEvent::MessageRemoved {
                session_id,
                message_id,
            });
        }
        removed
    }

    pub fn delete(&self, session_id: SessionId, message_id: MessageId) -> bool {
        let mut state = self.lock_state();
        self.remove_live(&mut state, session_id, message_id)
    }

    /// Replaces content in place; looks through pinned context and live messages.
    pub fn edit(&self, session_id: SessionId, message_id: MessageId, content: &str) -> bool {
        let mut state = self.lock_state();
        let Some(session) = state.session_mut(session_id) else {
            return false;
        };
        let Some(message) = session.message_mut(message_id) else {
            return false;
        };
        message.content = content.to_string();
        session.touch();
        self.emit(ChatEvent::MessageUpdated {
            session_id,
            message_id,
        });
        true
    }

    /// Copies a live message into the pinned context. Returns the id of the copy.
    pub fn pin(&self, session_id: SessionId, message_id: MessageId) -> Option<MessageId> {
        let mut state = self.lock_state();
        let session = state.session_mut(session_id)?;
        let index = session.live_position(message_id)?;

        let mut pinned = session.messages[index].clone();
        pinned.id = MessageId::generate();
        pinned.streaming = false;
        let pinned_id = pinned.id;
        session.push_context(pinned);
        self.emit(ChatEvent::MaskChanged { session_id });
        Some(pinned_id)
    }

    pub fn unpin(&self, session_id: SessionId, message_id: MessageId) -> bool {
        let mut state = self.lock_state();
        let Some(session) = state.session_mut(session_id) else {
            return false;
        };
        let removed = session.remove_context(message_id).is_some();
        if removed {
            self.emit(ChatEvent::MaskChanged { session_id });
        }
        removed
    }

    pub fn rename(&self, session_id: SessionId, topic: &str) -> bool {
        let topic = topic.trim();
        if topic.is_empty() {
            return false;
        }
        let mut state = self.lock_state();
        let Some(session) = state.session_mut(session_id) else {
            return false;
        };
        session.topic = topic.to_string();
        session.touch();
        self.emit(ChatEvent::TopicChanged {
            session_id,
            topic: topic.to_string(),
        });
        true
    }

    pub fn update_mask(&self, session_id: SessionId, update: impl FnOnce(&mut Mask)) -> bool {
        let mut state = self.lock_state();
        let Some(session) = state.session_mut(session_id) else {
            return false;
        };
        update(&mut session.mask);
        session.rebuild_index();
        session.touch();
        self.emit(ChatEvent::MaskChanged { session_id });
        true
    }

    /// Folds everything so far out of the model context, or unfolds it if the fold already
    /// sits at the end. Unfolding does not bring the old memory summary back.
    pub fn toggle_clear_context(&self, session_id: SessionId) -> Option<Option<usize>> {
        let mut state = self.lock_state();
        let session = state.session_mut(session_id)?;
        let len = session.messages.len();
        if session.clear_context_index == Some(len) {
            session.set_clear_context_index(None);
        } else {
            session.set_clear_context_index(Some(len));
        }

        let clear_context_index = session.clear_context_index;
        self.emit(ChatEvent::ContextToggled {
            session_id,
            clear_context_index,
        });
        Some(clear_context_index)
    }

    /// Sets the fold at the end unconditionally.
    pub fn clear_context(&self, session_id: SessionId) -> bool {
        let mut state = self.lock_state();
        let Some(session) = state.session_mut(session_id) else {
            return false;
        };
        session.set_clear_context_index(Some(session.messages.len()));

        let clear_context_index = session.clear_context_index;
        self.emit(ChatEvent::ContextToggled {
            session_id,
            clear_context_index,
        });
        true
    }

    /// Cancels one request, keeping whatever content already arrived.
    pub fn stop(&self, session_id: SessionId, message_id: MessageId) -> bool {
        let mut state = self.lock_state();
        if !state.registry.stop(session_id, message_id) {
            return false;
        }
        self.settle_cancelled(&mut state, session_id, message_id);
        true
    }

    /// Cancels every request and settles any message still marked as streaming.
    pub fn stop_all(&self) -> usize {
        let mut state = self.lock_state();
        let stopped = state.registry.stop_all();
        for (session_id, message_id) in &stopped {
            self.settle_cancelled(&mut state, *session_id, *message_id);
        }

        let orphans = state
            .sessions
            .iter()
            .flat_map(|session| {
                session
                    .messages
                    .iter()
                    .filter(|message| message.streaming)
                    .map(move |message| (session.id, message.id))
            })
            .collect::<Vec<_>>();
        for (session_id, message_id) in orphans {
            self.settle_cancelled(&mut state, session_id, message_id);
        }
        stopped.len()
    }

    fn settle_cancelled(
        &self,
        state: &mut ChatState,
        session_id: SessionId,
        message_id: MessageId,
    ) {
        let Some(session) = state.session_mut(session_id) else {
            return;
        };
        let cancelled = session
            .live_message_mut(message_id)
            .is_some_and(|message| message.cancel().is_ok());
        if cancelled {
            session.touch();
            self.emit(ChatEvent::Settled {
                session_id,
                message_id,
                outcome: StreamOutcome::Cancelled,
            });
        }
    }

    pub fn has_pending(&self) -> bool {
        self.lock_state().registry.has_pending()
    }

    pub fn pending_for(&self, session_id: SessionId) -> Vec<MessageId> {
        self.lock_state().registry.pending_for(session_id)
    }

    /// Routes one input line: recognized commands run locally, anything else is sent.
    pub fn submit(&self, session_id: SessionId, input: &str) -> Submission {
        if input.trim().is_empty() {
            return Submission::Ignored;
        }

        if let Some(command) = match_command(input) {
            self.run_command(session_id, &command);
            return Submission::Command(command);
        }

        match self.send(session_id, input) {
            Some(handle) => Submission::Sent(handle),
            None => Submission::Ignored,
        }
    }

    fn run_command(&self, session_id: SessionId, command: &ChatCommand) {
        tracing::debug!(%session_id, ?command, "running command");
        match command {
            ChatCommand::New { topic } => {
                let created = self.new_session(None);
                if let Some(topic) = topic {
                    self.rename(created, topic);
                }
            }
            ChatCommand::NewFromMask { mask } => match self.settings().find_mask(mask) {
                Some(mask) => {
                    self.new_session(Some(mask));
                }
                None => tracing::warn!(mask = %mask, "no mask preset with that name"),
            },
            ChatCommand::Prev => {
                self.next_session(-1);
            }
            ChatCommand::Next => {
                self.next_session(1);
            }
            ChatCommand::Clear => {
                self.clear_context(session_id);
            }
            ChatCommand::Delete => {
                let index = self
                    .lock_state()
                    .sessions
                    .iter()
                    .position(|session| session.id == session_id);
                if let Some(index) = index {
                    self.delete_session(index);
                }
            }
        }
    }
}

/// Outcome for a request whose controller is gone: stopped if the message survived,
/// dropped if it was deleted.
fn detached_outcome(
    state: &mut ChatState,
    session_id: SessionId,
    message_id: MessageId,
) -> StreamOutcome {
    let survived = state.session_mut(session_id).is_some_and(|session| {
        matches!(session.locate(message_id), Some(MessageSlot::Live(_)))
    });
    if survived {
        StreamOutcome::Cancelled
    } else {
        StreamOutcome::Dropped
    }
}
