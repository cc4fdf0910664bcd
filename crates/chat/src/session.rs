use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId};
use crate::message::{Message, Role, now_millis};
use crate::tokens::TokenCounter;

pub const DEFAULT_TOPIC: &str = "New Conversation";
pub const DEFAULT_MASK_NAME: &str = "Default";
pub const GREETING: &str = "Hello! How can I assist you today?";
pub const MEMORY_PROMPT_PREFIX: &str = "This is a summary of the chat history as a recap: ";

/// Per-session generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    pub send_memory: bool,
    /// `None` sends the whole history after the fold.
    pub history_message_count: Option<usize>,
    pub compress_message_length_threshold: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: murmur_llm::DEFAULT_OPENAI_MODEL.to_string(),
            temperature: 0.5,
            max_tokens: None,
            send_memory: true,
            history_message_count: Some(4),
            compress_message_length_threshold: 1000,
        }
    }
}

/// Pinned context plus model parameters for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Mask {
    pub name: String,
    pub context: Vec<Message>,
    pub model_config: ModelConfig,
    pub sync_global_config: bool,
    pub hide_context: bool,
}

impl Default for Mask {
    fn default() -> Self {
        Self::new(DEFAULT_MASK_NAME, ModelConfig::default())
    }
}

impl Mask {
    pub fn new(name: impl Into<String>, model_config: ModelConfig) -> Self {
        Self {
            name: name.into(),
            context: Vec::new(),
            model_config,
            sync_global_config: true,
            hide_context: false,
        }
    }

    pub fn with_context(mut self, context: Vec<Message>) -> Self {
        self.context = context;
        self
    }
}

/// Where a message lives inside its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSlot {
    Context(usize),
    Live(usize),
}

#[derive(Debug, Clone, Default)]
struct MessageIndex {
    slots: HashMap<MessageId, MessageSlot>,
}

impl MessageIndex {
    fn build(context: &[Message], messages: &[Message]) -> Self {
        let slots = context
            .iter()
            .enumerate()
            .map(|(index, message)| (message.id, MessageSlot::Context(index)))
            .chain(
                messages
                    .iter()
                    .enumerate()
                    .map(|(index, message)| (message.id, MessageSlot::Live(index))),
            )
            .collect();
        Self { slots }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub topic: String,
    pub messages: Vec<Message>,
    pub mask: Mask,
    #[serde(default)]
    pub clear_context_index: Option<usize>,
    #[serde(default)]
    pub memory_prompt: String,
    #[serde(default)]
    pub last_summarize_index: usize,
    pub last_update: u64,
    #[serde(skip)]
    index: MessageIndex,
    /// Bumped whenever the fold moves; in-flight summaries carry the value they started at.
    #[serde(skip)]
    fold_epoch: u64,
}

impl Session {
    /// Empty session carrying a copy of `mask`.
    pub fn new(mask: Mask) -> Self {
        Self {
            id: SessionId::generate(),
            topic: DEFAULT_TOPIC.to_string(),
            messages: Vec::new(),
            mask,
            clear_context_index: None,
            memory_prompt: String::new(),
            last_summarize_index: 0,
            last_update: now_millis(),
            index: MessageIndex::default(),
            fold_epoch: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_update = now_millis();
    }

    pub fn has_default_topic(&self) -> bool {
        self.topic == DEFAULT_TOPIC
    }

    /// Recomputes the id index. Call after restoring from a snapshot or after editing
    /// `messages` / `mask.context` directly.
    pub fn rebuild_index(&mut self) {
        self.index = MessageIndex::build(&self.mask.context, &self.messages);
    }

    /// Looks up a message across `mask.context ++ messages`.
    ///
    /// A stale index entry triggers one rebuild before giving up.
    pub fn locate(&mut self, id: MessageId) -> Option<MessageSlot> {
        if let Some(slot) = self.index.slots.get(&id).copied()
            && self.slot_holds(slot, id)
        {
            return Some(slot);
        }

        self.rebuild_index();
        self.index.slots.get(&id).copied()
    }

    fn slot_holds(&self, slot: MessageSlot, id: MessageId) -> bool {
        let message = match slot {
            MessageSlot::Context(index) => self.mask.context.get(index),
            MessageSlot::Live(index) => self.messages.get(index),
        };
        message.is_some_and(|message| message.id == id)
    }

    pub fn live_position(&mut self, id: MessageId) -> Option<usize> {
        match self.locate(id)? {
            MessageSlot::Live(index) => Some(index),
            MessageSlot::Context(_) => None,
        }
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.mask
            .context
            .iter()
            .chain(self.messages.iter())
            .find(|message| message.id == id)
    }

    pub fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        match self.locate(id)? {
            MessageSlot::Context(index) => self.mask.context.get_mut(index),
            MessageSlot::Live(index) => self.messages.get_mut(index),
        }
    }

    pub fn live_message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        let index = self.live_position(id)?;
        self.messages.get_mut(index)
    }

    pub fn push_message(&mut self, message: Message) {
        self.index
            .slots
            .insert(message.id, MessageSlot::Live(self.messages.len()));
        self.messages.push(message);
        self.touch();
    }

    pub fn remove_message(&mut self, id: MessageId) -> Option<Message> {
        let index = self.live_position(id)?;
        let removed = self.messages.remove(index);
        self.clamp_clear_context_index();
        self.rebuild_index();
        self.touch();
        Some(removed)
    }

    pub fn push_context(&mut self, message: Message) {
        self.index
            .slots
            .insert(message.id, MessageSlot::Context(self.mask.context.len()));
        self.mask.context.push(message);
        self.touch();
    }

    pub fn remove_context(&mut self, id: MessageId) -> Option<Message> {
        let MessageSlot::Context(index) = self.locate(id)? else {
            return None;
        };
        let removed = self.mask.context.remove(index);
        self.rebuild_index();
        self.touch();
        Some(removed)
    }

    pub fn clamp_clear_context_index(&mut self) {
        let len = self.messages.len();
        if let Some(index) = self.clear_context_index.as_mut()
            && *index > len
        {
            *index = len;
        }
    }

    /// Moves the fold. Setting a fold drops the memory summary, since it describes turns
    /// the model should no longer see.
    pub fn set_clear_context_index(&mut self, clear_context_index: Option<usize>) {
        self.clear_context_index = clear_context_index.map(|index| index.min(self.messages.len()));
        if self.clear_context_index.is_some() {
            self.memory_prompt.clear();
        }
        self.fold_epoch = self.fold_epoch.wrapping_add(1);
        self.touch();
    }

    pub fn fold_epoch(&self) -> u64 {
        self.fold_epoch
    }

    /// First live index the model still sees.
    pub fn fold_start(&self) -> usize {
        self.clear_context_index
            .unwrap_or(0)
            .min(self.messages.len())
    }

    pub fn needs_greeting(&self) -> bool {
        self.mask.context.is_empty()
            && self
                .messages
                .first()
                .is_none_or(|message| message.content != GREETING)
    }

    pub fn greeting() -> Message {
        Message::assistant(GREETING)
    }

    /// Context shown above the transcript, including the synthesized greeting.
    pub fn render_context(&self) -> Vec<Message> {
        let mut context = if self.mask.hide_context {
            Vec::new()
        } else {
            self.mask.context.clone()
        };
        if context.is_empty() && self.needs_greeting() {
            context.push(Self::greeting());
        }
        context
    }

    /// Model-facing history ahead of a new turn: pinned context, the memory summary, then
    /// the most recent live turns after the fold. Errors, empty content and in-flight
    /// messages are left out. Senders append the new user turn after this window.
    pub fn effective_context(&self) -> Vec<Message> {
        let config = &self.mask.model_config;
        let mut request = self.mask.context.clone();

        if config.send_memory && !self.memory_prompt.trim().is_empty() {
            request.push(Message::system(format!(
                "{MEMORY_PROMPT_PREFIX}{}",
                self.memory_prompt
            )));
        }

        let recent = self.messages[self.fold_start()..]
            .iter()
            .filter(|message| {
                !message.streaming && !message.is_error && !message.content.trim().is_empty()
            })
            .collect::<Vec<_>>();
        let keep = config
            .history_message_count
            .map_or(recent.len(), |count| count.min(recent.len()));
        request.extend(recent[recent.len() - keep..].iter().map(|&message| message.clone()));

        request
    }

    /// Live messages since the last summary or fold, whichever is later.
    pub fn unsummarized_messages(&self) -> &[Message] {
        let start = self
            .last_summarize_index
            .max(self.fold_start())
            .min(self.messages.len());
        &self.messages[start..]
    }

    pub fn estimated_tokens(&self, counter: &dyn TokenCounter) -> usize {
        self.messages
            .iter()
            .map(|message| counter.count_tokens(&message.content))
            .sum()
    }

    pub fn has_full_exchange(&self) -> bool {
        let settled = |role: Role| {
            self.messages
                .iter()
                .any(|message| message.role == role && message.is_final())
        };
        settled(Role::User) && settled(Role::Assistant)
    }
}
