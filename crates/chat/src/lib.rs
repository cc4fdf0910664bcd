//! Chat session and streaming-response engine.
//!
//! [`ChatManager`] owns the sessions, a controller registry with one cancel handle per
//! in-flight reply, and the render windows. Replies stream from a
//! [`murmur_llm::LlmProvider`]; every mutation is applied under one lock and announced on a
//! broadcast channel of [`ChatEvent`]s.

mod atomic;
mod commands;
mod error;
mod events;
mod ids;
mod manager;
mod message;
mod mutations;
mod registry;
mod session;
mod settings;
mod store;
mod streaming;
mod summary;
mod tokens;
mod view;
mod window;

pub use commands::{
    COMMAND_PREFIX, ChatCommand, CommandSpec, commands, match_command, search_commands,
};
pub use error::{AtomicWriteError, IdError, IdResult, StoreError, StoreResult};
pub use events::ChatEvent;
pub use ids::{MessageId, SessionId};
pub use manager::{ChatManager, ChatManagerBuilder};
pub use message::{Message, Role, now_millis};
pub use mutations::{SendHandle, Submission};
pub use registry::{ControllerKey, ControllerRegistry};
pub use session::{
    DEFAULT_MASK_NAME, DEFAULT_TOPIC, GREETING, MEMORY_PROMPT_PREFIX, Mask, MessageSlot,
    ModelConfig, Session,
};
pub use settings::{
    ChatSettings, DEFAULT_CHAT_PAGE_SIZE, DEFAULT_REQUEST_TIMEOUT_MS, SettingsError,
    SettingsStore,
};
pub use store::{JsonFileStore, SessionSnapshot, SessionStore};
pub use streaming::{
    EMPTY_RESPONSE, STREAM_ENDED_EARLY, StreamOutcome, StreamPhase, StreamRejection,
    TransitionResult, error_payload, reconcile_stale,
};
pub use summary::{ProviderSummarizer, Summarizer, SummaryError, SummaryResult, trim_topic};
pub use tokens::{EstimatingTokenCounter, TokenCounter};
pub use view::RenderedSlice;
pub use window::{
    PREVIEW_PLACEHOLDER, Previews, RenderRow, RenderWindow, RowKind, ScrollMetrics, compose,
};
