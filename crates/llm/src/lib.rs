//! Streaming transport for murmur.
//!
//! A provider turns a [`StreamRequest`] into a [`ProviderStreamHandle`]: a worker future that
//! performs the IO, and an event stream that yields content deltas followed by exactly one
//! terminal event. The stream's [`CancelHandle`] can be detached and stored elsewhere.

use std::sync::Arc;
use std::time::Duration;

mod provider;
mod rig_adapter;
mod scripted;

pub use provider::{
    BoxFuture, CancelHandle, LlmProvider, ProviderConfig, ProviderError, ProviderEventStream,
    ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, RequestId, Role,
    StreamEvent, StreamEventPayload, StreamRequest, make_event_stream,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use scripted::{SCRIPTED_MODEL, SCRIPTED_PROVIDER_ID, Script, ScriptStep, ScriptedProvider};

const ECHO_WORD_DELAY: Duration = Duration::from_millis(40);

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        "scripted" | "echo" => Ok(Arc::new(ScriptedProvider::echo(ECHO_WORD_DELAY))),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
