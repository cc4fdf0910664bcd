use serde::Serialize;
use snafu::Snafu;

use crate::ids::MessageId;
use crate::message::Message;
use crate::session::Session;

pub const EMPTY_RESPONSE: &str = "empty response";
pub const STREAM_ENDED_EARLY: &str = "provider stream ended before a terminal event";

/// Observable lifecycle of one assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Pending,
    Accumulating,
    Settled,
    Failed,
}

/// How a request ended, as seen by whoever awaits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(String),
    /// The message or its registry entry vanished before the stream ended.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum StreamRejection {
    #[snafu(display("message {message_id} is not streaming"))]
    NotStreaming { message_id: MessageId },
}

pub type TransitionResult = Result<(), StreamRejection>;

#[derive(Serialize)]
struct ErrorPayload<'a> {
    error: bool,
    message: &'a str,
}

/// Fenced JSON block carrying a human-readable reason and a machine-readable flag.
pub fn error_payload(reason: &str) -> String {
    let body = serde_json::to_string_pretty(&ErrorPayload {
        error: true,
        message: reason,
    })
    .unwrap_or_else(|_| format!("{{\"error\": true, \"message\": {reason:?}}}"));
    format!("```json\n{body}\n```")
}

impl Message {
    pub fn phase(&self) -> StreamPhase {
        match (self.streaming, self.is_error) {
            (true, _) if self.content.is_empty() => StreamPhase::Pending,
            (true, _) => StreamPhase::Accumulating,
            (false, true) => StreamPhase::Failed,
            (false, false) => StreamPhase::Settled,
        }
    }

    fn ensure_streaming(&self) -> TransitionResult {
        if self.streaming {
            Ok(())
        } else {
            NotStreamingSnafu {
                message_id: self.id,
            }
            .fail()
        }
    }

    pub fn apply_delta(&mut self, delta: &str) -> TransitionResult {
        self.ensure_streaming()?;
        self.content.push_str(delta);
        Ok(())
    }

    pub fn complete(&mut self) -> TransitionResult {
        self.ensure_streaming()?;
        self.streaming = false;
        Ok(())
    }

    /// User stop: accumulated content is kept as-is.
    pub fn cancel(&mut self) -> TransitionResult {
        self.ensure_streaming()?;
        self.streaming = false;
        Ok(())
    }

    /// Transport failure. Partial content stays and the payload follows it.
    pub fn fail(&mut self, reason: &str) -> TransitionResult {
        self.ensure_streaming()?;
        self.streaming = false;
        self.is_error = true;
        let payload = error_payload(reason);
        if self.content.is_empty() {
            self.content = payload;
        } else {
            self.content.push_str("\n\n");
            self.content.push_str(&payload);
        }
        Ok(())
    }

    /// Staleness: empty messages fail, partial ones are kept as final.
    pub fn expire(&mut self) -> TransitionResult {
        self.ensure_streaming()?;
        self.streaming = false;
        if self.content.is_empty() {
            self.is_error = true;
            self.content = error_payload(EMPTY_RESPONSE);
        }
        Ok(())
    }
}

/// Settles messages left streaming longer than `timeout_ms` and back-fills empty error
/// messages. `is_live` marks messages whose request is still registered; those are left
/// for the stream pump.
pub fn reconcile_stale(
    session: &mut Session,
    now: u64,
    timeout_ms: u64,
    is_live: impl Fn(MessageId) -> bool,
) -> Vec<MessageId> {
    let cutoff = now.saturating_sub(timeout_ms);
    let mut touched = Vec::new();

    for message in &mut session.messages {
        if message.streaming && !is_live(message.id) && (message.is_error || message.date < cutoff)
        {
            if message.expire().is_ok() {
                touched.push(message.id);
            }
            continue;
        }

        if message.is_error && !message.streaming && message.content.trim().is_empty() {
            message.content = error_payload(EMPTY_RESPONSE);
            touched.push(message.id);
        }
    }

    if !touched.is_empty() {
        tracing::debug!(
            session_id = %session.id,
            reconciled = touched.len(),
            "reconciled stale messages"
        );
        session.touch();
    }
    touched
}
