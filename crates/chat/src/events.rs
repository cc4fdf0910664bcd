use crate::ids::{MessageId, SessionId};
use crate::streaming::StreamOutcome;

/// Notifications broadcast to hosts after a mutation has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    SessionCreated {
        session_id: SessionId,
    },
    /// The active session changed.
    SessionSelected {
        session_id: SessionId,
        index: usize,
    },
    SessionDeleted {
        session_id: SessionId,
    },
    MessageAppended {
        session_id: SessionId,
        message_id: MessageId,
    },
    MessageUpdated {
        session_id: SessionId,
        message_id: MessageId,
    },
    MessageRemoved {
        session_id: SessionId,
        message_id: MessageId,
    },
    Delta {
        session_id: SessionId,
        message_id: MessageId,
        delta: String,
    },
    Settled {
        session_id: SessionId,
        message_id: MessageId,
        outcome: StreamOutcome,
    },
    ContextToggled {
        session_id: SessionId,
        clear_context_index: Option<usize>,
    },
    MaskChanged {
        session_id: SessionId,
    },
    TopicChanged {
        session_id: SessionId,
        topic: String,
    },
    MemoryUpdated {
        session_id: SessionId,
    },
}

impl ChatEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::SessionCreated { session_id }
            | Self::SessionSelected { session_id, .. }
            | Self::SessionDeleted { session_id }
            | Self::MessageAppended { session_id, .. }
            | Self::MessageUpdated { session_id, .. }
            | Self::MessageRemoved { session_id, .. }
            | Self::Delta { session_id, .. }
            | Self::Settled { session_id, .. }
            | Self::ContextToggled { session_id, .. }
            | Self::MaskChanged { session_id }
            | Self::TopicChanged { session_id, .. }
            | Self::MemoryUpdated { session_id } => *session_id,
        }
    }
}
