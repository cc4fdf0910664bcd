use std::collections::HashMap;

use murmur_llm::{CancelHandle, RequestId};

use crate::ids::{MessageId, SessionId};

pub type ControllerKey = (SessionId, MessageId);

/// One cancellation handle per in-flight generation, keyed by the assistant message it
/// fills. Entries exist only between dispatch and termination.
#[derive(Debug, Default)]
pub struct ControllerRegistry {
    controllers: HashMap<ControllerKey, CancelHandle>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, session_id: SessionId, message_id: MessageId, handle: CancelHandle) {
        if let Some(stale) = self.controllers.insert((session_id, message_id), handle) {
            tracing::warn!(
                %session_id,
                %message_id,
                stale_request_id = %stale.request_id(),
                "replaced an existing controller; cancelling the stale request"
            );
            stale.cancel();
        }
    }

    /// Cancels and removes the entry. Returns false when nothing was registered.
    pub fn stop(&mut self, session_id: SessionId, message_id: MessageId) -> bool {
        let Some(handle) = self.controllers.remove(&(session_id, message_id)) else {
            return false;
        };
        let signalled = handle.cancel();
        tracing::debug!(%session_id, %message_id, signalled, "stopped request");
        true
    }

    pub fn stop_all(&mut self) -> Vec<ControllerKey> {
        self.drain_matching(|_| true)
    }

    pub fn stop_session(&mut self, session_id: SessionId) -> Vec<ControllerKey> {
        self.drain_matching(|(owner, _)| *owner == session_id)
    }

    fn drain_matching(&mut self, keep: impl Fn(&ControllerKey) -> bool) -> Vec<ControllerKey> {
        let keys = self
            .controllers
            .keys()
            .filter(|key| keep(key))
            .copied()
            .collect::<Vec<_>>();
        for key in &keys {
            if let Some(handle) = self.controllers.remove(key) {
                handle.cancel();
            }
        }
        keys
    }

    /// Natural completion path; the handle is dropped without signalling.
    pub fn remove(&mut self, session_id: SessionId, message_id: MessageId) -> bool {
        self.controllers.remove(&(session_id, message_id)).is_some()
    }

    pub fn has_pending(&self) -> bool {
        !self.controllers.is_empty()
    }

    pub fn contains(&self, session_id: SessionId, message_id: MessageId) -> bool {
        self.controllers.contains_key(&(session_id, message_id))
    }

    /// True when the key is registered for this exact request.
    pub fn owns(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        request_id: RequestId,
    ) -> bool {
        self.controllers
            .get(&(session_id, message_id))
            .is_some_and(|handle| handle.request_id() == request_id)
    }

    pub fn pending_for(&self, session_id: SessionId) -> Vec<MessageId> {
        self.controllers
            .keys()
            .filter(|(owner, _)| *owner == session_id)
            .map(|(_, message_id)| *message_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use murmur_llm::make_event_stream;
    use tokio::sync::oneshot;

    use super::*;

    fn handle(raw: u64) -> (CancelHandle, oneshot::Receiver<()>) {
        let (_event_tx, mut stream, cancel_rx) = make_event_stream(RequestId::new(raw));
        let handle = stream
            .take_cancel_handle()
            .expect("fresh stream owns its cancel handle");
        (handle, cancel_rx)
    }

    #[test]
    fn stop_signals_and_removes_once() {
        let mut registry = ControllerRegistry::new();
        let session = SessionId::generate();
        let message = MessageId::generate();
        let (cancel, mut cancel_rx) = handle(1);
        registry.add(session, message, cancel);
        assert!(registry.has_pending());

        assert!(registry.stop(session, message));
        assert!(cancel_rx.try_recv().is_ok());
        assert!(!registry.stop(session, message));
        assert!(!registry.has_pending());
    }

    #[test]
    fn remove_does_not_signal() {
        let mut registry = ControllerRegistry::new();
        let session = SessionId::generate();
        let message = MessageId::generate();
        let (cancel, mut cancel_rx) = handle(2);
        registry.add(session, message, cancel);

        assert!(registry.remove(session, message));
        // Dropped sender closes the channel without a value.
        assert!(matches!(
            cancel_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn overwrite_cancels_stale_handle() {
        let mut registry = ControllerRegistry::new();
        let session = SessionId::generate();
        let message = MessageId::generate();
        let (stale, mut stale_rx) = handle(3);
        let (fresh, _fresh_rx) = handle(4);

        registry.add(session, message, stale);
        registry.add(session, message, fresh);

        assert!(stale_rx.try_recv().is_ok());
        assert_eq!(registry.len(), 1);
        assert!(registry.owns(session, message, RequestId::new(4)));
        assert!(!registry.owns(session, message, RequestId::new(3)));
    }

    #[test]
    fn stop_session_leaves_other_sessions_running() {
        let mut registry = ControllerRegistry::new();
        let first = SessionId::generate();
        let second = SessionId::generate();
        let (a, _a_rx) = handle(5);
        let (b, _b_rx) = handle(6);
        let (c, _c_rx) = handle(7);
        registry.add(first, MessageId::generate(), a);
        registry.add(first, MessageId::generate(), b);
        let survivor = MessageId::generate();
        registry.add(second, survivor, c);

        assert_eq!(registry.stop_session(first).len(), 2);
        assert!(registry.pending_for(first).is_empty());
        assert_eq!(registry.pending_for(second), vec![survivor]);

        assert_eq!(registry.stop_all().len(), 1);
        assert!(registry.is_empty());
    }
}
