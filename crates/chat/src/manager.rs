use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use murmur_llm::{LlmProvider, RequestId};
use tokio::sync::broadcast;

use crate::events::ChatEvent;
use crate::ids::SessionId;
use crate::message::now_millis;
use crate::registry::ControllerRegistry;
use crate::session::{Mask, Session};
use crate::settings::{ChatSettings, SettingsStore};
use crate::store::SessionSnapshot;
use crate::streaming::reconcile_stale;
use crate::summary::Summarizer;
use crate::tokens::{EstimatingTokenCounter, TokenCounter};
use crate::view::SessionView;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything guarded by the single writer lock.
pub(crate) struct ChatState {
    pub(crate) sessions: Vec<Session>,
    pub(crate) current_index: usize,
    pub(crate) registry: ControllerRegistry,
    pub(crate) views: HashMap<SessionId, SessionView>,
}

impl ChatState {
    pub(crate) fn session_mut(&mut self, session_id: SessionId) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|session| session.id == session_id)
    }

    pub(crate) fn session(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == session_id)
    }

    fn position(&self, session_id: SessionId) -> Option<usize> {
        self.sessions
            .iter()
            .position(|session| session.id == session_id)
    }
}

pub(crate) struct ChatInner {
    pub(crate) state: Mutex<ChatState>,
    pub(crate) provider: Arc<dyn LlmProvider>,
    pub(crate) settings: Arc<SettingsStore>,
    pub(crate) summarizer: Option<Arc<dyn Summarizer>>,
    pub(crate) token_counter: Arc<dyn TokenCounter>,
    pub(crate) events: broadcast::Sender<ChatEvent>,
    next_request_id: AtomicU64,
}

/// Owns every session, the controller registry and the render windows.
///
/// Cloning is cheap and every clone drives the same state. All mutations run inside one
/// critical section, so readers never observe a half-applied change.
#[derive(Clone)]
pub struct ChatManager {
    pub(crate) inner: Arc<ChatInner>,
}

pub struct ChatManagerBuilder {
    provider: Arc<dyn LlmProvider>,
    settings: Arc<SettingsStore>,
    summarizer: Option<Arc<dyn Summarizer>>,
    token_counter: Arc<dyn TokenCounter>,
    snapshot: Option<SessionSnapshot>,
}

impl ChatManagerBuilder {
    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn token_counter(mut self, token_counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = token_counter;
        self
    }

    pub fn snapshot(mut self, snapshot: SessionSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn build(self) -> ChatManager {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = ChatManager {
            inner: Arc::new(ChatInner {
                state: Mutex::new(ChatState {
                    sessions: Vec::new(),
                    current_index: 0,
                    registry: ControllerRegistry::new(),
                    views: HashMap::new(),
                }),
                provider: self.provider,
                settings: self.settings,
                summarizer: self.summarizer,
                token_counter: self.token_counter,
                events,
                next_request_id: AtomicU64::new(1),
            }),
        };
        manager.restore(self.snapshot.unwrap_or_default());
        manager
    }
}

impl ChatManager {
    pub fn builder(
        provider: Arc<dyn LlmProvider>,
        settings: Arc<SettingsStore>,
    ) -> ChatManagerBuilder {
        ChatManagerBuilder {
            provider,
            settings,
            summarizer: None,
            token_counter: Arc::new(EstimatingTokenCounter),
            snapshot: None,
        }
    }

    pub fn new(provider: Arc<dyn LlmProvider>, settings: Arc<SettingsStore>) -> Self {
        Self::builder(provider, settings).build()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ChatState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId::new(self.inner.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.events.subscribe()
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.inner.settings.settings()
    }

    pub fn provider(&self) -> Arc<dyn LlmProvider> {
        self.inner.provider.clone()
    }

    pub fn token_counter(&self) -> Arc<dyn TokenCounter> {
        self.inner.token_counter.clone()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.lock_state().sessions.clone()
    }

    pub fn session(&self, session_id: SessionId) -> Option<Session> {
        self.lock_state().session(session_id).cloned()
    }

    /// Runs `read` against one session without cloning it.
    pub fn with_session<R>(
        &self,
        session_id: SessionId,
        read: impl FnOnce(&Session) -> R,
    ) -> Option<R> {
        self.lock_state().session(session_id).map(read)
    }

    pub fn session_count(&self) -> usize {
        self.lock_state().sessions.len()
    }

    pub fn current_index(&self) -> usize {
        self.lock_state().current_index
    }

    pub fn current_session_id(&self) -> SessionId {
        let state = self.lock_state();
        state.sessions[state.current_index].id
    }

    pub fn current_session(&self) -> Session {
        let state = self.lock_state();
        state.sessions[state.current_index].clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock_state();
        SessionSnapshot {
            sessions: state.sessions.clone(),
            current_session_index: state.current_index,
        }
    }

    /// Replaces the session set, cancelling anything in flight. An empty snapshot yields
    /// one fresh session.
    pub fn restore(&self, snapshot: SessionSnapshot) {
        let settings = self.settings();
        let mut state = self.lock_state();
        state.registry.stop_all();
        state.views.clear();

        state.sessions = snapshot.sessions;
        for session in &mut state.sessions {
            session.clamp_clear_context_index();
            session.rebuild_index();
        }
        if state.sessions.is_empty() {
            state.sessions.push(Session::new(settings.default_mask()));
        }
        state.current_index = snapshot
            .current_session_index
            .min(state.sessions.len() - 1);

        let index = state.current_index;
        self.activate(&mut state, &settings, index);
        tracing::debug!(
            sessions = state.sessions.len(),
            current_index = index,
            "restored sessions"
        );
    }

    /// Makes `index` current: settles stale messages and refreshes a synced model config.
    fn activate(&self, state: &mut ChatState, settings: &ChatSettings, index: usize) {
        state.current_index = index;
        let ChatState {
            sessions, registry, ..
        } = state;
        let Some(session) = sessions.get_mut(index) else {
            return;
        };

        let session_id = session.id;
        let touched = reconcile_stale(
            session,
            now_millis(),
            settings.request_timeout_ms,
            |message_id| registry.contains(session_id, message_id),
        );
        if session.mask.sync_global_config && session.mask.model_config != settings.model_config
        {
            session.mask.model_config = settings.model_config.clone();
        }

        for message_id in touched {
            self.emit(ChatEvent::MessageUpdated {
                session_id,
                message_id,
            });
        }
        self.emit(ChatEvent::SessionSelected { session_id, index });
    }

    /// Inserts a session at the front and makes it current.
    pub fn new_session(&self, mask: Option<Mask>) -> SessionId {
        let settings = self.settings();
        let mask = mask.unwrap_or_else(|| settings.default_mask());
        let session = Session::new(mask);
        let session_id = session.id;

        let mut state = self.lock_state();
        state.sessions.insert(0, session);
        self.emit(ChatEvent::SessionCreated { session_id });
        self.activate(&mut state, &settings, 0);
        tracing::debug!(%session_id, "created session");
        session_id
    }

    pub fn select_session(&self, index: usize) -> Option<SessionId> {
        let settings = self.settings();
        let mut state = self.lock_state();
        let session_id = state.sessions.get(index)?.id;
        self.activate(&mut state, &settings, index);
        Some(session_id)
    }

    pub fn select_session_id(&self, session_id: SessionId) -> bool {
        let index = self.lock_state().position(session_id);
        index.is_some_and(|index| self.select_session(index).is_some())
    }

    /// Moves the cursor by `delta`, wrapping at both ends.
    pub fn next_session(&self, delta: isize) -> SessionId {
        let settings = self.settings();
        let mut state = self.lock_state();
        let count = state.sessions.len() as isize;
        let index = (state.current_index as isize + delta).rem_euclid(count) as usize;
        self.activate(&mut state, &settings, index);
        state.sessions[index].id
    }

    /// Removes a session and cancels its requests. The last session is replaced by a fresh
    /// one rather than leaving the set empty.
    pub fn delete_session(&self, index: usize) -> Option<SessionId> {
        let settings = self.settings();
        let mut state = self.lock_state();
        if index >= state.sessions.len() {
            return None;
        }

        let removed = state.sessions.remove(index);
        let cancelled = state.registry.stop_session(removed.id);
        state.views.remove(&removed.id);
        tracing::debug!(
            session_id = %removed.id,
            cancelled = cancelled.len(),
            "deleted session"
        );
        self.emit(ChatEvent::SessionDeleted {
            session_id: removed.id,
        });

        if state.sessions.is_empty() {
            let fresh = Session::new(settings.default_mask());
            self.emit(ChatEvent::SessionCreated {
                session_id: fresh.id,
            });
            state.sessions.push(fresh);
        }

        let current = state.current_index;
        let next = current
            .saturating_sub(usize::from(index < current))
            .min(state.sessions.len() - 1);
        self.activate(&mut state, &settings, next);
        Some(removed.id)
    }
}
