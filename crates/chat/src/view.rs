use crate::ids::SessionId;
use crate::manager::{ChatManager, ChatState};
use crate::window::{Previews, RenderRow, RenderWindow, ScrollMetrics, compose};

/// Per-session window plus the sequence length it was last synced against.
#[derive(Debug, Clone)]
pub(crate) struct SessionView {
    window: RenderWindow,
    len: usize,
}

/// The materialized part of a session's transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSlice {
    pub rows: Vec<RenderRow>,
    /// Logical index of the first row.
    pub start: usize,
    /// Length of the full logical sequence.
    pub total: usize,
    /// Row in `rows` after which the folded-context divider goes.
    pub divider_after: Option<usize>,
    pub following_bottom: bool,
}

impl ChatManager {
    /// Current slice of a session, with an optional unsent draft shown as a preview.
    pub fn render(&self, session_id: SessionId, draft: Option<&str>) -> Option<RenderedSlice> {
        let settings = self.settings();
        let mut state = self.lock_state();
        let ChatState {
            sessions,
            registry,
            views,
            ..
        } = &mut *state;
        let session = sessions.iter().find(|session| session.id == session_id)?;

        let loading = registry.pending_for(session_id).into_iter().any(|message_id| {
            session
                .message(message_id)
                .is_some_and(|message| message.content.is_empty())
        });
        let rows = compose(
            session,
            &Previews {
                loading,
                draft,
                send_preview_bubble: settings.send_preview_bubble,
            },
        );
        let total = rows.len();
        let context_len = session.render_context().len();

        let view = views.entry(session_id).or_insert_with(|| {
            let mut window = RenderWindow::new(settings.chat_page_size);
            window.mount(total);
            SessionView { window, len: total }
        });
        view.len = total;
        view.window.sync(total);

        let range = view.window.range(total);
        Some(RenderedSlice {
            start: range.start,
            total,
            divider_after: view.window.divider_row(
                session.clear_context_index,
                context_len,
                total,
            ),
            following_bottom: view.window.is_following_bottom(),
            rows: rows[range].to_vec(),
        })
    }

    fn with_view(&self, session_id: SessionId, update: impl FnOnce(&mut RenderWindow, usize)) {
        let mut state = self.lock_state();
        if let Some(view) = state.views.get_mut(&session_id) {
            let len = view.len;
            update(&mut view.window, len);
        }
    }

    /// Scrolled close to the top: page older rows in.
    pub fn on_near_top(&self, session_id: SessionId) {
        self.with_view(session_id, |window, len| window.on_near_top(len));
    }

    /// Scrolled close to the bottom: page newer rows in.
    pub fn on_near_bottom(&self, session_id: SessionId) {
        self.with_view(session_id, |window, len| window.on_near_bottom(len));
    }

    pub fn on_scroll(&self, session_id: SessionId, metrics: ScrollMetrics) {
        self.with_view(session_id, |window, len| window.on_scroll(metrics, len));
    }

    pub fn scroll_to_bottom(&self, session_id: SessionId) {
        self.with_view(session_id, |window, len| window.scroll_to_bottom(len));
    }
}
