use std::ops::Range;

use crate::message::{Message, Role};
use crate::session::Session;

pub const PREVIEW_PLACEHOLDER: &str = "……";
/// Distance from the end that still counts as sitting at the bottom.
const HIT_BOTTOM_THRESHOLD: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Context,
    Greeting,
    Live,
    /// Placeholder for an assistant reply that has not produced content yet.
    LoadingPreview,
    /// The user's unsent draft.
    DraftPreview,
}

impl RowKind {
    pub fn is_preview(self) -> bool {
        matches!(self, Self::LoadingPreview | Self::DraftPreview)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRow {
    /// Position in the full logical sequence.
    pub index: usize,
    pub kind: RowKind,
    pub message: Message,
    /// Whether stop/retry/delete/pin apply to this row.
    pub show_actions: bool,
}

/// Ephemeral rows appended after the live transcript.
#[derive(Debug, Clone, Default)]
pub struct Previews<'a> {
    pub loading: bool,
    pub draft: Option<&'a str>,
    pub send_preview_bubble: bool,
}

/// Full logical sequence: rendered context, live messages, then previews.
pub fn compose(session: &Session, previews: &Previews<'_>) -> Vec<RenderRow> {
    let context = session.render_context();
    let greeting_only = session.mask.context.is_empty();

    let mut rows = Vec::with_capacity(context.len() + session.messages.len() + 2);
    for message in context {
        let kind = if greeting_only {
            RowKind::Greeting
        } else {
            RowKind::Context
        };
        rows.push((kind, message));
    }
    rows.extend(
        session
            .messages
            .iter()
            .cloned()
            .map(|message| (RowKind::Live, message)),
    );
    if previews.loading {
        rows.push((
            RowKind::LoadingPreview,
            Message::new(Role::Assistant, PREVIEW_PLACEHOLDER),
        ));
    }
    if previews.send_preview_bubble
        && let Some(draft) = previews.draft.filter(|draft| !draft.trim().is_empty())
    {
        rows.push((RowKind::DraftPreview, Message::new(Role::User, draft)));
    }

    rows.into_iter()
        .enumerate()
        .map(|(index, (kind, message))| {
            let show_actions = index > 0
                && !kind.is_preview()
                && !message.content.is_empty()
                && matches!(kind, RowKind::Live);
            RenderRow {
                index,
                kind,
                message,
                show_actions,
            }
        })
        .collect()
}

/// Scroll position reported by the host, in any consistent unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub client_height: f64,
    pub scroll_height: f64,
}

impl ScrollMetrics {
    pub fn near_top(&self) -> bool {
        self.scroll_top <= self.client_height
    }

    pub fn near_bottom(&self) -> bool {
        self.scroll_top + self.client_height >= self.scroll_height - self.client_height
    }

    pub fn hit_bottom(&self) -> bool {
        self.scroll_top + self.client_height >= self.scroll_height - HIT_BOTTOM_THRESHOLD
    }
}

/// Sliding window of at most three pages over the logical sequence.
///
/// The window never mutates the sequence; hosts pass the current length on every call so
/// the bounds stay valid while the transcript grows or shrinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderWindow {
    page_size: usize,
    start: usize,
    follow_bottom: bool,
}

impl RenderWindow {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            start: 0,
            follow_bottom: true,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn is_following_bottom(&self) -> bool {
        self.follow_bottom
    }

    /// Shows the most recent page.
    pub fn mount(&mut self, len: usize) {
        self.follow_bottom = true;
        self.set_start(len, len.saturating_sub(self.page_size));
    }

    fn set_start(&mut self, len: usize, start: usize) {
        self.start = start.min(len.saturating_sub(self.page_size));
    }

    pub fn range(&self, len: usize) -> Range<usize> {
        let start = self.start.min(len.saturating_sub(self.page_size));
        start..(start + self.page_size * 3).min(len)
    }

    pub fn slice<'a, T>(&self, rows: &'a [T]) -> &'a [T] {
        &rows[self.range(rows.len())]
    }

    /// Pages older rows in. Paging up always leaves bottom-follow mode.
    pub fn on_near_top(&mut self, len: usize) {
        self.follow_bottom = false;
        self.set_start(len, self.start.saturating_sub(self.page_size));
    }

    pub fn on_near_bottom(&mut self, len: usize) {
        self.set_start(len, self.start + self.page_size);
    }

    pub fn scroll_to_bottom(&mut self, len: usize) {
        self.mount(len);
    }

    pub fn on_scroll(&mut self, metrics: ScrollMetrics, len: usize) {
        self.follow_bottom = metrics.hit_bottom();
        let near_bottom = metrics.near_bottom();
        if metrics.near_top() && !near_bottom {
            self.on_near_top(len);
        } else if near_bottom {
            self.on_near_bottom(len);
        }
    }

    /// Re-clamps after the sequence changed, keeping the tail in view while following.
    pub fn sync(&mut self, len: usize) {
        if self.follow_bottom {
            self.set_start(len, len.saturating_sub(self.page_size));
        } else {
            self.set_start(len, self.start);
        }
    }

    /// Slice row after which the folded-context divider is drawn.
    pub fn divider_row(
        &self,
        clear_context_index: Option<usize>,
        context_len: usize,
        len: usize,
    ) -> Option<usize> {
        let range = self.range(len);
        let position = (clear_context_index? + context_len).checked_sub(range.start)?;
        let row = position.checked_sub(1)?;
        (row < range.len()).then_some(row)
    }
}
