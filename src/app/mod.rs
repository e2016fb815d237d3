//! Presenters for the inbox list and message detail screens.
//!
//! Presenters live on the UI context and are driven through `&mut self`.
//! Async work they start reports back over a channel; the owner feeds each
//! event into `handle` on the same context.

mod detail;
mod list;

pub use detail::{DetailEvent, DetailState, IconState, InboxDetailPresenter};
pub use list::{InboxListPresenter, ListEvent, ListState, ListViewState, Row};
pub(crate) use list::format_date;

/// Anything that can draw the inbox list.
pub trait ListView {
    fn render(&mut self, state: &ListViewState);
}

/// Anything that can draw a single message.
pub trait DetailView {
    fn render(&mut self, state: &DetailState);
}

/// Routes a selected row to the detail screen.
pub trait Navigator {
    fn open_detail(&mut self, id: &str);
}
