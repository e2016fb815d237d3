use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use url::Url;

use super::{ListView, Navigator};
use crate::core::models::InboxMessage;
use crate::core::sync::{InboxSyncEngine, SyncError, SyncResult};

const EMPTY_HINT: &str = "No inbox messages. Pull to fetch messages...";
const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListState {
    /// Not refreshing. `last_error` backs the transient banner.
    Idle { last_error: Option<String> },
    Refreshing,
}

#[derive(Debug)]
pub enum ListEvent {
    RefreshFinished(SyncResult),
}

/// One bound list row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: String,
    pub subject: String,
    pub preview: String,
    pub date: String,
    pub unread: bool,
    pub icon_url: Option<Url>,
}

impl Row {
    fn from_message(m: &InboxMessage) -> Self {
        Row {
            id: m.id.clone(),
            subject: m.subject.clone(),
            preview: preview(&m.content),
            date: format_date(m.received_at),
            unread: !m.is_read,
            icon_url: m.icon_url.clone(),
        }
    }
}

/// Everything a list surface needs for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListViewState {
    pub rows: Vec<Row>,
    pub refreshing: bool,
    pub banner: Option<String>,
    pub empty_hint: Option<&'static str>,
    pub unread: usize,
}

pub struct InboxListPresenter<V, N> {
    engine: InboxSyncEngine,
    view: V,
    navigator: N,
    state: ListState,
    events: mpsc::UnboundedSender<ListEvent>,
    now: fn() -> DateTime<Utc>,
}

impl<V: ListView, N: Navigator> InboxListPresenter<V, N> {
    pub fn new(
        engine: InboxSyncEngine,
        view: V,
        navigator: N,
    ) -> (Self, mpsc::UnboundedReceiver<ListEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let presenter = InboxListPresenter {
            engine,
            view,
            navigator,
            state: ListState::Idle { last_error: None },
            events,
            now: Utc::now,
        };
        (presenter, rx)
    }

    /// Replace the wall clock used for expiry filtering.
    pub fn with_clock(mut self, now: fn() -> DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn state(&self) -> &ListState {
        &self.state
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    /// View became visible: refresh only when there is nothing to show.
    pub fn on_appear(&mut self) {
        if self.engine.store().is_empty() {
            self.on_pull_to_refresh();
        } else {
            self.render();
        }
    }

    /// Start a refresh. Returns false if one is already running.
    pub fn on_pull_to_refresh(&mut self) -> bool {
        if self.state == ListState::Refreshing {
            log::debug!("Pull to refresh ignored, already refreshing");
            return false;
        }
        self.state = ListState::Refreshing;
        self.render();

        let engine = self.engine.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = engine.refresh().await;
            // Receiver gone means the list was torn down; the store is
            // updated either way.
            let _ = events.send(ListEvent::RefreshFinished(result));
        });
        true
    }

    pub fn handle(&mut self, event: ListEvent) {
        match event {
            ListEvent::RefreshFinished(Ok(result)) => {
                log::debug!(
                    "List refreshed (+{} ~{} -{})",
                    result.added,
                    result.updated,
                    result.removed
                );
                self.state = ListState::Idle { last_error: None };
            }
            ListEvent::RefreshFinished(Err(e)) => {
                let banner = match e {
                    SyncError::Transient(_) => "Couldn't reach the inbox. Pull to try again.",
                    SyncError::Invalid(_) => "The inbox sent something unexpected.",
                };
                self.state = ListState::Idle {
                    last_error: Some(banner.to_string()),
                };
            }
        }
        self.render();
    }

    pub fn dismiss_error(&mut self) {
        if let ListState::Idle { last_error } = &mut self.state {
            if last_error.take().is_some() {
                self.render();
            }
        }
    }

    pub fn row_count(&self) -> usize {
        self.visible().len()
    }

    pub fn row_at(&self, index: usize) -> Option<Row> {
        self.visible().get(index).map(Row::from_message)
    }

    /// Hand the selected message to navigation.
    pub fn on_select(&mut self, index: usize) -> Option<String> {
        let id = self.visible().get(index)?.id.clone();
        self.navigator.open_detail(&id);
        Some(id)
    }

    pub fn render(&mut self) {
        let now = (self.now)();
        let rows: Vec<Row> = self
            .engine
            .store()
            .list_visible(now)
            .iter()
            .map(Row::from_message)
            .collect();
        let banner = match &self.state {
            ListState::Idle { last_error } => last_error.clone(),
            ListState::Refreshing => None,
        };
        let state = ListViewState {
            empty_hint: rows.is_empty().then_some(EMPTY_HINT),
            refreshing: self.state == ListState::Refreshing,
            unread: self.engine.store().unread_count(now),
            rows,
            banner,
        };
        self.view.render(&state);
    }

    fn visible(&self) -> Vec<InboxMessage> {
        self.engine.store().list_visible((self.now)())
    }
}

fn preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or("").trim();
    if line.chars().count() <= PREVIEW_CHARS {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(PREVIEW_CHARS - 1).collect();
    cut.push('…');
    cut
}

pub(crate) fn format_date(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
